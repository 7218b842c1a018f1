//! # UDP Endpoint
//!
//! One socket per node. Binding is the only fatal operation in the whole
//! networking stack — a node that cannot bind exits non-zero, everything
//! after that is best-effort. Sends encode, fire, and account for the
//! outcome in the event log; there are no retries and a failed send to
//! one peer never affects another. The datagram source address from
//! `recv` is authoritative for replies; whatever `sender_addr` claims in
//! the payload only feeds the peer table.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::json;
use tokio::net::UdpSocket;

use crate::events::EventLog;
use crate::wire::Envelope;

/// The node's single UDP socket plus send/receive accounting.
pub struct UdpEndpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    log: Arc<EventLog>,
}

impl UdpEndpoint {
    /// Binds `addr`. Port 0 requests an ephemeral port; check
    /// [`local_addr`](Self::local_addr) for what the OS handed out.
    pub async fn bind(addr: SocketAddr, log: Arc<EventLog>) -> std::io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Self::from_socket(socket, log)
    }

    /// Wraps an already-bound socket. The runtime binds first so it can
    /// seed its RNG and name its log file from the actual port.
    pub fn from_socket(socket: UdpSocket, log: Arc<EventLog>) -> std::io::Result<Self> {
        let local_addr = socket.local_addr()?;
        Ok(Self {
            socket,
            local_addr,
            log,
        })
    }

    /// The address actually bound.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Encodes and sends one envelope. Returns whether the datagram left
    /// the socket; either way the outcome is logged (`send_ok` /
    /// `send_error`) and the caller moves on.
    pub async fn send(&self, env: &Envelope, dest: SocketAddr) -> bool {
        let data = env.encode();
        match self.socket.send_to(&data, dest).await {
            Ok(bytes) => {
                self.log.log(
                    "send_ok",
                    json!({
                        "peer": dest.to_string(),
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                        "bytes": bytes,
                    }),
                );
                true
            }
            Err(e) => {
                self.log.log(
                    "send_error",
                    json!({
                        "peer": dest.to_string(),
                        "msg_type": env.msg_type,
                        "msg_id": env.msg_id,
                        "reason": format!("socket_error:{e}"),
                    }),
                );
                false
            }
        }
    }

    /// Waits for the next datagram. Errors are the caller's to log and
    /// shrug off — UDP receive failures are transient.
    pub async fn recv(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }
}
