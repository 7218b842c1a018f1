//! # Node Identity
//!
//! A node is a UUID picked at startup plus the address it bound. Both are
//! immutable for the life of the process. Message ids are drawn the same
//! way as node ids — v4-formatted UUIDs whose random bytes come from the
//! node's seeded RNG, so a run with a fixed `--seed` replays with
//! identical ids.

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::Rng;

/// Stable identity of a running node.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    /// Opaque node identifier, carried as `sender_id` on every envelope.
    pub node_id: String,
    /// The bound address, carried as `sender_addr` on every envelope.
    pub addr: SocketAddr,
}

impl NodeIdentity {
    /// Creates an identity for a node bound at `addr`, drawing the id
    /// from `rng`.
    pub fn generate(rng: &mut StdRng, addr: SocketAddr) -> Self {
        Self {
            node_id: fresh_uuid(rng),
            addr,
        }
    }

    /// `host:port` form of the bound address.
    pub fn addr_string(&self) -> String {
        self.addr.to_string()
    }
}

/// A v4-formatted UUID string whose bytes come from the given RNG
/// instead of the OS. Keeps the familiar wire shape while staying
/// reproducible under a fixed seed.
pub fn fresh_uuid(rng: &mut StdRng) -> String {
    let bytes: [u8; 16] = rng.gen();
    uuid::Builder::from_random_bytes(bytes).into_uuid().to_string()
}
