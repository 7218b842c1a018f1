//! # Node Configuration & Constants
//!
//! Every tunable of a murmur node lives here. The defaults mirror what the
//! experiment harness launches with; anything the operator can change from
//! the command line has a field on [`NodeConfig`].
//!
//! One naming decision worth recording: the hybrid pull timer is called
//! `pull_interval` everywhere — on the CLI, in this struct, and in the
//! `node_listening` event. An older spelling (`interval_pull`) existed at one
//! point; it is not accepted anywhere, and an unknown `--interval-pull` flag
//! fails argument parsing outright.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Wire & Protocol Constants
// ---------------------------------------------------------------------------

/// Wire protocol version. Every envelope carries this and peers reject
/// anything else. Bump on breaking schema changes.
pub const WIRE_VERSION: u64 = 1;

/// Capabilities a HELLO must advertise to be admitted. The transport is
/// UDP datagrams carrying JSON objects; a peer that cannot speak both is
/// useless to us.
pub const REQUIRED_CAPABILITIES: [&str; 2] = ["udp", "json"];

/// Consecutive missed-pong windows before a peer is declared dead and
/// removed from the view.
pub const MAX_MISSED_PONGS: u32 = 3;

/// Upper bound on retained gossip bodies kept to answer IWANT requests.
/// FIFO eviction beyond this.
pub const GOSSIP_CACHE_CAP: usize = 1024;

/// Floor for the seen-id window. The actual cap scales with the peer
/// limit (see [`NodeConfig::seen_cap`]) but never drops below this.
pub const SEEN_SET_MIN_CAP: usize = 1024;

/// Seen-id window per admitted peer. A node tracking 50 peers remembers
/// at least 500 recent message ids before the FIFO starts dropping.
pub const SEEN_SET_PEER_FACTOR: usize = 10;

/// Receive buffer size. Comfortably above the largest datagram the
/// protocol emits (a full PEERS_LIST or a capped IHAVE).
pub const RECV_BUFFER_BYTES: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

/// Default fanout — peers chosen per emission event.
pub const DEFAULT_FANOUT: usize = 3;

/// Default hop budget stamped on locally originated GOSSIP.
pub const DEFAULT_TTL: u64 = 8;

/// Default peer-view capacity.
pub const DEFAULT_PEER_LIMIT: usize = 50;

/// Default liveness probe interval.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(2);

/// Default window without traffic before a pinged peer is charged a
/// missed pong.
pub const DEFAULT_PEER_TIMEOUT: Duration = Duration::from_secs(6);

/// Default hybrid IHAVE advertisement interval. Zero disables the pull
/// path entirely (pure PUSH mode).
pub const DEFAULT_PULL_INTERVAL: Duration = Duration::from_secs(2);

/// Default GET_PEERS refresh interval. Zero disables discovery.
pub const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(4);

/// Default cap on message ids advertised per IHAVE. Keeps the datagram
/// well under a single MTU even with UUID-sized ids.
pub const DEFAULT_IHAVE_MAX_IDS: usize = 32;

/// Default RNG seed. Combined with the port so that co-located nodes
/// draw distinct but reproducible sequences.
pub const DEFAULT_SEED: u64 = 42;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Configuration rejection reasons. These surface before the socket is
/// bound, so they are the operator's problem, not the network's.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `host:port` string did not parse or resolve.
    #[error("{field} must be in host:port form: {reason}")]
    InvalidHostPort {
        /// Which config field carried the bad value.
        field: &'static str,
        /// What exactly was wrong with it.
        reason: String,
    },

    /// A numeric knob is outside its allowed range.
    #[error("{field} out of range: {reason}")]
    OutOfRange {
        /// Which config field carried the bad value.
        field: &'static str,
        /// What exactly was wrong with it.
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// Host:port parsing
// ---------------------------------------------------------------------------

/// Parses a `host:port` string into a socket address.
///
/// Accepts literal IP addresses directly and falls back to resolver lookup
/// for names, taking the first result. `field` names the config field for
/// the error message.
pub fn parse_host_port(raw: &str, field: &'static str) -> Result<SocketAddr, ConfigError> {
    if let Ok(addr) = raw.parse::<SocketAddr>() {
        return Ok(addr);
    }

    let (host, port_raw) = raw.rsplit_once(':').ok_or(ConfigError::InvalidHostPort {
        field,
        reason: "missing ':' separator".to_string(),
    })?;
    if host.trim().is_empty() {
        return Err(ConfigError::InvalidHostPort {
            field,
            reason: "empty host".to_string(),
        });
    }
    let port: u16 = port_raw.parse().map_err(|_| ConfigError::InvalidHostPort {
        field,
        reason: format!("bad port: {port_raw:?}"),
    })?;

    (host, port)
        .to_socket_addrs()
        .map_err(|e| ConfigError::InvalidHostPort {
            field,
            reason: e.to_string(),
        })?
        .next()
        .ok_or(ConfigError::InvalidHostPort {
            field,
            reason: "resolved to no addresses".to_string(),
        })
}

// ---------------------------------------------------------------------------
// NodeConfig
// ---------------------------------------------------------------------------

/// Full configuration of a single node process.
///
/// Construct with [`NodeConfig::new`] (defaults everything except the
/// port), adjust fields, then [`validate`](NodeConfig::validate) before
/// handing it to the runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// UDP port to bind. Zero asks the OS for an ephemeral port; the
    /// bound address is reported in the `node_listening` event.
    pub port: u16,
    /// Local address to bind. Defaults to loopback; experiments run
    /// whole overlays on one host.
    pub bind_host: std::net::IpAddr,
    /// Seed peer to contact at startup. `None` means this node *is* a
    /// seed and waits to be contacted.
    pub bootstrap: Option<SocketAddr>,
    /// Peers chosen per emission event (forward, ping, IHAVE,
    /// discovery). Zero silences every outbound batch, which the
    /// harness uses to isolate the pull path.
    pub fanout: usize,
    /// Hop budget stamped on locally originated GOSSIP.
    pub ttl: u64,
    /// Peer-view capacity.
    pub peer_limit: usize,
    /// Liveness probe cadence.
    pub ping_interval: Duration,
    /// Silence window before a pinged peer is charged a missed pong.
    pub peer_timeout: Duration,
    /// RNG seed; the node mixes in its port so co-located nodes differ.
    pub seed: u64,
    /// Hybrid IHAVE cadence. Zero disables the pull path.
    pub pull_interval: Duration,
    /// GET_PEERS refresh cadence. Zero disables discovery.
    pub discovery_interval: Duration,
    /// Cap on ids advertised per IHAVE.
    pub ihave_max_ids: usize,
    /// Admission proof-of-work difficulty in leading zero hex digits.
    /// Zero disables the gate.
    pub pow_k: u32,
    /// Whether to read stdin lines and originate them as GOSSIP.
    pub stdin_enabled: bool,
}

impl NodeConfig {
    /// A configuration with every knob at its default, bound to `port`.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            bind_host: std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
            bootstrap: None,
            fanout: DEFAULT_FANOUT,
            ttl: DEFAULT_TTL,
            peer_limit: DEFAULT_PEER_LIMIT,
            ping_interval: DEFAULT_PING_INTERVAL,
            peer_timeout: DEFAULT_PEER_TIMEOUT,
            seed: DEFAULT_SEED,
            pull_interval: DEFAULT_PULL_INTERVAL,
            discovery_interval: DEFAULT_DISCOVERY_INTERVAL,
            ihave_max_ids: DEFAULT_IHAVE_MAX_IDS,
            pow_k: 0,
            stdin_enabled: false,
        }
    }

    /// The address this node binds.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_host, self.port)
    }

    /// Seen-id window for this configuration.
    pub fn seen_cap(&self) -> usize {
        SEEN_SET_MIN_CAP.max(self.peer_limit.saturating_mul(SEEN_SET_PEER_FACTOR))
    }

    /// Whether the hybrid pull path is active.
    pub fn pull_enabled(&self) -> bool {
        !self.pull_interval.is_zero()
    }

    /// Whether periodic discovery is active.
    pub fn discovery_enabled(&self) -> bool {
        !self.discovery_interval.is_zero()
    }

    /// Rejects configurations the runtime cannot honor. Interval knobs
    /// that gate periodic loops must be positive; caps must be non-zero.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peer_limit == 0 {
            return Err(ConfigError::OutOfRange {
                field: "peer_limit",
                reason: "must be >= 1".to_string(),
            });
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "ping_interval",
                reason: "must be > 0".to_string(),
            });
        }
        if self.peer_timeout.is_zero() {
            return Err(ConfigError::OutOfRange {
                field: "peer_timeout",
                reason: "must be > 0".to_string(),
            });
        }
        if self.ihave_max_ids == 0 {
            return Err(ConfigError::OutOfRange {
                field: "ihave_max_ids",
                reason: "must be >= 1".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_host_port_accepts_ipv4() {
        let addr = parse_host_port("127.0.0.1:9000", "bootstrap").unwrap();
        assert_eq!(addr.port(), 9000);
        assert!(addr.ip().is_loopback());
    }

    #[test]
    fn parse_host_port_rejects_garbage() {
        assert!(parse_host_port("no-separator", "bootstrap").is_err());
        assert!(parse_host_port(":9000", "bootstrap").is_err());
        assert!(parse_host_port("127.0.0.1:notaport", "bootstrap").is_err());
    }

    #[test]
    fn defaults_validate() {
        NodeConfig::new(9000).validate().unwrap();
    }

    #[test]
    fn zero_intervals_rejected_where_required() {
        let mut cfg = NodeConfig::new(9000);
        cfg.ping_interval = Duration::ZERO;
        assert!(cfg.validate().is_err());

        let mut cfg = NodeConfig::new(9000);
        cfg.peer_timeout = Duration::ZERO;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_pull_and_discovery_mean_disabled() {
        let mut cfg = NodeConfig::new(9000);
        cfg.pull_interval = Duration::ZERO;
        cfg.discovery_interval = Duration::ZERO;
        cfg.validate().unwrap();
        assert!(!cfg.pull_enabled());
        assert!(!cfg.discovery_enabled());
    }

    #[test]
    fn seen_cap_scales_with_peer_limit() {
        let mut cfg = NodeConfig::new(9000);
        cfg.peer_limit = 10;
        assert_eq!(cfg.seen_cap(), SEEN_SET_MIN_CAP);
        cfg.peer_limit = 500;
        assert_eq!(cfg.seen_cap(), 5000);
    }
}
