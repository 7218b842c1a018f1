//! # CLI Interface
//!
//! Defines the command-line argument structure for `murmur-node` using
//! `clap` derive. The flag set is flat — one process, one node — and
//! wire-stable: the experiment harness composes these exact flags.
//!
//! Interval flags take seconds as floating point. `--pull-interval 0`
//! disables the hybrid pull path (pure PUSH), `--discovery-interval 0`
//! disables the periodic GET_PEERS refresh.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

use murmur_protocol::config::{parse_host_port, ConfigError, NodeConfig};

/// murmur gossip node.
///
/// Binds one UDP port, joins the overlay via the bootstrap peer (if
/// given), and disseminates application messages read from stdin.
#[derive(Parser, Debug, Clone)]
#[command(name = "murmur-node", about = "UDP epidemic gossip node", version)]
pub struct NodeCli {
    /// UDP port to bind (0 asks the OS for an ephemeral port).
    #[arg(long, env = "MURMUR_PORT")]
    pub port: u16,

    /// Bootstrap peer as host:port. Omit to run as a seed node.
    #[arg(long, env = "MURMUR_BOOTSTRAP")]
    pub bootstrap: Option<String>,

    /// Local address to bind.
    #[arg(long, default_value = "127.0.0.1")]
    pub bind: IpAddr,

    /// Peers chosen per emission event.
    #[arg(long, default_value_t = 3)]
    pub fanout: usize,

    /// Hop budget for originated GOSSIP messages.
    #[arg(long, default_value_t = 8)]
    pub ttl: u64,

    /// Maximum number of peers tracked.
    #[arg(long, default_value_t = 50)]
    pub peer_limit: usize,

    /// Liveness probe interval in seconds.
    #[arg(long, default_value_t = 2.0)]
    pub ping_interval: f64,

    /// Seconds of silence before a pinged peer is charged a missed pong.
    #[arg(long, default_value_t = 6.0)]
    pub peer_timeout: f64,

    /// RNG seed; mixed with the port for reproducible runs.
    #[arg(long, default_value_t = 42)]
    pub seed: u64,

    /// Hybrid IHAVE interval in seconds; 0 disables pull (pure PUSH).
    #[arg(long, default_value_t = 2.0)]
    pub pull_interval: f64,

    /// Periodic GET_PEERS interval in seconds; 0 disables discovery.
    #[arg(long, default_value_t = 4.0)]
    pub discovery_interval: f64,

    /// Maximum message ids advertised per IHAVE.
    #[arg(long, default_value_t = 32)]
    pub ihave_max_ids: usize,

    /// Admission PoW difficulty in leading zero hex digits; 0 disables.
    #[arg(long, default_value_t = 0)]
    pub pow_k: u32,

    /// Enable the stdin origination loop (true/false).
    #[arg(long, action = clap::ArgAction::Set, default_value_t = true)]
    pub stdin: bool,

    /// Directory for the structured JSONL event log.
    #[arg(long, default_value = "logs")]
    pub log_dir: PathBuf,

    /// Default diagnostic log level when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Diagnostic log format: pretty or json.
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl NodeCli {
    /// Turns parsed flags into a validated [`NodeConfig`].
    pub fn to_config(&self) -> Result<NodeConfig, ConfigError> {
        for (field, value) in [
            ("ping_interval", self.ping_interval),
            ("peer_timeout", self.peer_timeout),
            ("pull_interval", self.pull_interval),
            ("discovery_interval", self.discovery_interval),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::OutOfRange {
                    field,
                    reason: format!("must be a non-negative number of seconds, got {value}"),
                });
            }
        }

        let mut cfg = NodeConfig::new(self.port);
        cfg.bind_host = self.bind;
        cfg.bootstrap = self
            .bootstrap
            .as_deref()
            .map(|raw| parse_host_port(raw, "bootstrap"))
            .transpose()?;
        cfg.fanout = self.fanout;
        cfg.ttl = self.ttl;
        cfg.peer_limit = self.peer_limit;
        cfg.ping_interval = std::time::Duration::from_secs_f64(self.ping_interval);
        cfg.peer_timeout = std::time::Duration::from_secs_f64(self.peer_timeout);
        cfg.seed = self.seed;
        cfg.pull_interval = std::time::Duration::from_secs_f64(self.pull_interval);
        cfg.discovery_interval = std::time::Duration::from_secs_f64(self.discovery_interval);
        cfg.ihave_max_ids = self.ihave_max_ids;
        cfg.pow_k = self.pow_k;
        cfg.stdin_enabled = self.stdin;
        cfg.validate()?;
        Ok(cfg)
    }
}
