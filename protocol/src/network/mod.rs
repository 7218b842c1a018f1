//! # Network Module
//!
//! The networking layer of a murmur node: the UDP endpoint, the bounded
//! peer view with failure detection, the deduplication caches, the
//! dissemination engine, and the runtime loop that ties them together.
//!
//! ## Architecture
//!
//! ```text
//! endpoint.rs — single UDP socket, best-effort send with accounting
//! peers.rs    — bounded peer view: admission, eviction, expiry, sampling
//! cache.rs    — SeenSet (dedup) and GossipCache (IWANT replies)
//! gossip.rs   — fanout and digest selection (pure, no I/O)
//! node.rs     — dispatcher, periodic drivers, the select! loop
//! ```
//!
//! ## Design Decisions
//!
//! - One task per node. Every structure is mutated from the runtime loop
//!   only, so there are no locks around the view or the caches; the lone
//!   internally synchronized piece is the event-log sink.
//! - The dissemination engine computes targets and returns them; the
//!   runtime performs the sends. Selection stays deterministic under the
//!   seeded RNG and testable without sockets.
//! - Deduplication is by message id, not content hash: two originators
//!   emitting identical data both propagate. TTL bounds the cost of a
//!   message the seen set has not caught yet.

pub mod cache;
pub mod endpoint;
pub mod gossip;
pub mod node;
pub mod peers;

pub use cache::{GossipCache, SeenSet};
pub use endpoint::UdpEndpoint;
pub use gossip::GossipEngine;
pub use node::{LogMode, NodeRuntime};
pub use peers::{Peer, PeerView, Upsert};
