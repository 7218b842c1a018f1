//! # murmur — Core Library
//!
//! The node runtime for a UDP epidemic gossip overlay. A murmur network
//! is a set of cooperating peer processes that spread opaque application
//! messages to every participant with high probability, using randomized
//! forwarding — no coordinator, no membership service, no reliable
//! transport underneath.
//!
//! ## Architecture
//!
//! The crate is split by concern:
//!
//! - **wire** — The JSON datagram codec: one envelope schema, eight
//!   message kinds, strict validation with stable rejection reasons.
//! - **network** — The endpoint, the bounded peer view, the caches, the
//!   dissemination engine, and the runtime loop.
//! - **pow** — Optional admission proof-of-work (SHA-256, leading-zero
//!   hex prefix).
//! - **events** — The structured JSONL event log consumed by external
//!   analytics; every decision point emits one record.
//! - **identity** / **clock** — Node identity and a swappable time
//!   source, both reproducible under a fixed seed.
//! - **config** — Every knob and constant, with CLI-facing validation.
//!
//! ## Dissemination modes
//!
//! PUSH forwards every first-seen message to a random fanout-sized
//! subset of peers, decrementing its hop budget. HYBRID adds a periodic
//! IHAVE digest so peers the push wave missed can pull what they lack
//! via IWANT. Duplicate suppression is per-message-id; TTL bounds the
//! cost of any single message regardless.
//!
//! ## Determinism
//!
//! Everything random — peer sampling, digest sampling, node and message
//! ids — draws from one `StdRng` seeded with `seed + port`. Paired with
//! the injectable [`clock::Clock`], a run replays exactly, which is what
//! the end-to-end tests lean on.

pub mod clock;
pub mod config;
pub mod events;
pub mod identity;
pub mod network;
pub mod pow;
pub mod wire;
