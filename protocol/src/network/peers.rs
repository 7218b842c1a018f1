//! # Peer View
//!
//! The bounded table of known peers, keyed by socket address. The
//! address is the canonical identity here: `node_id` is recorded when
//! learned but two addresses claiming the same node id are two peers,
//! and the sender-exclusion on forwards (which matches by node id) is
//! correspondingly best-effort.
//!
//! Admission at capacity is a priority eviction, not LRU. Candidates are
//! ranked by `(missed_pongs desc, staleness desc, addr asc)` and the best
//! one is evicted only if it is actually unhealthy — at least three
//! missed pongs, or silent for longer than the peer timeout. A table
//! full of healthy peers rejects newcomers instead, so a flash crowd
//! cannot churn out a working overlay.

use std::collections::BTreeMap;
use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::config::MAX_MISSED_PONGS;
use crate::wire::PeerRecord;

// ---------------------------------------------------------------------------
// Peer
// ---------------------------------------------------------------------------

/// Bookkeeping for one known peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// The peer's node id, once learned from an envelope or peers list.
    pub node_id: Option<String>,
    /// The peer's address — the table key.
    pub addr: SocketAddr,
    /// Last time any valid datagram or listing mentioned this peer.
    pub last_seen_ms: u64,
    /// When we last sent this peer a PING, if ever.
    pub last_ping_ms: Option<u64>,
    /// Consecutive ping windows that elapsed without a PONG.
    pub missed_pongs: u32,
    /// Whether this peer completed a HELLO that passed admission.
    pub verified_hello: bool,
}

impl Peer {
    fn new(addr: SocketAddr, node_id: Option<String>, verified: bool, now_ms: u64) -> Self {
        Self {
            node_id,
            addr,
            last_seen_ms: now_ms,
            last_ping_ms: None,
            missed_pongs: 0,
            verified_hello: verified,
        }
    }

    fn staleness_ms(&self, now_ms: u64) -> u64 {
        now_ms.saturating_sub(self.last_seen_ms)
    }
}

// ---------------------------------------------------------------------------
// Upsert outcome
// ---------------------------------------------------------------------------

/// What an [`PeerView::upsert`] did. The dispatcher turns these into
/// `peer_add` / `peer_update` / `peer_evict` events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Upsert {
    /// A new peer entered the table, possibly displacing an unhealthy one.
    Added {
        /// The peer evicted to make room, if the table was full.
        evicted: Option<Peer>,
    },
    /// An existing entry was refreshed.
    Updated,
    /// The address is our own; never admitted.
    IgnoredSelf,
    /// Table full and every resident peer is healthy.
    IgnoredCapacity,
}

// ---------------------------------------------------------------------------
// PeerView
// ---------------------------------------------------------------------------

/// Bounded peer table with liveness bookkeeping.
///
/// Stored in a `BTreeMap` so iteration (and therefore sampling under a
/// seeded RNG, and eviction tie-breaks) is deterministic.
#[derive(Debug)]
pub struct PeerView {
    peers: BTreeMap<SocketAddr, Peer>,
    limit: usize,
    self_addr: SocketAddr,
    peer_timeout_ms: u64,
}

impl PeerView {
    /// An empty view for the node bound at `self_addr`.
    pub fn new(self_addr: SocketAddr, limit: usize, peer_timeout_ms: u64) -> Self {
        Self {
            peers: BTreeMap::new(),
            limit: limit.max(1),
            self_addr,
            peer_timeout_ms,
        }
    }

    /// Number of peers currently tracked. Never exceeds the limit.
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the view is empty.
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// The entry at `addr`, if present.
    pub fn get(&self, addr: &SocketAddr) -> Option<&Peer> {
        self.peers.get(addr)
    }

    /// Records an observation of `addr`, inserting or refreshing its
    /// entry. The self address is ignored. `node_id` updates the entry
    /// when provided; `verified` is sticky once set.
    pub fn upsert(
        &mut self,
        addr: SocketAddr,
        node_id: Option<&str>,
        verified: bool,
        now_ms: u64,
    ) -> Upsert {
        if addr == self.self_addr {
            return Upsert::IgnoredSelf;
        }

        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.last_seen_ms = now_ms;
            if let Some(id) = node_id {
                peer.node_id = Some(id.to_string());
            }
            peer.verified_hello |= verified;
            return Upsert::Updated;
        }

        let evicted = if self.peers.len() >= self.limit {
            match self.eviction_candidate(now_ms) {
                Some(victim) => self.peers.remove(&victim),
                None => return Upsert::IgnoredCapacity,
            }
        } else {
            None
        };

        self.peers.insert(
            addr,
            Peer::new(addr, node_id.map(str::to_string), verified, now_ms),
        );
        Upsert::Added { evicted }
    }

    /// The address that would be evicted to admit a newcomer right now,
    /// or `None` if every resident peer is healthy. Ranking is
    /// `(missed_pongs desc, staleness desc, addr asc)`; only a candidate
    /// with `missed_pongs >= MAX_MISSED_PONGS` or staleness beyond the
    /// peer timeout qualifies.
    fn eviction_candidate(&self, now_ms: u64) -> Option<SocketAddr> {
        let best = self.peers.values().max_by(|a, b| {
            (a.missed_pongs, a.staleness_ms(now_ms))
                .cmp(&(b.missed_pongs, b.staleness_ms(now_ms)))
                // BTreeMap iterates addresses ascending; on a tie, prefer
                // the earlier (smaller) address by treating it as larger.
                .then_with(|| b.addr.cmp(&a.addr))
        })?;

        let qualifies = best.missed_pongs >= MAX_MISSED_PONGS
            || best.staleness_ms(now_ms) > self.peer_timeout_ms;
        qualifies.then_some(best.addr)
    }

    /// Up to `k` peer addresses drawn uniformly without replacement.
    /// Peers whose recorded node id equals `exclude_node_id` are left
    /// out (the trivial-echo suppression on forwards).
    pub fn sample(
        &self,
        rng: &mut StdRng,
        k: usize,
        exclude_node_id: Option<&str>,
    ) -> Vec<SocketAddr> {
        let mut addrs: Vec<SocketAddr> = self
            .peers
            .values()
            .filter(|p| match (exclude_node_id, &p.node_id) {
                (Some(excluded), Some(id)) => id != excluded,
                _ => true,
            })
            .map(|p| p.addr)
            .collect();
        addrs.shuffle(rng);
        addrs.truncate(k);
        addrs
    }

    /// Stamps `addr` as pinged at `now_ms`.
    pub fn mark_pinged(&mut self, addr: &SocketAddr, now_ms: u64) {
        if let Some(peer) = self.peers.get_mut(addr) {
            peer.last_ping_ms = Some(now_ms);
        }
    }

    /// Clears the missed-pong counter for `addr` (a PONG arrived).
    /// Returns whether the peer was known.
    pub fn reset_missed(&mut self, addr: &SocketAddr) -> bool {
        match self.peers.get_mut(addr) {
            Some(peer) => {
                peer.missed_pongs = 0;
                true
            }
            None => false,
        }
    }

    /// Failure-detector sweep. Each peer that was pinged longer than the
    /// timeout ago and has been silent at least as long is charged one
    /// missed pong (and its ping window restarts); peers reaching the
    /// missed-pong limit are removed and returned.
    pub fn expire(&mut self, now_ms: u64) -> Vec<Peer> {
        let mut dead = Vec::new();
        for peer in self.peers.values_mut() {
            let pinged_long_ago = peer
                .last_ping_ms
                .is_some_and(|t| now_ms.saturating_sub(t) > self.peer_timeout_ms);
            if pinged_long_ago && peer.staleness_ms(now_ms) > self.peer_timeout_ms {
                peer.missed_pongs += 1;
                peer.last_ping_ms = Some(now_ms);
                if peer.missed_pongs >= MAX_MISSED_PONGS {
                    dead.push(peer.addr);
                }
            }
        }
        dead.into_iter()
            .filter_map(|addr| self.peers.remove(&addr))
            .collect()
    }

    /// Snapshot for a PEERS_LIST reply: up to `limit` records, excluding
    /// the requester and any peer whose node id is still unknown.
    pub fn snapshot(&self, limit: usize, exclude: Option<SocketAddr>) -> Vec<PeerRecord> {
        self.peers
            .values()
            .filter(|p| Some(p.addr) != exclude)
            .filter_map(|p| {
                p.node_id.as_ref().map(|id| PeerRecord {
                    node_id: id.clone(),
                    addr: p.addr.to_string(),
                })
            })
            .take(limit)
            .collect()
    }

    /// All tracked addresses, ascending. Mostly for tests and status
    /// introspection.
    pub fn addrs(&self) -> Vec<SocketAddr> {
        self.peers.keys().copied().collect()
    }
}
