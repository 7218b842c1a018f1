//! # Message Caches
//!
//! Two bounded structures back deduplication and the hybrid pull path.
//! [`SeenSet`] answers "have I processed this id" — the forwarding guard.
//! [`GossipCache`] retains recent gossip envelopes verbatim so IWANT
//! requests can be answered. Both evict FIFO at a fixed cap, so neither
//! grows without bound however long the node runs.
//!
//! The seen set keeps insertion order. That matters: IHAVE digests sample
//! ids from it through the node's seeded RNG, and a hash-ordered set
//! would make those samples irreproducible across runs.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::wire::Envelope;

// ---------------------------------------------------------------------------
// SeenSet
// ---------------------------------------------------------------------------

/// Insertion-ordered set of processed message ids with FIFO eviction.
#[derive(Debug)]
pub struct SeenSet {
    ids: HashSet<String>,
    order: VecDeque<String>,
    cap: usize,
}

impl SeenSet {
    /// A seen set that retains at most `cap` ids.
    pub fn new(cap: usize) -> Self {
        Self {
            ids: HashSet::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Whether `id` has been processed within the retention window.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Records `id`. Returns `false` if it was already present. Evicts
    /// the oldest id when the window is full.
    pub fn add(&mut self, id: &str) -> bool {
        if !self.ids.insert(id.to_string()) {
            return false;
        }
        self.order.push_back(id.to_string());
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.ids.remove(&oldest);
            }
        }
        true
    }

    /// Number of retained ids.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Retained ids, oldest first. The stable order the IHAVE sampler
    /// indexes into.
    pub fn ids_in_order(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// GossipCache
// ---------------------------------------------------------------------------

/// Bounded `msg_id → envelope` store of recent gossip, FIFO-evicted.
/// Envelopes are kept exactly as received so IWANT replies re-send the
/// original bytes' worth of fields, original ttl included.
#[derive(Debug)]
pub struct GossipCache {
    entries: HashMap<String, Envelope>,
    order: VecDeque<String>,
    cap: usize,
}

impl GossipCache {
    /// A cache that retains at most `cap` envelopes.
    pub fn new(cap: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            cap: cap.max(1),
        }
    }

    /// Stores `env` under `id`. Re-inserting an id refreshes the body
    /// but not its eviction slot.
    pub fn put(&mut self, id: &str, env: Envelope) {
        if self.entries.insert(id.to_string(), env).is_none() {
            self.order.push_back(id.to_string());
        }
        while self.order.len() > self.cap {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    /// The cached envelope for `id`, if still retained.
    pub fn get(&self, id: &str) -> Option<&Envelope> {
        self.entries.get(id)
    }

    /// Number of retained envelopes.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
