//! # Dissemination Engine
//!
//! Target selection for the two emission paths: PUSH forwarding of fresh
//! gossip and the periodic HYBRID digest advertisement. The engine does
//! no network I/O — it picks peers and ids, and the runtime sends. That
//! split keeps the selection logic deterministic under a seeded RNG and
//! trivially testable.
//!
//! Fanout is the single knob both paths share. Raising it speeds
//! convergence and raises message overhead; TTL bounds the per-message
//! cost independently. Deduplication is not this module's job — callers
//! consult the seen set before invoking a forward at all.

use std::net::SocketAddr;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use super::cache::SeenSet;
use super::peers::PeerView;

/// Peer and id selection for gossip emission.
#[derive(Debug, Clone, Copy)]
pub struct GossipEngine {
    /// Peers chosen per emission event.
    pub fanout: usize,
    /// Cap on ids advertised per IHAVE digest.
    pub ihave_max_ids: usize,
}

impl GossipEngine {
    /// Targets for forwarding one GOSSIP: up to `fanout` peers drawn
    /// uniformly without replacement, skipping the immediate sender
    /// (matched by node id, best-effort). Loops through third parties
    /// remain possible; TTL and the seen set bound them.
    pub fn forward_targets(
        &self,
        view: &PeerView,
        rng: &mut StdRng,
        exclude_node_id: Option<&str>,
    ) -> Vec<SocketAddr> {
        view.sample(rng, self.fanout, exclude_node_id)
    }

    /// Targets for a periodic batch (IHAVE, PING, GET_PEERS): up to
    /// `fanout` peers, no exclusion.
    pub fn batch_targets(&self, view: &PeerView, rng: &mut StdRng) -> Vec<SocketAddr> {
        view.sample(rng, self.fanout, None)
    }

    /// Ids for one IHAVE digest: up to `ihave_max_ids` drawn uniformly
    /// from the seen window. Empty when nothing has been seen.
    pub fn digest_ids(&self, seen: &SeenSet, rng: &mut StdRng) -> Vec<String> {
        let mut ids: Vec<String> = seen.ids_in_order().map(str::to_string).collect();
        ids.shuffle(rng);
        ids.truncate(self.ihave_max_ids);
        ids
    }
}
