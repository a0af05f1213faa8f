//! Peer/block coordination via consistent-hash affinity (spec §4.6, C6).
//!
//! Grounded on the teacher's `storage/topology.rs` `NodeId`/distance idiom
//! (a 256-bit identifier plus a normalized distance metric used to decide
//! affinity), adapted here to the `Hash256::normalized_distance` Euclidean
//! metric defined in `types` and to a coordination score that mixes filter
//! overlap with that affinity.

use crate::bloom::BloomFilter;
use crate::types::{Cid, PeerId};
use dashmap::DashMap;
use std::collections::HashSet;

/// Coordination score peaks at 0.4 filter overlap and falls off on either
/// side (spec §4.6): too little overlap means the peer isn't relevant,
/// too much means redundant caching.
const OVERLAP_PEAK: f64 = 0.4;

/// A hint suggesting a peer is well-positioned to cache a given block.
#[derive(Debug, Clone)]
pub struct CoordinationHint {
    pub cid: Cid,
    pub peer: PeerId,
    pub score: f64,
}

/// Tracks which blocks are in high demand locally and which peers are
/// affine to which blocks, producing coordination hints for the bloom
/// exchange and opportunistic fetch subsystems.
pub struct CoordinationEngine {
    high_demand: DashMap<Cid, f64>,
    assignments: DashMap<Cid, HashSet<PeerId>>,
}

impl CoordinationEngine {
    pub fn new() -> Self {
        Self {
            high_demand: DashMap::new(),
            assignments: DashMap::new(),
        }
    }

    pub fn mark_high_demand(&self, cid: Cid, demand_score: f64) {
        self.high_demand.insert(cid, demand_score);
    }

    pub fn high_demand_blocks(&self) -> Vec<Cid> {
        self.high_demand.iter().map(|e| e.key().clone()).collect()
    }

    /// Affinity between a block and a peer: `1 - normalized_distance`, so
    /// closeness in hash space yields a score near 1.
    pub fn affinity(&self, cid: &Cid, peer: &PeerId) -> f64 {
        1.0 - cid.content_hash().normalized_distance(&peer.content_hash())
    }

    /// Coordination score between this node's filter and a peer's filter
    /// for one category (spec §4.6): a bell curve over overlap peaking at
    /// `OVERLAP_PEAK`.
    pub fn coordination_score(&self, local: &BloomFilter, remote: &BloomFilter) -> f64 {
        let overlap = local.estimate_overlap(remote);
        let distance_from_peak = (overlap - OVERLAP_PEAK).abs();
        (1.0 - distance_from_peak / OVERLAP_PEAK.max(1.0 - OVERLAP_PEAK)).max(0.0)
    }

    /// Suggest peers to coordinate with for a block, ranked by a blend of
    /// hash-space affinity and filter-overlap coordination score.
    pub fn suggest_peers(
        &self,
        cid: &Cid,
        peers: &[(PeerId, BloomFilter)],
        local_filter: &BloomFilter,
        n: usize,
    ) -> Vec<CoordinationHint> {
        let mut scored: Vec<CoordinationHint> = peers
            .iter()
            .map(|(peer, filter)| {
                let affinity = self.affinity(cid, peer);
                let coordination = self.coordination_score(local_filter, filter);
                CoordinationHint {
                    cid: cid.clone(),
                    peer: peer.clone(),
                    score: 0.5 * affinity + 0.5 * coordination,
                }
            })
            .collect();
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }

    pub fn record_assignment(&self, cid: Cid, peer: PeerId) {
        self.assignments.entry(cid).or_default().insert(peer);
    }

    pub fn assigned_peers(&self, cid: &Cid) -> Vec<PeerId> {
        self.assignments
            .get(cid)
            .map(|peers| peers.iter().cloned().collect())
            .unwrap_or_default()
    }
}

impl Default for CoordinationEngine {
    fn default() -> Self {
        Self::new()
    }
}
