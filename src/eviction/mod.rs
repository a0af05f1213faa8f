//! Eviction policy family (spec §4.4, C4).
//!
//! Grounded on the teacher's `storage/memory_storage.rs` `evict()` method:
//! collect candidates, sort by score, take from the most-evictable end
//! until the freed total meets the target. Generalized here into a pluggable
//! `EvictionPolicy` trait with four scoring strategies plus a `Gradual`
//! wrapper that caps how much a single pass may evict.

use crate::types::{BlockMetadata, BlockOrigin};
use serde::{Deserialize, Serialize};

/// Selectable eviction strategy, configured via `CacheSettings` (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EvictionStrategyKind {
    Lru,
    Lfu,
    ValueBased,
    #[default]
    Adaptive,
}

/// Read-only view onto a block's health signal, implemented by
/// `BlockHealthTracker`. Kept as a trait here so the eviction policies
/// don't depend on the health module's concrete type.
pub trait HealthLookup {
    /// Value score in `[0, 10]`; higher means more valuable to the swarm.
    /// Returns `None` if the tracker has no hint for this block.
    fn value(&self, cid: &crate::types::Cid) -> Option<f64>;
}

/// A no-op lookup used when no health tracker is wired in (e.g. tests).
pub struct NoHealthLookup;

impl HealthLookup for NoHealthLookup {
    fn value(&self, _cid: &crate::types::Cid) -> Option<f64> {
        None
    }
}

/// Common contract for every eviction policy.
pub trait EvictionPolicy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Higher score means "evict me first".
    fn score(&self, meta: &BlockMetadata, now: u64, health: &dyn HealthLookup) -> f64;

    /// Select candidates to evict, stopping once their summed size meets
    /// or exceeds `bytes_needed`. Stable descending-score order; ties break
    /// on smaller size first so small blocks are preferred as filler.
    fn select<'a>(
        &self,
        blocks: &[&'a BlockMetadata],
        bytes_needed: u64,
        now: u64,
        health: &dyn HealthLookup,
    ) -> Vec<&'a BlockMetadata> {
        let mut scored: Vec<(&BlockMetadata, f64)> = blocks
            .iter()
            .map(|b| (*b, self.score(b, now, health)))
            .collect();
        scored.sort_by(|(a_meta, a_score), (b_meta, b_score)| {
            b_score
                .partial_cmp(a_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a_meta.size.cmp(&b_meta.size))
        });

        let mut freed = 0u64;
        let mut chosen = Vec::new();
        for (meta, _) in scored {
            if freed >= bytes_needed {
                break;
            }
            freed += meta.size;
            chosen.push(meta);
        }
        chosen
    }
}

/// Evicts the least-recently-used block first.
pub struct LruPolicy;

impl EvictionPolicy for LruPolicy {
    fn name(&self) -> &'static str {
        "lru"
    }

    fn score(&self, meta: &BlockMetadata, now: u64, _health: &dyn HealthLookup) -> f64 {
        meta.hours_since_access(now)
    }
}

/// Evicts the least-frequently-used block first, normalized by age so
/// long-lived unpopular blocks don't dominate freshly-cached ones.
pub struct LfuPolicy;

impl EvictionPolicy for LfuPolicy {
    fn name(&self) -> &'static str {
        "lfu"
    }

    fn score(&self, meta: &BlockMetadata, now: u64, _health: &dyn HealthLookup) -> f64 {
        if meta.popularity == 0 {
            return 1000.0;
        }
        let age_hours = meta.age_hours(now).max(1.0);
        1.0 / (meta.popularity as f64 / age_hours)
    }
}

/// Weighted score blending recency, frequency, swarm value, and block
/// origin; altruistic blocks get a discount to their standing so they're
/// preferred for eviction over personal blocks of equal score.
pub struct ValueBasedPolicy;

const WEIGHT_AGE: f64 = 0.2;
const WEIGHT_FREQUENCY: f64 = 0.3;
const WEIGHT_HEALTH: f64 = 0.4;
const WEIGHT_RANDOMIZER: f64 = 0.1;
const ALTRUISTIC_DISCOUNT: f64 = 0.9;

impl EvictionPolicy for ValueBasedPolicy {
    fn name(&self) -> &'static str {
        "value_based"
    }

    fn score(&self, meta: &BlockMetadata, now: u64, health: &dyn HealthLookup) -> f64 {
        let age_component = meta.hours_since_access(now) / (meta.hours_since_access(now) + 24.0);
        let frequency_component = 1.0 / (meta.popularity as f64 + 1.0);
        let value = health.value(&meta.cid).unwrap_or(0.0);
        let health_component = 1.0 - (value / 10.0).min(1.0);
        // randomizer signal: blocks with zero observed popularity but old
        // enough to have been fetched at least once behave like randomizer
        // blocks (reused across many files); treat them as slightly stickier.
        let randomizer_component = if meta.popularity > 0 { 0.0 } else { 0.5 };

        let mut score = WEIGHT_AGE * age_component
            + WEIGHT_FREQUENCY * frequency_component
            + WEIGHT_HEALTH * health_component
            + WEIGHT_RANDOMIZER * randomizer_component;

        if meta.origin == BlockOrigin::Altruistic {
            // Discounting an altruistic block's standing raises its score
            // under the higher-score-evicts-first convention.
            score /= ALTRUISTIC_DISCOUNT;
        }
        score
    }
}

/// Dispatches to LRU, LFU, or ValueBased depending on cache utilization
/// (spec §4.4): under low pressure prefers LRU's cheap recency signal,
/// escalates to LFU then ValueBased as the cache fills.
pub struct AdaptivePolicy {
    pub utilization: f64,
}

const ADAPTIVE_LFU_THRESHOLD: f64 = 0.7;
const ADAPTIVE_VALUE_THRESHOLD: f64 = 0.9;

impl AdaptivePolicy {
    fn inner(&self) -> Box<dyn EvictionPolicy> {
        if self.utilization >= ADAPTIVE_VALUE_THRESHOLD {
            Box::new(ValueBasedPolicy)
        } else if self.utilization >= ADAPTIVE_LFU_THRESHOLD {
            Box::new(LfuPolicy)
        } else {
            Box::new(LruPolicy)
        }
    }
}

impl EvictionPolicy for AdaptivePolicy {
    fn name(&self) -> &'static str {
        "adaptive"
    }

    fn score(&self, meta: &BlockMetadata, now: u64, health: &dyn HealthLookup) -> f64 {
        self.inner().score(meta, now, health)
    }

    fn select<'a>(
        &self,
        blocks: &[&'a BlockMetadata],
        bytes_needed: u64,
        now: u64,
        health: &dyn HealthLookup,
    ) -> Vec<&'a BlockMetadata> {
        self.inner().select(blocks, bytes_needed, now, health)
    }
}

/// Wraps a base policy and caps a single pass's eviction target to avoid
/// evicting more than necessary in one sweep (spec §4.4).
pub struct GradualPolicy {
    pub base: Box<dyn EvictionPolicy>,
    pub max_fraction_per_pass: f64,
}

impl GradualPolicy {
    pub fn new(base: Box<dyn EvictionPolicy>) -> Self {
        Self {
            base,
            max_fraction_per_pass: 0.25,
        }
    }
}

impl EvictionPolicy for GradualPolicy {
    fn name(&self) -> &'static str {
        "gradual"
    }

    fn score(&self, meta: &BlockMetadata, now: u64, health: &dyn HealthLookup) -> f64 {
        self.base.score(meta, now, health)
    }

    fn select<'a>(
        &self,
        blocks: &[&'a BlockMetadata],
        bytes_needed: u64,
        now: u64,
        health: &dyn HealthLookup,
    ) -> Vec<&'a BlockMetadata> {
        let total: u64 = blocks.iter().map(|b| b.size).sum();
        let capped_target = ((total as f64) * self.max_fraction_per_pass) as u64;
        let target = bytes_needed.min(capped_target.max(bytes_needed.min(total)));
        self.base.select(blocks, target, now, health)
    }
}

/// Build a concrete policy from its configured kind.
pub fn policy_for(kind: EvictionStrategyKind, utilization: f64) -> Box<dyn EvictionPolicy> {
    match kind {
        EvictionStrategyKind::Lru => Box::new(LruPolicy),
        EvictionStrategyKind::Lfu => Box::new(LfuPolicy),
        EvictionStrategyKind::ValueBased => Box::new(ValueBasedPolicy),
        EvictionStrategyKind::Adaptive => Box::new(AdaptivePolicy { utilization }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Cid;

    fn meta(cid: &str, size: u64, origin: BlockOrigin) -> BlockMetadata {
        BlockMetadata::new(Cid::new(cid), size, origin)
    }

    #[test]
    fn lru_prefers_least_recently_accessed() {
        let mut old = meta("old", 10, BlockOrigin::Personal);
        old.last_accessed = 0;
        let fresh = meta("fresh", 10, BlockOrigin::Personal);
        let blocks = vec![&old, &fresh];
        let chosen = LruPolicy.select(&blocks, 10, crate::types::now_secs(), &NoHealthLookup);
        assert_eq!(chosen[0].cid, old.cid);
    }

    #[test]
    fn select_stops_once_target_met() {
        let a = meta("a", 100, BlockOrigin::Altruistic);
        let b = meta("b", 100, BlockOrigin::Altruistic);
        let c = meta("c", 100, BlockOrigin::Altruistic);
        let blocks = vec![&a, &b, &c];
        let chosen = LruPolicy.select(&blocks, 150, crate::types::now_secs(), &NoHealthLookup);
        assert_eq!(chosen.len(), 2);
    }

    #[test]
    fn value_based_discounts_altruistic_blocks() {
        let personal = meta("p", 10, BlockOrigin::Personal);
        let altruistic = meta("a", 10, BlockOrigin::Altruistic);
        let now = crate::types::now_secs();
        let p_score = ValueBasedPolicy.score(&personal, now, &NoHealthLookup);
        let a_score = ValueBasedPolicy.score(&altruistic, now, &NoHealthLookup);
        // Higher score evicts first, so the discounted altruistic block
        // must score higher than an equivalent personal block.
        assert!(a_score > p_score);
    }

    #[test]
    fn adaptive_dispatches_by_utilization() {
        let low = AdaptivePolicy { utilization: 0.1 };
        let high = AdaptivePolicy { utilization: 0.95 };
        assert_eq!(low.inner().name(), "lru");
        assert_eq!(high.inner().name(), "value_based");
    }

    #[test]
    fn gradual_caps_eviction_target() {
        let blocks: Vec<BlockMetadata> = (0..10)
            .map(|i| meta(&format!("b{i}"), 100, BlockOrigin::Altruistic))
            .collect();
        let refs: Vec<&BlockMetadata> = blocks.iter().collect();
        let gradual = GradualPolicy::new(Box::new(LruPolicy));
        let chosen = gradual.select(&refs, 1000, crate::types::now_secs(), &NoHealthLookup);
        // total is 1000 bytes; capped to 25% per pass -> ~250 bytes -> ~3 blocks.
        assert!(chosen.len() <= 4);
    }
}
