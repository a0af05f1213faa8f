//! Block health tracking and swarm-value scoring (spec §4.2, C2).
//!
//! Grounded on the teacher's `storage/health.rs` `Arc<DashMap<...>>` plus
//! periodic cleanup-loop shape. Differential-privacy noise is added with a
//! cryptographically secure RNG; failure to obtain one is treated as fatal
//! rather than silently falling back to a weaker source (spec §4.2, §7
//! `FatalRng`).

use crate::config::HealthSettings;
use crate::error::{CacheError, Result};
use crate::eviction::HealthLookup;
use crate::types::{Cid, ReplicationBucket};
use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use rand::RngCore;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Observed replication/request signal for one block, as reported by
/// peers or derived locally (spec §4.2).
#[derive(Debug, Clone, Copy)]
pub struct BlockHint {
    pub replication: ReplicationBucket,
    pub request_rate: f64,
    pub last_requested_secs_ago: u64,
}

/// Internal per-block health record.
struct BlockHealth {
    replication: ReplicationBucket,
    request_count: u64,
    last_request_secs: u64,
    first_seen_secs: u64,
    cached_value: Mutex<Option<(f64, u64)>>,
}

impl BlockHealth {
    fn new(now: u64) -> Self {
        Self {
            replication: ReplicationBucket::Unknown,
            request_count: 0,
            last_request_secs: now,
            first_seen_secs: now,
            cached_value: Mutex::new(None),
        }
    }
}

/// Deterministic additive value function (spec §4.2): lower replication,
/// higher request rate, and younger first-seen age each push a block's
/// value up; scores are clamped to `[0, 10]`.
fn compute_value(health: &BlockHealth, now: u64) -> f64 {
    let replication_component = match health.replication {
        ReplicationBucket::Unknown => 5.0,
        ReplicationBucket::Low => 8.0,
        ReplicationBucket::Medium => 4.0,
        ReplicationBucket::High => 1.0,
    };

    let age_hours = ((now.saturating_sub(health.first_seen_secs)) as f64 / 3600.0).max(0.0);
    let request_rate = health.request_count as f64 / age_hours.max(1.0);
    let demand_component = (request_rate * 2.0).min(10.0);

    let recency_hours = ((now.saturating_sub(health.last_request_secs)) as f64 / 3600.0).max(0.0);
    let recency_component = (10.0 - recency_hours.min(10.0)).max(0.0);

    let raw = 0.5 * replication_component + 0.3 * demand_component + 0.2 * recency_component;
    raw.clamp(0.0, 10.0)
}

/// Tracks per-block health signals and derives a swarm-value score used by
/// the `ValueBased`/`Adaptive` eviction policies and the opportunistic
/// fetcher's admission threshold.
pub struct BlockHealthTracker {
    blocks: DashMap<Cid, BlockHealth>,
    settings: HealthSettings,
    noise_failures: AtomicU64,
    cancel: CancellationToken,
}

impl BlockHealthTracker {
    pub fn new(settings: HealthSettings) -> Arc<Self> {
        Arc::new(Self {
            blocks: DashMap::new(),
            settings,
            noise_failures: AtomicU64::new(0),
            cancel: CancellationToken::new(),
        })
    }

    #[instrument(skip(self))]
    pub fn update_block_health(&self, cid: &Cid, replication: ReplicationBucket) {
        let now = crate::types::now_secs();
        let mut entry = self
            .blocks
            .entry(cid.clone())
            .or_insert_with(|| BlockHealth::new(now));
        entry.replication = replication;
        *entry.cached_value.lock() = None;
    }

    #[instrument(skip(self))]
    pub fn record_request(&self, cid: &Cid) {
        let now = crate::types::now_secs();
        let mut entry = self
            .blocks
            .entry(cid.clone())
            .or_insert_with(|| BlockHealth::new(now));
        entry.request_count += 1;
        entry.last_request_secs = now;
        *entry.cached_value.lock() = None;
    }

    /// Current value score, `[0, 10]`, cached for `ValueCacheTime` seconds.
    pub fn value(&self, cid: &Cid) -> Option<f64> {
        let now = crate::types::now_secs();
        let entry = self.blocks.get(cid)?;
        let mut cache = entry.cached_value.lock();
        if let Some((value, stamped_at)) = *cache {
            if now.saturating_sub(stamped_at) < self.settings.value_cache_time_secs {
                return Some(value);
            }
        }
        let value = compute_value(&entry, now);
        *cache = Some((value, now));
        Some(value)
    }

    pub fn get_hint(&self, cid: &Cid) -> Option<BlockHint> {
        let now = crate::types::now_secs();
        let entry = self.blocks.get(cid)?;
        let age_hours = ((now.saturating_sub(entry.first_seen_secs)) as f64 / 3600.0).max(1.0 / 3600.0);
        Some(BlockHint {
            replication: entry.replication,
            request_rate: entry.request_count as f64 / age_hours,
            last_requested_secs_ago: now.saturating_sub(entry.last_request_secs),
        })
    }

    pub fn get_all_hints(&self) -> Vec<(Cid, BlockHint)> {
        self.blocks
            .iter()
            .filter_map(|entry| self.get_hint(entry.key()).map(|h| (entry.key().clone(), h)))
            .collect()
    }

    /// Most valuable blocks, descending by score, skipping any larger than
    /// `max_size` if a size lookup function is supplied by the caller.
    pub fn get_most_valuable(&self, n: usize) -> Vec<(Cid, f64)> {
        let mut scored: Vec<(Cid, f64)> = self
            .blocks
            .iter()
            .filter_map(|entry| self.value(entry.key()).map(|v| (entry.key().clone(), v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(n);
        scored
    }

    /// Add Laplace-mechanism differential-privacy noise to a reported
    /// aggregate value. Scale is `1/epsilon`. Fatal if a secure RNG cannot
    /// be sourced — never silently degrades to a weaker generator.
    pub fn add_dp_noise(&self, value: f64) -> Result<f64> {
        if !self.settings_dp_enabled() {
            return Ok(value);
        }
        let noise = self.sample_laplace(self.settings.privacy_epsilon)?;
        Ok(value + noise)
    }

    fn settings_dp_enabled(&self) -> bool {
        self.settings.privacy_epsilon > 0.0
    }

    fn sample_laplace(&self, epsilon: f64) -> Result<f64> {
        let scale = 1.0 / epsilon.max(f64::MIN_POSITIVE);
        let mut bytes = [0u8; 8];
        OsRng.try_fill_bytes(&mut bytes).map_err(|e| {
            self.noise_failures.fetch_add(1, Ordering::Relaxed);
            CacheError::FatalRng(format!("failed to source secure randomness: {e}"))
        })?;
        let u = (u64::from_le_bytes(bytes) as f64 / u64::MAX as f64) - 0.5;
        let sign = u.signum();
        let magnitude = 1.0 - 2.0 * u.abs();
        Ok(-scale * sign * magnitude.max(f64::MIN_POSITIVE).ln())
    }

    /// Background retention sweep: drops blocks untouched for longer than
    /// `RetentionWindow`.
    pub async fn run_cleanup_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.cleanup_interval_secs));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("health tracker cleanup loop shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    self.cleanup_once();
                }
            }
        }
    }

    fn cleanup_once(&self) {
        let now = crate::types::now_secs();
        let window = self.settings.retention_window_secs;
        let before = self.blocks.len();
        self.blocks
            .retain(|_, health| now.saturating_sub(health.last_request_secs) < window);
        let removed = before - self.blocks.len();
        if removed > 0 {
            debug!(removed, "health tracker cleanup removed stale entries");
        }
        if self.noise_failures.load(Ordering::Relaxed) > 0 {
            warn!(
                failures = self.noise_failures.load(Ordering::Relaxed),
                "DP noise sampling has failed at least once since startup"
            );
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

impl HealthLookup for BlockHealthTracker {
    fn value(&self, cid: &Cid) -> Option<f64> {
        BlockHealthTracker::value(self, cid)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> Arc<BlockHealthTracker> {
        BlockHealthTracker::new(HealthSettings::default())
    }

    #[test]
    fn unknown_block_has_no_value() {
        let t = tracker();
        assert!(t.value(&Cid::new("ghost")).is_none());
    }

    #[test]
    fn low_replication_scores_higher_than_high_replication() {
        let t = tracker();
        t.update_block_health(&Cid::new("rare"), ReplicationBucket::Low);
        t.update_block_health(&Cid::new("common"), ReplicationBucket::High);
        let rare = t.value(&Cid::new("rare")).unwrap();
        let common = t.value(&Cid::new("common")).unwrap();
        assert!(rare > common, "rare={rare} common={common}");
    }

    #[test]
    fn value_is_clamped_to_0_10() {
        let t = tracker();
        let cid = Cid::new("hot");
        t.update_block_health(&cid, ReplicationBucket::Low);
        for _ in 0..1000 {
            t.record_request(&cid);
        }
        let v = t.value(&cid).unwrap();
        assert!((0.0..=10.0).contains(&v));
    }

    #[test]
    fn record_request_updates_hint() {
        let t = tracker();
        let cid = Cid::new("x");
        t.record_request(&cid);
        let hint = t.get_hint(&cid).unwrap();
        assert!(hint.request_rate > 0.0);
    }

    #[test]
    fn get_most_valuable_is_descending() {
        let t = tracker();
        t.update_block_health(&Cid::new("a"), ReplicationBucket::High);
        t.update_block_health(&Cid::new("b"), ReplicationBucket::Low);
        let top = t.get_most_valuable(2);
        assert_eq!(top.len(), 2);
        assert!(top[0].1 >= top[1].1);
    }

    #[test]
    fn dp_noise_disabled_returns_input_unchanged() {
        let mut settings = HealthSettings::default();
        settings.privacy_epsilon = 0.0;
        let t = BlockHealthTracker::new(settings);
        assert_eq!(t.add_dp_noise(5.0).unwrap(), 5.0);
    }

    #[test]
    fn dp_noise_enabled_perturbs_value() {
        let t = tracker();
        let noised: Vec<f64> = (0..20).map(|_| t.add_dp_noise(5.0).unwrap()).collect();
        assert!(noised.iter().any(|v| (*v - 5.0).abs() > 1e-9));
    }
}
