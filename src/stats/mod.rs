//! Sampled runtime statistics (spec §4.10, C10).
//!
//! Grounded on the teacher's `MemoryStorageMetrics` atomic-counter shape
//! and the `AtomicU64`/`Ordering` usage throughout
//! `storage/epidemic_storage.rs`. Per-block popularity is sampled rather
//! than tracked exhaustively, and halved on overflow of a bounded map
//! instead of growing without limit.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

const MAX_POPULARITY_ENTRIES: usize = 10_000;
const LATENCY_SAMPLE_RATE: u32 = 10; // record 1 in 10 requests

/// Lock-free counters plus a bounded, periodically-halved popularity map.
pub struct SampledStats {
    hits: AtomicU64,
    misses: AtomicU64,
    stores: AtomicU64,
    evictions: AtomicU64,
    latency_sum_micros: AtomicU64,
    latency_samples: AtomicU64,
    request_counter: AtomicU64,
    popularity: DashMap<String, u64>,
}

impl SampledStats {
    pub fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            stores: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            latency_sum_micros: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            request_counter: AtomicU64::new(0),
            popularity: DashMap::new(),
        }
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_store(&self) {
        self.stores.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a request's latency, sampled at `1 / LATENCY_SAMPLE_RATE`.
    pub fn record_latency(&self, elapsed: Duration) {
        let n = self.request_counter.fetch_add(1, Ordering::Relaxed);
        if n % LATENCY_SAMPLE_RATE as u64 != 0 {
            return;
        }
        self.latency_sum_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Bump a block's popularity counter, halving the whole map when it
    /// grows past `MAX_POPULARITY_ENTRIES` rather than evicting entries
    /// outright.
    pub fn record_popularity(&self, key: &str) {
        if self.popularity.len() > MAX_POPULARITY_ENTRIES {
            for mut entry in self.popularity.iter_mut() {
                *entry.value_mut() /= 2;
            }
            self.popularity.retain(|_, count| *count > 0);
        }
        *self.popularity.entry(key.to_string()).or_insert(0) += 1;
    }

    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed) as f64;
        let misses = self.misses.load(Ordering::Relaxed) as f64;
        if hits + misses == 0.0 {
            0.0
        } else {
            hits / (hits + misses)
        }
    }

    pub fn average_latency(&self) -> Duration {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        if samples == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.latency_sum_micros.load(Ordering::Relaxed) / samples)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stores: self.stores.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            hit_rate: self.hit_rate(),
            average_latency: self.average_latency(),
        }
    }
}

impl Default for SampledStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
    pub hit_rate: f64,
    pub average_latency: Duration,
}

/// Convenience RAII timer for `record_latency`.
pub struct LatencyTimer<'a> {
    stats: &'a SampledStats,
    started: Instant,
}

impl<'a> LatencyTimer<'a> {
    pub fn start(stats: &'a SampledStats) -> Self {
        Self {
            stats,
            started: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        self.stats.record_latency(self.started.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_rate_is_zero_with_no_activity() {
        let stats = SampledStats::new();
        assert_eq!(stats.hit_rate(), 0.0);
    }

    #[test]
    fn hit_rate_reflects_hits_and_misses() {
        let stats = SampledStats::new();
        stats.record_hit();
        stats.record_hit();
        stats.record_miss();
        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn popularity_halves_past_capacity() {
        let stats = SampledStats::new();
        for i in 0..(MAX_POPULARITY_ENTRIES + 1) {
            stats.record_popularity(&format!("k{i}"));
        }
        assert!(stats.popularity.len() <= MAX_POPULARITY_ENTRIES + 1);
    }

    #[test]
    fn latency_sampling_skips_most_requests() {
        let stats = SampledStats::new();
        for _ in 0..LATENCY_SAMPLE_RATE {
            stats.record_latency(Duration::from_micros(100));
        }
        assert_eq!(stats.latency_samples.load(Ordering::Relaxed), 1);
    }
}
