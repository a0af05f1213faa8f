//! Opportunistic altruistic-space filler (spec §4.9, C9).
//!
//! Grounded on the teacher's epidemic-storage worker-pool shape (bounded
//! `tokio::sync::mpsc::channel` feeding a fixed pool of fetch tasks).
//! Adds rate limiting, per-block blacklisting after repeated failures,
//! and a global pause when the flex pool is too full to be worth
//! fetching into (spec §9 Open Question 3: an explicit `paused_until`
//! field rather than a sentinel map key).

use crate::cache::AltruisticCache;
use crate::config::OpportunisticSettings;
use crate::coordination::CoordinationEngine;
use crate::external::BlockFetcher;
use crate::types::{BlockOrigin, Cid};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

struct ErrorRecord {
    retries: AtomicU32,
    blacklisted: std::sync::atomic::AtomicBool,
}

/// Periodically looks for high-value blocks worth opportunistically
/// caching into the altruistic tier, and runs a bounded pool of fetch
/// workers to pull them in.
pub struct OpportunisticFetcher {
    settings: OpportunisticSettings,
    cache: Arc<AltruisticCache>,
    coordination: Arc<CoordinationEngine>,
    fetcher: Arc<dyn BlockFetcher>,
    errors: DashMap<Cid, ErrorRecord>,
    last_attempt: DashMap<Cid, Instant>,
    semaphore: Arc<Semaphore>,
    paused_until: parking_lot::Mutex<Option<Instant>>,
    queue_tx: mpsc::Sender<Cid>,
    queue_rx: parking_lot::Mutex<Option<mpsc::Receiver<Cid>>>,
    cancel: CancellationToken,
}

impl OpportunisticFetcher {
    pub fn new(
        settings: OpportunisticSettings,
        cache: Arc<AltruisticCache>,
        coordination: Arc<CoordinationEngine>,
        fetcher: Arc<dyn BlockFetcher>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        let max_concurrent = settings.max_concurrent;
        Arc::new(Self {
            settings,
            cache,
            coordination,
            fetcher,
            errors: DashMap::new(),
            last_attempt: DashMap::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            paused_until: parking_lot::Mutex::new(None),
            queue_tx: tx,
            queue_rx: parking_lot::Mutex::new(Some(rx)),
            cancel: CancellationToken::new(),
        })
    }

    fn is_paused(&self) -> bool {
        match *self.paused_until.lock() {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    fn pause_for(&self, duration: Duration) {
        *self.paused_until.lock() = Some(Instant::now() + duration);
    }

    fn is_blacklisted(&self, cid: &Cid) -> bool {
        self.errors
            .get(cid)
            .map(|r| r.blacklisted.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    fn record_failure(&self, cid: &Cid) {
        let entry = self.errors.entry(cid.clone()).or_insert_with(|| ErrorRecord {
            retries: AtomicU32::new(0),
            blacklisted: std::sync::atomic::AtomicBool::new(false),
        });
        let retries = entry.retries.fetch_add(1, Ordering::AcqRel) + 1;
        if retries >= self.settings.max_error_retries {
            entry.blacklisted.store(true, Ordering::Release);
            warn!(%cid, retries, "blacklisting block after repeated fetch failures");
        }
    }

    /// Single check pass: decide whether the flex pool has room, and if
    /// so enqueue high-value, not-yet-cached, not-blacklisted blocks.
    #[instrument(skip(self, candidates))]
    pub fn check_once(&self, candidates: &[(Cid, f64, u64)]) {
        let stats = self.cache.get_altruistic_stats();
        if 1.0 - stats.flex_pool_usage < self.settings.min_flex_pool_free {
            self.pause_for(Duration::from_secs(self.settings.fetch_cooldown_secs));
            return;
        }
        if self.is_paused() {
            return;
        }

        let cooldown = Duration::from_secs(self.settings.fetch_cooldown_secs);
        let mut enqueued = 0usize;
        for (cid, value, size) in candidates {
            if enqueued >= self.settings.batch_size {
                break;
            }
            if *value < self.settings.value_threshold {
                continue;
            }
            if *size > self.settings.max_block_size {
                continue;
            }
            if self.is_blacklisted(cid) {
                continue;
            }
            if let Some(last) = self.last_attempt.get(cid) {
                if last.elapsed() < cooldown {
                    continue;
                }
            }
            if self.queue_tx.try_send(cid.clone()).is_ok() {
                self.last_attempt.insert(cid.clone(), Instant::now());
                enqueued += 1;
            }
        }
    }

    /// Run the fixed-size fetch worker pool until cancelled.
    pub async fn run_workers(self: Arc<Self>) {
        let mut rx = self
            .queue_rx
            .lock()
            .take()
            .expect("run_workers called more than once");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("opportunistic fetcher shutting down");
                    return;
                }
                maybe_cid = rx.recv() => {
                    let Some(cid) = maybe_cid else { return };
                    let Ok(permit) = self.semaphore.clone().acquire_owned().await else {
                        return;
                    };
                    let this = Arc::clone(&self);
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.fetch_one(cid).await;
                    });
                }
            }
        }
    }

    async fn fetch_one(&self, cid: Cid) {
        if self.cache.has(&cid).await {
            return;
        }
        match self.fetcher.fetch(&cid).await {
            Ok(bytes) => {
                if let Err(err) = self.cache.store(cid.clone(), bytes, BlockOrigin::Altruistic).await {
                    debug!(%cid, error = %err, "opportunistic store failed");
                }
            }
            Err(err) => {
                warn!(%cid, error = %err, "opportunistic fetch failed");
                self.record_failure(&cid);
            }
        }
    }

    /// Background check loop: every `check_interval_secs`, re-derive
    /// candidates via `coordination`'s high-demand set and run a check pass.
    pub async fn run_checker<F>(self: Arc<Self>, candidates: F)
    where
        F: Fn(&CoordinationEngine) -> Vec<(Cid, f64, u64)> + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.check_interval_secs));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    let batch = candidates(&self.coordination);
                    self.check_once(&batch);
                }
            }
        }
    }

    /// Periodically clears blacklist entries that have aged out, giving
    /// blocks another chance after `error_backoff_secs`.
    pub async fn run_cleanup(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.error_backoff_secs));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = ticker.tick() => {
                    self.errors.clear();
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use crate::eviction::NoHealthLookup;
    use crate::external::BlockStore;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct MemStore(StdMutex<HashMap<Cid, Vec<u8>>>);

    #[async_trait]
    impl BlockStore for MemStore {
        async fn store(&self, cid: &Cid, bytes: Vec<u8>) -> crate::error::Result<()> {
            self.0.lock().unwrap().insert(cid.clone(), bytes);
            Ok(())
        }
        async fn get(&self, cid: &Cid) -> crate::error::Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(cid).cloned())
        }
        async fn has(&self, cid: &Cid) -> crate::error::Result<bool> {
            Ok(self.0.lock().unwrap().contains_key(cid))
        }
        async fn remove(&self, cid: &Cid) -> crate::error::Result<()> {
            self.0.lock().unwrap().remove(cid);
            Ok(())
        }
        async fn size(&self) -> crate::error::Result<u64> {
            Ok(0)
        }
        async fn clear(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    struct AlwaysFails;

    #[async_trait]
    impl BlockFetcher for AlwaysFails {
        async fn fetch(&self, _cid: &Cid) -> crate::error::Result<Vec<u8>> {
            Err(crate::error::CacheError::backend("nope"))
        }
    }

    fn fetcher() -> Arc<OpportunisticFetcher> {
        let cache = Arc::new(AltruisticCache::new(
            Arc::new(MemStore(StdMutex::new(HashMap::new()))),
            Arc::new(NoHealthLookup),
            &CacheSettings::default(),
        ));
        OpportunisticFetcher::new(
            OpportunisticSettings::default(),
            cache,
            Arc::new(CoordinationEngine::new()),
            Arc::new(AlwaysFails),
        )
    }

    #[test]
    fn candidates_below_value_threshold_are_skipped() {
        let f = fetcher();
        f.check_once(&[(Cid::new("low"), 0.1, 10)]);
        assert!(!f.is_blacklisted(&Cid::new("low")));
    }

    #[tokio::test]
    async fn repeated_failures_blacklist_the_block() {
        let f = fetcher();
        let cid = Cid::new("bad");
        for _ in 0..5 {
            f.fetch_one(cid.clone()).await;
        }
        assert!(f.is_blacklisted(&cid));
    }

    #[test]
    fn pause_blocks_further_enqueues() {
        let f = fetcher();
        f.pause_for(Duration::from_secs(60));
        assert!(f.is_paused());
    }
}
