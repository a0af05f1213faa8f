//! Two-tier capacity controller (spec §4.5, C5).
//!
//! Grounded on the teacher's `storage/memory_storage.rs` store/evict shape
//! (size accounting via `AtomicU64`, candidate-collection eviction) and on
//! the two-tier reach-isolated cache pattern from the example pack's
//! `cache-tiered.rs`: an altruistic admission may never evict a personal
//! block, and a personal admission may only evict altruistic blocks (and
//! only after `MinPersonal` headroom is accounted for).

use crate::error::{CacheError, Result};
use crate::eviction::{policy_for, EvictionPolicy, EvictionStrategyKind, HealthLookup, NoHealthLookup};
use crate::external::BlockStore;
use crate::types::{BlockMetadata, BlockOrigin, Cid};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, instrument};

/// Snapshot of the cache's current capacity accounting.
#[derive(Debug, Clone, Copy)]
pub struct AltruisticStats {
    pub total_capacity: u64,
    pub personal_bytes: u64,
    pub altruistic_bytes: u64,
    pub min_personal: u64,
    pub flex_pool_bytes: u64,
    pub flex_pool_free_bytes: u64,
    /// Altruistic tier fill ratio against its budget (`total_capacity -
    /// min_personal`), in `[0, 1]` (spec §4.5).
    pub flex_pool_usage: f64,
    pub personal_blocks: u64,
    pub altruistic_blocks: u64,
}

/// Two-tier fixed-capacity block cache. Accounting (`BlockMetadata`,
/// byte totals) is held under `parking_lot::RwLock`/`DashMap` and never
/// touched while awaiting I/O; the backing byte store is reached only
/// after the in-memory admission decision commits.
pub struct AltruisticCache {
    store: Arc<dyn BlockStore>,
    health: Arc<dyn HealthLookup + Send + Sync>,
    metadata: DashMap<Cid, BlockMetadata>,
    personal_bytes: AtomicU64,
    altruistic_bytes: AtomicU64,
    total_capacity: u64,
    min_personal: u64,
    enable_altruistic: bool,
    eviction_strategy: EvictionStrategyKind,
    enable_gradual_eviction: bool,
    last_eviction: RwLock<Option<Instant>>,
    eviction_cooldown: std::time::Duration,
}

impl AltruisticCache {
    pub fn new(
        store: Arc<dyn BlockStore>,
        health: Arc<dyn HealthLookup + Send + Sync>,
        settings: &crate::config::CacheSettings,
    ) -> Self {
        Self {
            store,
            health,
            metadata: DashMap::new(),
            personal_bytes: AtomicU64::new(0),
            altruistic_bytes: AtomicU64::new(0),
            total_capacity: settings.total_capacity,
            min_personal: settings.min_personal,
            enable_altruistic: settings.enable_altruistic,
            eviction_strategy: settings.eviction_strategy,
            enable_gradual_eviction: settings.enable_gradual_eviction,
            last_eviction: RwLock::new(None),
            eviction_cooldown: std::time::Duration::from_millis(settings.eviction_cooldown_ms),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.personal_bytes.load(Ordering::Acquire) + self.altruistic_bytes.load(Ordering::Acquire)
    }

    fn available_bytes(&self) -> u64 {
        self.total_capacity.saturating_sub(self.used_bytes())
    }

    /// Bytes reserved for personal use but not currently occupied by a
    /// personal block; altruistic admission may use this "flex pool" but
    /// must retreat from it as personal demand grows.
    fn flex_pool_free(&self) -> u64 {
        let personal = self.personal_bytes.load(Ordering::Acquire);
        self.min_personal.saturating_sub(personal)
    }

    /// Store a block. If `cid` is already resident (e.g. an altruistic
    /// block being upgraded to personal, spec §4.5 step 1), its prior
    /// origin's bytes are released before the new origin is admitted, and
    /// its `popularity`/`last_accessed` history is carried over rather than
    /// reset.
    #[instrument(skip(self, bytes))]
    pub async fn store(&self, cid: Cid, bytes: Vec<u8>, origin: BlockOrigin) -> Result<()> {
        let size = bytes.len() as u64;

        if size > self.total_capacity {
            return Err(CacheError::CapacityExceeded {
                needed: size,
                available: self.total_capacity,
            });
        }
        if origin == BlockOrigin::Altruistic && !self.enable_altruistic {
            return Err(CacheError::AltruisticDisabled);
        }

        // Pull any existing entry out of the metadata map entirely (not
        // just release its bytes) so admit()'s eviction scan can't pick
        // the very block being re-stored as its own eviction candidate.
        let existing = self.metadata.remove(&cid).map(|(_, meta)| meta);
        if let Some(old) = &existing {
            self.release(old.size, old.origin);
        }
        if let Err(err) = self.admit(size, origin) {
            if let Some(old) = existing {
                self.reserve(old.size, old.origin);
                self.metadata.insert(old.cid.clone(), old);
            }
            return Err(err);
        }

        self.store.store(&cid, bytes).await?;
        let mut meta = BlockMetadata::new(cid.clone(), size, origin);
        if let Some(old) = existing {
            meta.popularity = old.popularity;
            meta.last_accessed = old.last_accessed;
        }
        self.metadata.insert(cid, meta);
        Ok(())
    }

    /// Decide whether `size` bytes of `origin` can be admitted, evicting
    /// altruistic blocks as needed. Personal admission may dip into the
    /// flex pool and evict altruistic blocks down to zero if necessary;
    /// altruistic admission may only use space beyond `MinPersonal` and
    /// may never evict a personal block.
    ///
    /// The altruistic budget (`total_capacity - min_personal`) is checked
    /// against the full requested size *before* any free-space shortcut,
    /// so an altruistic store can never bypass the MinPersonal guarantee
    /// just because raw bytes happen to be free elsewhere (spec §3, §4.5
    /// step 4).
    fn admit(&self, size: u64, origin: BlockOrigin) -> Result<()> {
        if origin == BlockOrigin::Altruistic {
            let altruistic_budget = self.total_capacity.saturating_sub(self.min_personal);
            let current_altruistic = self.altruistic_bytes.load(Ordering::Acquire);
            if current_altruistic + size > altruistic_budget {
                return Err(CacheError::CapacityExceeded {
                    needed: size,
                    available: altruistic_budget.saturating_sub(current_altruistic),
                });
            }
        }

        let available = self.available_bytes();
        if available >= size {
            self.reserve(size, origin);
            return Ok(());
        }

        let needed = size - available;
        let freed = self.evict_altruistic(needed)?;
        if freed < needed {
            return Err(CacheError::InsufficientAltruisticSpace(needed - freed));
        }
        self.reserve(size, origin);
        Ok(())
    }

    fn reserve(&self, size: u64, origin: BlockOrigin) {
        match origin {
            BlockOrigin::Personal => self.personal_bytes.fetch_add(size, Ordering::AcqRel),
            BlockOrigin::Altruistic => self.altruistic_bytes.fetch_add(size, Ordering::AcqRel),
        };
    }

    fn release(&self, size: u64, origin: BlockOrigin) {
        match origin {
            BlockOrigin::Personal => self.personal_bytes.fetch_sub(size, Ordering::AcqRel),
            BlockOrigin::Altruistic => self.altruistic_bytes.fetch_sub(size, Ordering::AcqRel),
        };
    }

    /// Evict altruistic blocks until at least `target_bytes` is freed (or
    /// the altruistic tier is exhausted). Enforces `EvictionCooldownActive`
    /// unless `enable_gradual_eviction` is off.
    fn evict_altruistic(&self, target_bytes: u64) -> Result<u64> {
        if self.enable_gradual_eviction {
            let mut last = self.last_eviction.write();
            if let Some(at) = *last {
                let elapsed = at.elapsed();
                if elapsed < self.eviction_cooldown {
                    return Err(CacheError::EvictionCooldownActive {
                        remaining_ms: (self.eviction_cooldown - elapsed).as_millis() as u64,
                    });
                }
            }
            *last = Some(Instant::now());
        }

        let now = crate::types::now_secs();
        let owned_blocks: Vec<BlockMetadata> = self
            .metadata
            .iter()
            .filter(|entry| entry.value().origin == BlockOrigin::Altruistic)
            .map(|entry| entry.value().clone())
            .collect();
        let refs: Vec<&BlockMetadata> = owned_blocks.iter().collect();

        let utilization = self.used_bytes() as f64 / self.total_capacity.max(1) as f64;
        let policy = policy_for(self.eviction_strategy, utilization);
        let chosen = policy.select(&refs, target_bytes, now, self.health.as_ref());

        let mut freed = 0u64;
        for meta in chosen {
            self.metadata.remove(&meta.cid);
            self.release(meta.size, BlockOrigin::Altruistic);
            freed += meta.size;
            debug!(cid = %meta.cid, size = meta.size, "evicted altruistic block");
        }
        Ok(freed)
    }

    pub async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
        if let Some(mut entry) = self.metadata.get_mut(cid) {
            entry.touch();
        } else {
            return Ok(None);
        }
        self.store.get(cid).await
    }

    pub async fn has(&self, cid: &Cid) -> bool {
        self.metadata.contains_key(cid)
    }

    pub async fn remove(&self, cid: &Cid) -> Result<bool> {
        let Some((_, meta)) = self.metadata.remove(cid) else {
            return Ok(false);
        };
        self.release(meta.size, meta.origin);
        self.store.remove(cid).await?;
        Ok(true)
    }

    pub async fn clear(&self) -> Result<()> {
        self.metadata.clear();
        self.personal_bytes.store(0, Ordering::Release);
        self.altruistic_bytes.store(0, Ordering::Release);
        self.store.clear().await
    }

    pub fn size(&self) -> u64 {
        self.used_bytes()
    }

    /// Altruistic blocks eligible to serve as randomizers for new uploads
    /// (spec §4.5): blocks not about to be evicted, sampled by popularity.
    pub fn get_randomizers(&self, n: usize) -> Vec<Cid> {
        let mut candidates: Vec<(Cid, u64)> = self
            .metadata
            .iter()
            .filter(|e| e.value().origin == BlockOrigin::Altruistic)
            .map(|e| (e.key().clone(), e.value().popularity))
            .collect();
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates.into_iter().take(n).map(|(cid, _)| cid).collect()
    }

    pub fn get_altruistic_stats(&self) -> AltruisticStats {
        let altruistic_bytes = self.altruistic_bytes.load(Ordering::Acquire);
        let altruistic_budget = self.total_capacity.saturating_sub(self.min_personal).max(1);
        let (personal_blocks, altruistic_blocks) =
            self.metadata.iter().fold((0u64, 0u64), |(p, a), entry| match entry.value().origin {
                BlockOrigin::Personal => (p + 1, a),
                BlockOrigin::Altruistic => (p, a + 1),
            });
        AltruisticStats {
            total_capacity: self.total_capacity,
            personal_bytes: self.personal_bytes.load(Ordering::Acquire),
            altruistic_bytes,
            min_personal: self.min_personal,
            flex_pool_bytes: self.min_personal,
            flex_pool_free_bytes: self.flex_pool_free(),
            flex_pool_usage: altruistic_bytes as f64 / altruistic_budget as f64,
            personal_blocks,
            altruistic_blocks,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheSettings;
    use async_trait::async_trait;
    use std::sync::Mutex as StdMutex;

    struct MemStore(StdMutex<std::collections::HashMap<Cid, Vec<u8>>>);

    impl MemStore {
        fn new() -> Arc<Self> {
            Arc::new(Self(StdMutex::new(std::collections::HashMap::new())))
        }
    }

    #[async_trait]
    impl BlockStore for MemStore {
        async fn store(&self, cid: &Cid, bytes: Vec<u8>) -> Result<()> {
            self.0.lock().unwrap().insert(cid.clone(), bytes);
            Ok(())
        }
        async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>> {
            Ok(self.0.lock().unwrap().get(cid).cloned())
        }
        async fn has(&self, cid: &Cid) -> Result<bool> {
            Ok(self.0.lock().unwrap().contains_key(cid))
        }
        async fn remove(&self, cid: &Cid) -> Result<()> {
            self.0.lock().unwrap().remove(cid);
            Ok(())
        }
        async fn size(&self) -> Result<u64> {
            Ok(self.0.lock().unwrap().values().map(|v| v.len() as u64).sum())
        }
        async fn clear(&self) -> Result<()> {
            self.0.lock().unwrap().clear();
            Ok(())
        }
    }

    fn cache(total_capacity: u64, min_personal: u64) -> AltruisticCache {
        let mut settings = CacheSettings::default();
        settings.total_capacity = total_capacity;
        settings.min_personal = min_personal;
        settings.enable_gradual_eviction = false;
        AltruisticCache::new(MemStore::new(), Arc::new(NoHealthLookup), &settings)
    }

    #[tokio::test]
    async fn store_and_get_round_trips() {
        let c = cache(1000, 0);
        c.store(Cid::new("a"), vec![1, 2, 3], BlockOrigin::Personal)
            .await
            .unwrap();
        assert_eq!(c.get(&Cid::new("a")).await.unwrap(), Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn altruistic_store_is_rejected_when_disabled() {
        let mut settings = CacheSettings::default();
        settings.enable_altruistic = false;
        let c = AltruisticCache::new(MemStore::new(), Arc::new(NoHealthLookup), &settings);
        let err = c
            .store(Cid::new("a"), vec![0; 10], BlockOrigin::Altruistic)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::AltruisticDisabled));
    }

    #[tokio::test]
    async fn altruistic_admission_never_evicts_personal_blocks() {
        let c = cache(20, 10);
        c.store(Cid::new("p"), vec![0; 10], BlockOrigin::Personal)
            .await
            .unwrap();
        // Remaining capacity is 10 bytes, all reserved for personal headroom
        // beyond min_personal=10 being already fully consumed: no altruistic
        // space remains.
        let err = c
            .store(Cid::new("a"), vec![0; 15], BlockOrigin::Altruistic)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { .. }));
        assert!(c.has(&Cid::new("p")).await);
    }

    #[tokio::test]
    async fn personal_admission_evicts_altruistic_blocks() {
        let c = cache(20, 0);
        c.store(Cid::new("a"), vec![0; 15], BlockOrigin::Altruistic)
            .await
            .unwrap();
        c.store(Cid::new("p"), vec![0; 10], BlockOrigin::Personal)
            .await
            .unwrap();
        assert!(!c.has(&Cid::new("a")).await);
        assert!(c.has(&Cid::new("p")).await);
    }

    #[tokio::test]
    async fn capacity_exceeded_when_block_larger_than_total() {
        let c = cache(10, 0);
        let err = c
            .store(Cid::new("huge"), vec![0; 100], BlockOrigin::Personal)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::CapacityExceeded { .. }));
    }

    #[tokio::test]
    async fn remove_frees_accounted_bytes() {
        let c = cache(100, 0);
        c.store(Cid::new("a"), vec![0; 10], BlockOrigin::Personal)
            .await
            .unwrap();
        assert_eq!(c.size(), 10);
        c.remove(&Cid::new("a")).await.unwrap();
        assert_eq!(c.size(), 0);
    }
}
