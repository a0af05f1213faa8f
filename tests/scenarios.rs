//! End-to-end scenarios from spec §8, exercised against an in-memory
//! `BlockStore` test double.

use altruistic_cache::cache::AltruisticCache;
use altruistic_cache::config::CacheSettings;
use altruistic_cache::coordination::CoordinationEngine;
use altruistic_cache::error::Result;
use altruistic_cache::eviction::NoHealthLookup;
use altruistic_cache::external::BlockStore;
use altruistic_cache::health::BlockHealthTracker;
use altruistic_cache::types::{BlockOrigin, Cid, PeerId, ReplicationBucket};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

struct InMemoryStore(Mutex<HashMap<Cid, Vec<u8>>>);

impl InMemoryStore {
    fn new() -> Arc<Self> {
        Arc::new(Self(Mutex::new(HashMap::new())))
    }
}

#[async_trait]
impl BlockStore for InMemoryStore {
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

fn settings(total_capacity: u64, min_personal: u64) -> CacheSettings {
    let mut s = CacheSettings::default();
    s.total_capacity = total_capacity;
    s.min_personal = min_personal;
    s.enable_gradual_eviction = false;
    s
}

#[tokio::test]
async fn min_personal_guarantee_survives_altruistic_pressure() {
    let cache = AltruisticCache::new(InMemoryStore::new(), Arc::new(NoHealthLookup), &settings(100, 40));

    // Fill the altruistic tier with as much as it's allowed (60 bytes of
    // headroom beyond the 40-byte personal reservation).
    cache
        .store(Cid::new("alt1"), vec![0; 60], BlockOrigin::Altruistic)
        .await
        .unwrap();

    // Personal demand up to MinPersonal must always be satisfiable by
    // evicting altruistic blocks, never rejected for lack of space.
    cache
        .store(Cid::new("p1"), vec![0; 40], BlockOrigin::Personal)
        .await
        .unwrap();

    assert!(cache.has(&Cid::new("p1")).await);
    assert!(!cache.has(&Cid::new("alt1")).await);
}

#[tokio::test]
async fn altruistic_cap_is_enforced_beyond_min_personal_headroom() {
    let cache = AltruisticCache::new(InMemoryStore::new(), Arc::new(NoHealthLookup), &settings(100, 50));

    cache
        .store(Cid::new("alt1"), vec![0; 50], BlockOrigin::Altruistic)
        .await
        .unwrap();

    let err = cache
        .store(Cid::new("alt2"), vec![0; 10], BlockOrigin::Altruistic)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        altruistic_cache::error::CacheError::CapacityExceeded { .. }
    ));
}

#[tokio::test]
async fn value_based_eviction_prefers_low_value_blocks() {
    use altruistic_cache::eviction::{EvictionPolicy, ValueBasedPolicy};
    use altruistic_cache::types::BlockMetadata;

    let health = BlockHealthTracker::new(altruistic_cache::config::HealthSettings::default());
    health.update_block_health(&Cid::new("valuable"), ReplicationBucket::Low);
    health.update_block_health(&Cid::new("common"), ReplicationBucket::High);

    let valuable = BlockMetadata::new(Cid::new("valuable"), 10, BlockOrigin::Altruistic);
    let common = BlockMetadata::new(Cid::new("common"), 10, BlockOrigin::Altruistic);
    let blocks = vec![&valuable, &common];

    let chosen = ValueBasedPolicy.select(&blocks, 10, altruistic_cache::types::now_secs(), health.as_ref());
    assert_eq!(chosen[0].cid, common.cid);
}

#[tokio::test]
async fn coordination_score_is_bounded_and_symmetric_inputs_agree() {
    use altruistic_cache::bloom::BloomFilter;

    let coordination = CoordinationEngine::new();
    let mut a = BloomFilter::new(1000, 0.01);
    let mut b = BloomFilter::new(1000, 0.01);
    for i in 0..100 {
        a.add(format!("shared-{i}").as_bytes());
        b.add(format!("shared-{i}").as_bytes());
    }
    let score = coordination.coordination_score(&a, &b);
    assert!((0.0..=1.0).contains(&score));
}

#[tokio::test]
async fn gossip_rejects_stale_messages() {
    use altruistic_cache::config::GossipSettings;
    use altruistic_cache::external::PubSub;
    use altruistic_cache::gossip::{HealthGossipMessage, HealthGossiper};
    use futures::stream::BoxStream;

    struct NoopPubSub;
    #[async_trait]
    impl PubSub for NoopPubSub {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<()> {
            Ok(())
        }
        async fn subscribe(&self, _topic: &str) -> Result<BoxStream<'static, Vec<u8>>> {
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    let health = BlockHealthTracker::new(altruistic_cache::config::HealthSettings::default());
    let gossiper = HealthGossiper::new(
        GossipSettings::default(),
        Arc::new(NoopPubSub),
        health,
        PeerId::new("local"),
    );

    let stale = HealthGossipMessage {
        version: 1,
        sender: PeerId::new("remote"),
        sent_at_secs: 0,
        cache_utilization: 0.5,
        altruistic_bytes: 1000.0,
        block_count: 50.0,
        average_value: 4.0,
    };
    let payload = serde_json::to_vec(&stale).unwrap();
    assert!(gossiper.ingest(&payload).is_err());
}

#[tokio::test]
async fn sequential_prefetch_detects_adjacent_reads() {
    use altruistic_cache::prefetch::{FileDescriptor, SequentialAccessTracker};

    let tracker = SequentialAccessTracker::new();
    let blocks: Vec<Cid> = (0..5).map(|i| Cid::new(format!("seq-{i}"))).collect();
    tracker.register_descriptor(FileDescriptor {
        file_id: "file-1".into(),
        blocks: blocks.clone(),
    });

    tracker.track_access("file-1", &blocks[0]);
    let prefetch_hits = tracker.track_access("file-1", &blocks[1]);
    assert!(!prefetch_hits.is_empty());
    assert_eq!(prefetch_hits[0], blocks[2]);
}
