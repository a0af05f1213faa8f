//! Bloom filter exchange protocol (spec §4.8, C8).
//!
//! Grounded on the same epidemic-gossip background-task shape as
//! `gossip/mod.rs`, plus the teacher's `storage/health.rs` peer-table
//! eviction-by-age idiom, applied here to `PeerFilterSet` pruning.

use crate::bloom::BloomFilter;
use crate::coordination::CoordinationEngine;
use crate::config::BloomExchangeSettings;
use crate::error::{CacheError, Result};
use crate::external::{PubSub, TOPIC_BLOOM_EXCHANGE};
use crate::types::{now_secs, PeerId};
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const PROTOCOL_VERSION: u32 = 1;

/// The three filter categories exchanged between peers (spec §4.8).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BloomExchangeMessage {
    pub version: u32,
    pub sender: PeerId,
    pub sent_at_secs: u64,
    pub valuable_blocks: Vec<u8>,
    pub personal_blocks_sample: Vec<u8>,
    pub popular_randomizers: Vec<u8>,
}

struct PeerFilterSet {
    valuable_blocks: BloomFilter,
    personal_blocks_sample: BloomFilter,
    popular_randomizers: BloomFilter,
    received_at_secs: u64,
}

/// Exchanges categorized bloom filters with peers and feeds overlap
/// results into the `CoordinationEngine` to drive opportunistic fetch
/// hints.
pub struct BloomExchanger {
    settings: BloomExchangeSettings,
    pubsub: Arc<dyn PubSub>,
    coordination: Arc<CoordinationEngine>,
    self_id: PeerId,
    peer_filters: DashMap<PeerId, PeerFilterSet>,
    cancel: CancellationToken,
}

impl BloomExchanger {
    pub fn new(
        settings: BloomExchangeSettings,
        pubsub: Arc<dyn PubSub>,
        coordination: Arc<CoordinationEngine>,
        self_id: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            pubsub,
            coordination,
            self_id,
            peer_filters: DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Build and publish this node's current filter set. `personal_blocks`
    /// is sampled down to `personal_sample_rate` so a peer can never
    /// recover the full personal working set (spec §4.8 privacy note).
    #[instrument(skip(self, valuable_blocks, personal_blocks, popular_randomizers))]
    pub async fn exchange_once(
        &self,
        valuable_blocks: &BloomFilter,
        personal_blocks: &[crate::types::Cid],
        popular_randomizers: &BloomFilter,
    ) -> Result<()> {
        let mut sample = BloomFilter::new(personal_blocks.len().max(1), 0.01);
        let mut rng = rand::thread_rng();
        for cid in personal_blocks {
            if rng.gen::<f64>() < self.settings.personal_sample_rate {
                sample.add(cid.as_str().as_bytes());
            }
        }

        let message = BloomExchangeMessage {
            version: PROTOCOL_VERSION,
            sender: self.self_id.clone(),
            sent_at_secs: now_secs(),
            valuable_blocks: valuable_blocks.to_bytes(),
            personal_blocks_sample: sample.to_bytes(),
            popular_randomizers: popular_randomizers.to_bytes(),
        };
        let payload = serde_json::to_vec(&message)?;
        self.pubsub.publish(TOPIC_BLOOM_EXCHANGE, payload).await
    }

    #[instrument(skip(self, payload))]
    pub fn ingest(&self, payload: &[u8]) -> Result<()> {
        let message: BloomExchangeMessage = serde_json::from_slice(payload)?;
        if message.version != PROTOCOL_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: message.version,
            });
        }
        let age = now_secs().saturating_sub(message.sent_at_secs);
        if age > self.settings.filter_expiry_secs {
            return Err(CacheError::MessageStale {
                age_secs: age,
                limit_secs: self.settings.filter_expiry_secs,
            });
        }
        if message.sender == self.self_id {
            return Ok(());
        }

        self.evict_if_full();
        self.peer_filters.insert(
            message.sender,
            PeerFilterSet {
                valuable_blocks: BloomFilter::from_bytes(&message.valuable_blocks)?,
                personal_blocks_sample: BloomFilter::from_bytes(&message.personal_blocks_sample)?,
                popular_randomizers: BloomFilter::from_bytes(&message.popular_randomizers)?,
                received_at_secs: now_secs(),
            },
        );
        Ok(())
    }

    fn evict_if_full(&self) {
        if self.peer_filters.len() < self.settings.max_peer_filters {
            return;
        }
        if let Some(oldest) = self
            .peer_filters
            .iter()
            .min_by_key(|e| e.value().received_at_secs)
            .map(|e| e.key().clone())
        {
            self.peer_filters.remove(&oldest);
        }
    }

    /// Surface coordination hints for `cid` based on overlap between our
    /// `valuable_blocks` filter and each known peer's, only when at least
    /// `min_peers_for_coordination` peers are known.
    pub fn coordination_hints_for(
        &self,
        cid: &crate::types::Cid,
        local_valuable: &BloomFilter,
        n: usize,
    ) -> Vec<crate::coordination::CoordinationHint> {
        if self.peer_filters.len() < self.settings.min_peers_for_coordination {
            return Vec::new();
        }
        let peers: Vec<(PeerId, BloomFilter)> = self
            .peer_filters
            .iter()
            .map(|e| (e.key().clone(), e.value().valuable_blocks.clone()))
            .collect();
        self.coordination.suggest_peers(cid, &peers, local_valuable, n)
    }

    pub async fn run<F>(self: Arc<Self>, snapshot: F)
    where
        F: Fn() -> (BloomFilter, Vec<crate::types::Cid>, BloomFilter) + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.settings.exchange_interval_secs));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("bloom exchanger shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let (valuable, personal, randomizers) = snapshot();
                    if let Err(err) = self.exchange_once(&valuable, &personal, &randomizers).await {
                        warn!(error = %err, "bloom exchange failed");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
