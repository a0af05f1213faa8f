//! Health gossip protocol: periodic broadcast/ingest of differentially
//! private aggregate stats (spec §4.7, C7).
//!
//! Grounded on the teacher's `storage/epidemic_storage.rs` gossip-round
//! background task (`tokio::spawn` + `tokio::time::interval` + a running
//! flag checked each tick), translated here to `CancellationToken` since
//! that's the cancellation idiom the rest of this crate uses.

use crate::config::GossipSettings;
use crate::error::{CacheError, Result};
use crate::external::{PubSub, TOPIC_HEALTH_GOSSIP};
use crate::health::BlockHealthTracker;
use crate::types::{now_secs, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

const PROTOCOL_VERSION: u32 = 1;

/// Wire message broadcast by `HealthGossiper` (spec §4.7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthGossipMessage {
    pub version: u32,
    pub sender: PeerId,
    pub sent_at_secs: u64,
    pub cache_utilization: f64,
    pub altruistic_bytes: f64,
    pub block_count: f64,
    pub average_value: f64,
}

/// Locally derived estimate of a peer's cache health, built from ingested
/// gossip messages.
#[derive(Debug, Clone, Copy)]
pub struct PeerHealthEstimate {
    pub cache_utilization: f64,
    pub altruistic_bytes: f64,
    pub block_count: f64,
    pub average_value: f64,
    pub last_seen_secs: u64,
}

/// Periodically broadcasts this node's (noised) aggregate health and
/// ingests peers' broadcasts, rejecting stale or version-mismatched
/// messages.
pub struct HealthGossiper {
    settings: GossipSettings,
    pubsub: Arc<dyn PubSub>,
    health: Arc<BlockHealthTracker>,
    self_id: PeerId,
    peers: dashmap::DashMap<PeerId, PeerHealthEstimate>,
    cancel: CancellationToken,
}

impl HealthGossiper {
    pub fn new(
        settings: GossipSettings,
        pubsub: Arc<dyn PubSub>,
        health: Arc<BlockHealthTracker>,
        self_id: PeerId,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            pubsub,
            health,
            self_id,
            peers: dashmap::DashMap::new(),
            cancel: CancellationToken::new(),
        })
    }

    /// Build this node's outgoing gossip message, applying differential
    /// privacy noise to every reported aggregate independently (spec §9
    /// Open Question 4: no cross-field privacy-loss accounting).
    fn build_message(&self, utilization: f64, altruistic_bytes: u64, block_count: usize) -> Result<HealthGossipMessage> {
        let hints = self.health.get_all_hints();
        let average_value = if hints.is_empty() {
            0.0
        } else {
            hints
                .iter()
                .filter_map(|(cid, _)| self.health.value(cid))
                .sum::<f64>()
                / hints.len() as f64
        };

        Ok(HealthGossipMessage {
            version: PROTOCOL_VERSION,
            sender: self.self_id.clone(),
            sent_at_secs: now_secs(),
            cache_utilization: self.health.add_dp_noise(utilization)?,
            altruistic_bytes: self.health.add_dp_noise(altruistic_bytes as f64)?,
            block_count: self.health.add_dp_noise(block_count as f64)?,
            average_value: self.health.add_dp_noise(average_value)?,
        })
    }

    #[instrument(skip(self))]
    pub async fn broadcast_once(&self, utilization: f64, altruistic_bytes: u64, block_count: usize) -> Result<()> {
        if block_count < self.settings.min_blocks_for_gossip {
            debug!(block_count, "skipping gossip round, too few blocks to report");
            return Ok(());
        }
        let message = self.build_message(utilization, altruistic_bytes, block_count)?;
        let payload = serde_json::to_vec(&message)?;
        self.pubsub.publish(TOPIC_HEALTH_GOSSIP, payload).await
    }

    /// Validate and absorb an inbound gossip message.
    #[instrument(skip(self, payload))]
    pub fn ingest(&self, payload: &[u8]) -> Result<()> {
        let message: HealthGossipMessage = serde_json::from_slice(payload)?;
        if message.version != PROTOCOL_VERSION {
            return Err(CacheError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                actual: message.version,
            });
        }
        let age = now_secs().saturating_sub(message.sent_at_secs);
        if age > self.settings.message_staleness_secs {
            return Err(CacheError::MessageStale {
                age_secs: age,
                limit_secs: self.settings.message_staleness_secs,
            });
        }
        if message.sender == self.self_id {
            return Ok(());
        }

        self.peers.insert(
            message.sender.clone(),
            PeerHealthEstimate {
                cache_utilization: message.cache_utilization,
                altruistic_bytes: message.altruistic_bytes,
                block_count: message.block_count,
                average_value: message.average_value,
                last_seen_secs: now_secs(),
            },
        );
        Ok(())
    }

    pub fn peer_estimates(&self) -> HashMap<PeerId, PeerHealthEstimate> {
        self.peers.iter().map(|e| (e.key().clone(), *e.value())).collect()
    }

    /// Background loop: every `gossip_interval_secs`, publish a gossip
    /// round via `snapshot` (a caller-supplied (utilization, bytes, count)
    /// reader) until cancelled.
    pub async fn run<F>(self: Arc<Self>, snapshot: F)
    where
        F: Fn() -> (f64, u64, usize) + Send + Sync + 'static,
    {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(self.settings.gossip_interval_secs));
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("health gossiper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let (utilization, altruistic_bytes, block_count) = snapshot();
                    if let Err(err) = self.broadcast_once(utilization, altruistic_bytes, block_count).await {
                        warn!(error = %err, "gossip broadcast failed");
                    }
                }
            }
        }
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}
