//! External collaborator interfaces (spec §6).
//!
//! These traits describe the systems this crate treats as out of scope —
//! the byte-level block store, the fetch/retrieve callables used by the
//! opportunistic fetcher and prefetch worker, and the pub/sub transport
//! used by the gossip and bloom-exchange protocols. Only their interfaces
//! are specified here; production implementations live outside this crate.

use crate::error::Result;
use crate::types::Cid;
use async_trait::async_trait;
use futures::stream::BoxStream;

/// The underlying byte-level block store (memory/disk KV).
///
/// Concurrent reads are safe; concurrent writes are serialized by the
/// cache's admission path (spec §5).
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn store(&self, cid: &Cid, bytes: Vec<u8>) -> Result<()>;
    async fn get(&self, cid: &Cid) -> Result<Option<Vec<u8>>>;
    async fn has(&self, cid: &Cid) -> Result<bool>;
    async fn remove(&self, cid: &Cid) -> Result<()>;
    async fn size(&self) -> Result<u64>;
    async fn clear(&self) -> Result<()>;
}

/// Callable consumed by the `OpportunisticFetcher` to pull a block from
/// the network into the flex pool.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    async fn fetch(&self, cid: &Cid) -> Result<Vec<u8>>;
}

/// Callable consumed by the sequential-access prefetch worker.
#[async_trait]
pub trait BlockRetriever: Send + Sync {
    async fn retrieve(&self, cid: &Cid) -> Result<Vec<u8>>;
}

/// The peer-to-peer pub/sub transport used to broadcast gossip and
/// bloom-exchange messages.
#[async_trait]
pub trait PubSub: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, topic: &str) -> Result<BoxStream<'static, Vec<u8>>>;
}

/// Gossip topic for health-gossip messages (spec §6).
pub const TOPIC_HEALTH_GOSSIP: &str = "noisefs-health-gossip";
/// Gossip topic for bloom-exchange messages (spec §6).
pub const TOPIC_BLOOM_EXCHANGE: &str = "noisefs-bloom-exchange";
