// Altruistic block cache engine
//
// This crate implements a two-tier, fixed-capacity block cache for a
// content-addressed peer-to-peer storage system. A "personal" tier holds
// blocks the local user has explicitly fetched or produced; an
// "altruistic" tier opportunistically caches blocks useful to the wider
// swarm, using spare capacity the personal tier isn't using.
//
// # Architecture
//
// * **Cache**: the two-tier capacity controller and admission algorithm.
// * **Eviction**: the pluggable LRU/LFU/value-based/adaptive policy family
//   the cache consults when it needs to make room.
// * **Health**: per-block swarm-value tracking, used by the value-based
//   eviction policy and the opportunistic fetcher's admission threshold.
// * **Bloom**: the fixed-size probabilistic filters exchanged between
//   peers to advertise cached content without revealing it exactly.
// * **Coordination**: consistent-hash peer/block affinity and filter
//   overlap scoring, used to decide who should cache what.
// * **Gossip / bloom exchange**: the two periodic broadcast protocols that
//   keep peers informed of each other's aggregate health and content.
// * **Prefetch**: sequential-access detection and read-ahead.
// * **Opportunistic**: the background worker that fills spare altruistic
//   capacity with high-value blocks.
//
// # Usage
//
// This crate does not implement the underlying byte store, network
// transport, or pub/sub layer — see `external` for the trait boundaries a
// host application must provide.

/// Fixed-size probabilistic bloom filters used for content advertisement.
pub mod bloom;

/// Bloom-filter exchange protocol between peers.
pub mod bloom_exchange;

/// The two-tier capacity controller.
pub mod cache;

/// Configuration surface for every subsystem.
pub mod config;

/// Consistent-hash peer/block affinity and coordination scoring.
pub mod coordination;

/// Error taxonomy and `Result` alias.
pub mod error;

/// Eviction policy family (LRU, LFU, value-based, adaptive, gradual).
pub mod eviction;

/// External collaborator traits (`BlockStore`, `BlockFetcher`, `PubSub`).
pub mod external;

/// Periodic health-gossip protocol.
pub mod gossip;

/// Per-block swarm-value tracking.
pub mod health;

/// Encrypted on-disk persistence of cache metadata.
pub mod persistence;

/// Sequential-access detection and prefetch.
pub mod prefetch;

/// Background opportunistic altruistic-space filler.
pub mod opportunistic;

/// Sampled runtime statistics.
pub mod stats;

/// Core data model (`Cid`, `Block`, `BlockMetadata`, hashing).
pub mod types;

pub use error::{CacheError, Result};
