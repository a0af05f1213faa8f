//! Core data model shared by every subsystem of the altruistic cache.
//!
//! This module defines the content identifier, block, and per-block
//! metadata types described in spec §3, plus the 256-bit hash space used
//! for bloom-filter hashing and consistent-hash peer/block affinity.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Opaque, collision-resistant content identifier of a block.
///
/// Treated as an uninterpreted byte sequence for all cache logic; the
/// cache never looks inside a CID beyond hashing it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Cid(pub String);

impl Cid {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// 256-bit content hash used by the bloom filter and consistent hashing.
    pub fn content_hash(&self) -> Hash256 {
        Hash256::of(self.0.as_bytes())
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Cid {
    fn from(s: &str) -> Self {
        Cid(s.to_string())
    }
}

impl From<String> for Cid {
    fn from(s: String) -> Self {
        Cid(s)
    }
}

/// A 256-bit content hash, used both for bloom-filter double hashing and
/// for consistent-hash distance between blocks and peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Hash256(pub [u8; 32]);

impl Hash256 {
    pub fn of(data: &[u8]) -> Self {
        Hash256(*blake3::hash(data).as_bytes())
    }

    /// Split the hash into two 32-bit words for double hashing (spec §4.1).
    pub fn as_words(&self) -> (u32, u32) {
        let h1 = u32::from_le_bytes(self.0[0..4].try_into().unwrap());
        let h2 = u32::from_le_bytes(self.0[4..8].try_into().unwrap());
        (h1, h2)
    }

    /// Normalized Euclidean distance in hash-byte space, in `[0, 1]`.
    ///
    /// Each byte pair contributes its squared difference; the sum is
    /// normalized by the maximum possible sum of squared byte differences
    /// (`32 * 255^2`) and square-rooted back into `[0, 1]`.
    pub fn normalized_distance(&self, other: &Hash256) -> f64 {
        let sum_sq: f64 = self
            .0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| {
                let diff = *a as f64 - *b as f64;
                diff * diff
            })
            .sum();
        let max_sum_sq = 32.0 * 255.0 * 255.0;
        (sum_sq / max_sum_sq).sqrt()
    }
}

impl fmt::Display for Hash256 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Origin of a cached block. May be upgraded `Altruistic -> Personal`
/// in place; never downgraded within a single residency (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockOrigin {
    Personal,
    Altruistic,
}

/// An immutable, opaque byte blob addressed by a `Cid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub cid: Cid,
    pub data: Vec<u8>,
}

impl Block {
    pub fn new(cid: Cid, data: Vec<u8>) -> Self {
        Self { cid, data }
    }

    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Coarse, privacy-preserving bin of a block's observed replica count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationBucket {
    Unknown,
    Low,
    Medium,
    High,
}

impl ReplicationBucket {
    /// Map a raw replica count to its bucket per spec §4.2
    /// (`<=3 Low, <=10 Medium, else High`).
    pub fn from_count(count: u32) -> Self {
        if count <= 3 {
            ReplicationBucket::Low
        } else if count <= 10 {
            ReplicationBucket::Medium
        } else {
            ReplicationBucket::High
        }
    }
}

/// Per-block bookkeeping owned by the `AltruisticCache`.
///
/// Invariant: for every `Cid` present here there must exist a matching
/// byte blob in the backing `BlockStore` — no orphans in either direction.
#[derive(Debug, Clone)]
pub struct BlockMetadata {
    pub cid: Cid,
    pub size: u64,
    pub origin: BlockOrigin,
    pub cached_at: u64,
    pub last_accessed: u64,
    pub popularity: u64,
    /// Cached eviction scores keyed by policy name, each with a staleness
    /// timestamp; valid for at most `ValueCacheTime` (spec §3).
    pub cached_scores: HashMap<String, (f64, u64)>,
}

impl BlockMetadata {
    pub fn new(cid: Cid, size: u64, origin: BlockOrigin) -> Self {
        let now = now_secs();
        Self {
            cid,
            size,
            origin,
            cached_at: now,
            last_accessed: now,
            popularity: 0,
            cached_scores: HashMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_accessed = now_secs();
        self.popularity += 1;
    }

    pub fn age_hours(&self, now: u64) -> f64 {
        (now.saturating_sub(self.cached_at) as f64 / 3600.0).max(0.0)
    }

    pub fn hours_since_access(&self, now: u64) -> f64 {
        (now.saturating_sub(self.last_accessed) as f64 / 3600.0).max(0.0)
    }
}

/// Current wall-clock time in seconds since the epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Opaque identifier of a remote peer in the coordination/gossip protocols.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn content_hash(&self) -> Hash256 {
        Hash256::of(self.0.as_bytes())
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
