//! Error handling for the altruistic block cache engine.
//!
//! This module defines the error taxonomy surfaced by the cache core and
//! the `Result` alias used throughout the crate.

use std::io;
use std::result;
use thiserror::Error;

/// Result type for cache operations.
pub type Result<T> = result::Result<T, CacheError>;

/// Error taxonomy surfaced by the cache core.
///
/// See spec §7 for the propagation policy: admission and backend errors
/// are returned to the caller of the triggering operation; background-task
/// errors are recorded and retried under backoff and never surface here.
#[derive(Debug, Error, Clone)]
pub enum CacheError {
    /// Get/Has-miss or Remove-miss.
    #[error("block not found: {0}")]
    NotFound(String),

    /// Store would exceed `TotalCapacity`.
    #[error("capacity exceeded: need {needed} bytes, {available} available")]
    CapacityExceeded { needed: u64, available: u64 },

    /// Personal store cannot make room by evicting altruistic blocks.
    #[error("insufficient altruistic space to evict: need {0} more bytes")]
    InsufficientAltruisticSpace(u64),

    /// Attempted re-eviction inside the cooldown window.
    #[error("eviction cooldown active, retry after {remaining_ms}ms")]
    EvictionCooldownActive { remaining_ms: u64 },

    /// Altruistic store attempted with the feature disabled.
    #[error("altruistic caching is disabled")]
    AltruisticDisabled,

    /// The underlying `BlockStore`/`BlockFetcher`/`PubSub` reported a failure.
    #[error("backend error: {0}")]
    BackendError(String),

    /// Gossip message carried an unsupported protocol version.
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Gossip message fell outside the accepted freshness window.
    #[error("message stale: age {age_secs}s exceeds limit {limit_secs}s")]
    MessageStale { age_secs: u64, limit_secs: u64 },

    /// Rejected at construction time; never at runtime.
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// The differential-privacy-safe random source failed. Not recoverable.
    #[error("fatal RNG failure: {0}")]
    FatalRng(String),

    /// Catch-all for wrapped/downstream errors.
    #[error("internal error: {0}")]
    Internal(String),
}

impl CacheError {
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::BackendError(message.into())
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Internal(format!("io error: {err}"))
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Internal(format!("json error: {err}"))
    }
}

impl From<toml::de::Error> for CacheError {
    fn from(err: toml::de::Error) -> Self {
        CacheError::ConfigInvalid(err.to_string())
    }
}

impl From<config::ConfigError> for CacheError {
    fn from(err: config::ConfigError) -> Self {
        CacheError::ConfigInvalid(err.to_string())
    }
}

impl From<Box<bincode::ErrorKind>> for CacheError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        CacheError::Internal(format!("serialization error: {err}"))
    }
}
