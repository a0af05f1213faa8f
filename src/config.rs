//! Configuration surface for the altruistic cache engine (spec §6, §A.3).
//!
//! Mirrors the teacher's `config::Config::builder().add_source(File::from(path))`
//! loading pattern, layering a TOML file under environment overrides
//! prefixed `ALTRUISTIC_CACHE_`.

use crate::eviction::EvictionStrategyKind;
use crate::error::{CacheError, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Two-tier capacity controller configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub total_capacity: u64,
    pub min_personal: u64,
    pub enable_altruistic: bool,
    pub eviction_strategy: EvictionStrategyKind,
    pub enable_gradual_eviction: bool,
    pub eviction_cooldown_ms: u64,
    pub enable_predictive: bool,
    pub pre_evict_threshold: f64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            total_capacity: 1024 * 1024 * 1024,
            min_personal: 0,
            enable_altruistic: true,
            eviction_strategy: EvictionStrategyKind::Adaptive,
            enable_gradual_eviction: true,
            eviction_cooldown_ms: 500,
            enable_predictive: false,
            pre_evict_threshold: 0.9,
        }
    }
}

/// Health-tracker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSettings {
    pub privacy_epsilon: f64,
    pub temporal_quantum_secs: u64,
    pub value_cache_time_secs: u64,
    pub cleanup_interval_secs: u64,
    pub retention_window_secs: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            privacy_epsilon: 1.0,
            temporal_quantum_secs: 3600,
            value_cache_time_secs: 300,
            cleanup_interval_secs: 3600,
            retention_window_secs: 24 * 3600,
        }
    }
}

/// Health-gossip protocol configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GossipSettings {
    pub gossip_interval_secs: u64,
    pub max_gossip_peers: usize,
    pub bloom_filter_size: usize,
    pub bloom_false_positive: f64,
    pub enable_differential_privacy: bool,
    pub aggregation_window_secs: u64,
    pub min_blocks_for_gossip: usize,
    pub message_staleness_secs: u64,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            gossip_interval_secs: 300,
            max_gossip_peers: 64,
            bloom_filter_size: 10_000,
            bloom_false_positive: 0.01,
            enable_differential_privacy: true,
            aggregation_window_secs: 15 * 60,
            min_blocks_for_gossip: 10,
            message_staleness_secs: 10 * 60,
        }
    }
}

/// Bloom filter exchange configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BloomExchangeSettings {
    pub exchange_interval_secs: u64,
    pub max_peer_filters: usize,
    pub filter_expiry_secs: u64,
    pub min_peers_for_coordination: usize,
    pub coordination_threshold: f64,
    pub personal_sample_rate: f64,
}

impl Default for BloomExchangeSettings {
    fn default() -> Self {
        Self {
            exchange_interval_secs: 600,
            max_peer_filters: 256,
            filter_expiry_secs: 30 * 60,
            min_peers_for_coordination: 3,
            coordination_threshold: 0.7,
            personal_sample_rate: 0.10,
        }
    }
}

/// Opportunistic fetcher configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OpportunisticSettings {
    pub min_flex_pool_free: f64,
    pub check_interval_secs: u64,
    pub max_block_size: u64,
    pub value_threshold: f64,
    pub batch_size: usize,
    pub max_concurrent: usize,
    pub fetch_cooldown_secs: u64,
    pub error_backoff_secs: u64,
    pub max_error_retries: u32,
}

impl Default for OpportunisticSettings {
    fn default() -> Self {
        Self {
            min_flex_pool_free: 0.30,
            check_interval_secs: 30,
            max_block_size: 64 * 1024 * 1024,
            value_threshold: 2.0,
            batch_size: 20,
            max_concurrent: 3,
            fetch_cooldown_secs: 5 * 60,
            error_backoff_secs: 15 * 60,
            max_error_retries: 3,
        }
    }
}

/// Top-level configuration composing every subsystem's settings.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub cache: CacheSettings,
    pub health: HealthSettings,
    pub gossip: GossipSettings,
    pub bloom_exchange: BloomExchangeSettings,
    pub opportunistic: OpportunisticSettings,
}

impl EngineConfig {
    /// Load configuration from a TOML file, overridden by
    /// `ALTRUISTIC_CACHE_*` environment variables.
    pub fn load(path: &Path) -> Result<Self> {
        let builder = Config::builder()
            .add_source(File::from(path))
            .add_source(Environment::with_prefix("ALTRUISTIC_CACHE").separator("__"));
        let config: Self = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Construction-time validation; rejected configurations never reach
    /// runtime (spec §7 `ConfigInvalid`).
    pub fn validate(&self) -> Result<()> {
        if self.cache.min_personal > self.cache.total_capacity {
            return Err(CacheError::ConfigInvalid(
                "min_personal cannot exceed total_capacity".into(),
            ));
        }
        if !(0.0..1.0).contains(&self.gossip.bloom_false_positive) {
            return Err(CacheError::ConfigInvalid(
                "bloom_false_positive must be in (0, 1)".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.opportunistic.min_flex_pool_free) {
            return Err(CacheError::ConfigInvalid(
                "min_flex_pool_free must be in [0, 1]".into(),
            ));
        }
        Ok(())
    }

    pub fn eviction_cooldown(&self) -> Duration {
        Duration::from_millis(self.cache.eviction_cooldown_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn min_personal_over_capacity_is_rejected() {
        let mut cfg = EngineConfig::default();
        cfg.cache.min_personal = cfg.cache.total_capacity + 1;
        assert!(cfg.validate().is_err());
    }
}
