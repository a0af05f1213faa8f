//! Composition root for the altruistic block cache engine.
//!
//! Wires configuration, the cache core, and the background coordination
//! protocols together, mirroring the teacher's `storage_node` binary's
//! role as the thing that assembles config + storage engine + background
//! protocols — scoped here to this crate's cache/gossip/exchange trio and
//! with no HTTP API surface.

use altruistic_cache::bloom::BloomFilter;
use altruistic_cache::bloom_exchange::BloomExchanger;
use altruistic_cache::cache::AltruisticCache;
use altruistic_cache::config::EngineConfig;
use altruistic_cache::coordination::CoordinationEngine;
use altruistic_cache::eviction::HealthLookup;
use altruistic_cache::external::{BlockFetcher, BlockStore, PubSub};
use altruistic_cache::gossip::HealthGossiper;
use altruistic_cache::health::BlockHealthTracker;
use altruistic_cache::opportunistic::OpportunisticFetcher;
use altruistic_cache::stats::SampledStats;
use altruistic_cache::types::PeerId;
use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "cache_node", about = "Altruistic block cache engine node")]
struct Cli {
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the cache engine and its background protocols until Ctrl-C.
    Run {
        #[arg(long, default_value_t = String::from("local-node"))]
        peer_id: String,
    },
    /// Print the resolved configuration and exit.
    Stats,
}

/// A `BlockStore`/`BlockFetcher`/`PubSub` stub suitable for local
/// demonstration; production deployments supply real implementations.
struct NullBackend;

#[async_trait]
impl BlockStore for NullBackend {
    async fn store(&self, _cid: &altruistic_cache::types::Cid, _bytes: Vec<u8>) -> altruistic_cache::Result<()> {
        Ok(())
    }
    async fn get(&self, _cid: &altruistic_cache::types::Cid) -> altruistic_cache::Result<Option<Vec<u8>>> {
        Ok(None)
    }
    async fn has(&self, _cid: &altruistic_cache::types::Cid) -> altruistic_cache::Result<bool> {
        Ok(false)
    }
    async fn remove(&self, _cid: &altruistic_cache::types::Cid) -> altruistic_cache::Result<()> {
        Ok(())
    }
    async fn size(&self) -> altruistic_cache::Result<u64> {
        Ok(0)
    }
    async fn clear(&self) -> altruistic_cache::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl BlockFetcher for NullBackend {
    async fn fetch(&self, cid: &altruistic_cache::types::Cid) -> altruistic_cache::Result<Vec<u8>> {
        Err(altruistic_cache::CacheError::NotFound(cid.to_string()))
    }
}

#[async_trait]
impl PubSub for NullBackend {
    async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> altruistic_cache::Result<()> {
        Ok(())
    }
    async fn subscribe(
        &self,
        _topic: &str,
    ) -> altruistic_cache::Result<futures::stream::BoxStream<'static, Vec<u8>>> {
        Ok(Box::pin(futures::stream::empty()))
    }
}

/// Owns every subsystem in the lock-ordering required by the
/// cache/health/coordination/exchange/gossip discipline: constructing
/// them in this order and tearing them down in reverse keeps any future
/// cross-subsystem locking consistent.
struct Engine {
    cache: Arc<AltruisticCache>,
    health: Arc<BlockHealthTracker>,
    coordination: Arc<CoordinationEngine>,
    bloom_exchange: Arc<BloomExchanger>,
    gossip: Arc<HealthGossiper>,
    opportunistic: Arc<OpportunisticFetcher>,
    stats: Arc<SampledStats>,
}

impl Engine {
    fn new(config: &EngineConfig, self_id: PeerId) -> Self {
        let backend = Arc::new(NullBackend);
        let health = BlockHealthTracker::new(config.health.clone());
        let cache_health: Arc<dyn HealthLookup + Send + Sync> = health.clone();
        let cache = Arc::new(AltruisticCache::new(backend.clone(), cache_health, &config.cache));
        let coordination = Arc::new(CoordinationEngine::new());
        let bloom_exchange = BloomExchanger::new(
            config.bloom_exchange.clone(),
            backend.clone(),
            coordination.clone(),
            self_id.clone(),
        );
        let gossip = HealthGossiper::new(config.gossip.clone(), backend.clone(), health.clone(), self_id);
        let opportunistic = OpportunisticFetcher::new(
            config.opportunistic.clone(),
            cache.clone(),
            coordination.clone(),
            backend,
        );
        let stats = Arc::new(SampledStats::new());

        Self {
            cache,
            health,
            coordination,
            bloom_exchange,
            gossip,
            opportunistic,
            stats,
        }
    }

    async fn run_until_shutdown(self) {
        let gossip = self.gossip.clone();
        let exchange = self.bloom_exchange.clone();
        let opportunistic = self.opportunistic.clone();

        let gossip_task = tokio::spawn({
            let gossip = gossip.clone();
            async move {
                gossip
                    .run(|| (0.0, 0, 0))
                    .await;
            }
        });
        let exchange_task = tokio::spawn({
            let exchange = exchange.clone();
            async move {
                exchange
                    .run(|| (BloomFilter::new(1000, 0.01), Vec::new(), BloomFilter::new(1000, 0.01)))
                    .await;
            }
        });
        let checker_task = tokio::spawn({
            let opportunistic = opportunistic.clone();
            async move {
                opportunistic.run_checker(|_coordination| Vec::new()).await;
            }
        });
        let workers_task = tokio::spawn({
            let opportunistic = opportunistic.clone();
            async move {
                opportunistic.run_workers().await;
            }
        });
        let cleanup_task = tokio::spawn({
            let opportunistic = opportunistic.clone();
            async move {
                opportunistic.run_cleanup().await;
            }
        });
        let health_cleanup_task = tokio::spawn({
            let health = self.health.clone();
            async move {
                health.run_cleanup_loop().await;
            }
        });

        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, stopping background protocols");

        self.opportunistic.shutdown();
        self.bloom_exchange.shutdown();
        self.gossip.shutdown();
        self.health.shutdown();

        for task in [gossip_task, exchange_task, checker_task, workers_task, cleanup_task, health_cleanup_task] {
            task.abort();
        }
        let _ = (self.cache, self.coordination, self.stats);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = EngineConfig::load(&cli.config).context("failed to load configuration")?;

    match cli.command {
        Commands::Run { peer_id } => {
            info!(%peer_id, "starting altruistic cache engine");
            let engine = Engine::new(&config, PeerId::new(peer_id));
            engine.run_until_shutdown().await;
        }
        Commands::Stats => {
            println!("{config:#?}");
        }
    }

    Ok(())
}
