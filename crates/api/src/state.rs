//! Application state shared across handlers.

use ingest_core::Error;
use moka::future::Cache;
use pipeline::IngestionCoordinator;
use std::sync::Arc;
use std::time::Duration;
use store::{EventStore, StoreStatistics};
use tracing::debug;

/// Cache TTL for storage statistics (5 minutes).
const STATS_CACHE_TTL: Duration = Duration::from_secs(300);

const STATS_KEY: &str = "statistics";

/// Storage statistics, cached so `/stats` does not scan tables per request.
#[derive(Clone)]
pub struct StatsCache {
    store: Arc<dyn EventStore>,
    cache: Cache<&'static str, StoreStatistics>,
}

impl StatsCache {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self::with_ttl(store, STATS_CACHE_TTL)
    }

    pub fn with_ttl(store: Arc<dyn EventStore>, ttl: Duration) -> Self {
        Self {
            store,
            cache: Cache::builder().max_capacity(1).time_to_live(ttl).build(),
        }
    }

    /// Cached statistics, read from storage on a miss.
    pub async fn get(&self) -> Result<StoreStatistics, Error> {
        if let Some(cached) = self.cache.get(STATS_KEY).await {
            debug!("Stats cache hit");
            return Ok(cached);
        }

        let stats = self.store.statistics().await?;
        self.cache.insert(STATS_KEY, stats.clone()).await;
        Ok(stats)
    }

    pub async fn invalidate(&self) {
        self.cache.invalidate(STATS_KEY).await;
    }
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Running pipeline
    pub coordinator: Arc<IngestionCoordinator>,
    /// Storage backend, for pings and statistics
    pub store: Arc<dyn EventStore>,
    pub stats: StatsCache,
}

impl AppState {
    pub fn new(coordinator: Arc<IngestionCoordinator>, store: Arc<dyn EventStore>) -> Self {
        Self {
            coordinator,
            stats: StatsCache::new(store.clone()),
            store,
        }
    }
}
