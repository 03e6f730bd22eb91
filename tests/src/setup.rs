//! Common test setup functions.

use api::{router, state::AppState};
use axum::Router;
use pipeline::{IngestionCoordinator, PipelineConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use store::{EventStore, MemoryStore};

use crate::fixtures;
use crate::mocks::MockSource;

/// Test context with a mock source and in-memory storage.
///
/// This runs the same production code paths by:
/// - Using the real coordinator with its flush, live and backfill tasks
/// - Using MockSource which implements the EventSource trait
/// - Using the real Axum router over the same coordinator
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub source: MockSource,
    pub coordinator: Arc<IngestionCoordinator>,
    pub router: Router,
}

impl TestContext {
    /// Create a context with the test pipeline settings. Nothing runs until
    /// [`TestContext::start`].
    pub fn new() -> Self {
        Self::with_config(fixtures::pipeline_config())
    }

    pub fn with_config(config: PipelineConfig) -> Self {
        Self::with_parts(config, Arc::new(MemoryStore::new()), MockSource::new())
    }

    /// Build over an existing store, as a restarted process would.
    pub fn with_parts(config: PipelineConfig, store: Arc<MemoryStore>, source: MockSource) -> Self {
        let coordinator = pipeline_over(config, source.clone(), store.clone());
        let router = router(AppState::new(coordinator.clone(), store.clone()));

        Self {
            store,
            source,
            coordinator,
            router,
        }
    }

    pub async fn start(&self) {
        self.coordinator
            .start()
            .await
            .expect("Failed to start coordinator");
    }

    /// Wait until the store holds at least `count` events.
    pub async fn wait_for_events(&self, count: usize) {
        let store = self.store.clone();
        wait_until(Duration::from_secs(10), move || {
            let store = store.clone();
            async move { store.event_count() >= count }
        })
        .await;
    }

    pub async fn shutdown(&self) -> usize {
        self.coordinator
            .shutdown()
            .await
            .expect("Shutdown flush failed")
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

/// A coordinator wired to any store.
pub fn pipeline_over(
    config: PipelineConfig,
    source: MockSource,
    store: Arc<dyn EventStore>,
) -> Arc<IngestionCoordinator> {
    Arc::new(IngestionCoordinator::new(config, Arc::new(source), store))
}

/// Poll `condition` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not met within {:?}", timeout);
}
