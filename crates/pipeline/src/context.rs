//! Handles shared by every pipeline component.

use std::sync::Arc;

use store::EventStore;
use telemetry::{HealthRegistry, PipelineMetrics};
use tokio_util::sync::CancellationToken;

use crate::checkpoint::CheckpointStore;

/// Storage, cursors, counters, health and the shutdown token.
#[derive(Clone)]
pub struct PipelineContext {
    pub store: Arc<dyn EventStore>,
    pub checkpoints: Arc<CheckpointStore>,
    pub metrics: Arc<PipelineMetrics>,
    pub health: Arc<HealthRegistry>,
    pub cancel: CancellationToken,
}

impl PipelineContext {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self {
            checkpoints: Arc::new(CheckpointStore::new(store.clone())),
            store,
            metrics: Arc::new(PipelineMetrics::new()),
            health: Arc::new(HealthRegistry::new()),
            cancel: CancellationToken::new(),
        }
    }
}
