//! Process lifecycle: live polling, scheduled backfill, flushing, shutdown.

use chrono::{DateTime, Utc};
use ingest_core::{Checkpoint, Error, PartitionId, Result};
use parking_lot::Mutex;
use serde::Serialize;
use source::{EventSource, SourceItem};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use store::EventStore;
use telemetry::{HealthRegistry, HealthReport, MetricsSnapshot, PipelineMetrics};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backfill::{BackfillEngine, BackfillOutcome, BackfillProgress, ProgressRegistry};
use crate::buffer::{BatchBuffer, FlushFailure};
use crate::checkpoint::CheckpointStore;
use crate::config::PipelineConfig;
use crate::context::PipelineContext;
use crate::filter::EventFilter;
use crate::rate_limit::{RateLimiter, SOURCE_KEY};
use crate::retention::RetentionWorker;
use crate::retry::RetryPolicy;

/// Delay before polling again after an empty live batch.
const EMPTY_POLL_DELAY: Duration = Duration::from_secs(1);

/// Read-only view for the reporting surface.
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    pub health: HealthReport,
    pub metrics: MetricsSnapshot,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub pending_events: usize,
    /// Events are pending and nothing was committed for `stale_flush_secs`.
    pub flush_stale: bool,
    pub live_offset: Option<i64>,
    pub checkpoints: Vec<Checkpoint>,
    pub backfill: Vec<BackfillProgress>,
}

pub struct IngestionCoordinator {
    config: PipelineConfig,
    source: Arc<dyn EventSource>,
    ctx: PipelineContext,
    filter: Arc<EventFilter>,
    buffer: Arc<BatchBuffer>,
    backfill: Arc<BackfillEngine>,
    source_limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    failures: Mutex<Option<mpsc::UnboundedReceiver<FlushFailure>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    offset: Mutex<Option<i64>>,
    started_at: DateTime<Utc>,
}

impl IngestionCoordinator {
    pub fn new(
        config: PipelineConfig,
        source: Arc<dyn EventSource>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let ctx = PipelineContext::new(store);
        let retry = RetryPolicy::new(&config.retry);
        let filter = Arc::new(EventFilter::new(&config.filter));
        let source_limiter = Arc::new(RateLimiter::new(config.source_rate_limit.clone()));
        let storage_limiter = Arc::new(RateLimiter::new(config.storage_rate_limit.clone()));

        let (failure_tx, failure_rx) = mpsc::unbounded_channel();
        let buffer = Arc::new(BatchBuffer::new(
            config.batch.clone(),
            ctx.clone(),
            retry.clone(),
            storage_limiter,
            failure_tx,
        ));
        let backfill = Arc::new(BackfillEngine::new(
            config.effective_backfill(),
            source.clone(),
            ctx.clone(),
            buffer.clone(),
            filter.clone(),
            source_limiter.clone(),
            retry.clone(),
            Arc::new(ProgressRegistry::new()),
        ));

        Self {
            config,
            source,
            ctx,
            filter,
            buffer,
            backfill,
            source_limiter,
            retry,
            failures: Mutex::new(Some(failure_rx)),
            tasks: Mutex::new(Vec::new()),
            offset: Mutex::new(None),
            started_at: Utc::now(),
        }
    }

    /// Load checkpoints and spawn every background task.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let failures = self
            .failures
            .lock()
            .take()
            .ok_or_else(|| Error::internal("ingestion already started"))?;

        self.ctx.checkpoints.load().await?;
        self.ctx.health.storage.set_healthy();

        let mut handles = vec![self.buffer.start_flush_task()];

        let coordinator = self.clone();
        handles.push(tokio::spawn(async move {
            coordinator.run_failure_consumer(failures).await;
        }));

        let coordinator = self.clone();
        handles.push(tokio::spawn(async move {
            coordinator.run_live_loop().await;
        }));

        let backfill = &self.config.backfill;
        if backfill.enabled && backfill.on_startup {
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move {
                if let Err(e) = coordinator.run_backfill().await {
                    error!(error = %e, "Startup backfill failed");
                }
            }));
        }

        if let (true, Some(secs)) = (backfill.enabled, backfill.interval_secs) {
            let coordinator = self.clone();
            handles.push(tokio::spawn(async move {
                coordinator.run_backfill_schedule(Duration::from_secs(secs)).await;
            }));
        }

        if self.config.retention.keep_days.is_some() {
            let worker = RetentionWorker::new(
                self.config.retention.clone(),
                self.ctx.clone(),
                self.retry.clone(),
            );
            handles.push(worker.start());
        }

        info!(
            source = self.source.name(),
            tasks = handles.len(),
            backfill_on_startup = backfill.enabled && backfill.on_startup,
            retention_days = self.config.retention.keep_days,
            "Ingestion started"
        );
        self.tasks.lock().extend(handles);
        Ok(())
    }

    /// Route one source item through the filter into the buffer.
    ///
    /// Returns whether the event was accepted.
    pub fn ingest(&self, item: SourceItem) -> bool {
        let event = match item {
            SourceItem::Event(event) => event,
            SourceItem::Malformed { reason, raw } => {
                warn!(reason = %reason, raw = %raw, "Skipping malformed live payload");
                self.ctx.metrics.events_skipped.inc();
                return false;
            }
        };

        self.ctx.metrics.events_received.inc();
        let decision = self.filter.evaluate(&event);
        if !decision.is_accepted() {
            debug!(
                partition = event.partition,
                id = %event.id,
                reason = decision.reason(),
                "Event filtered"
            );
            self.ctx.metrics.events_rejected.inc();
            return false;
        }

        self.ctx.metrics.events_accepted.inc();
        self.buffer.add(event);
        true
    }

    async fn run_live_loop(&self) {
        let cancel = &self.ctx.cancel;
        let limiter = &self.source_limiter;
        let source = &self.source;
        let metrics = &self.ctx.metrics;
        let pause = Duration::from_secs(self.config.live_pause_secs);

        info!(source = source.name(), "Live polling started");
        while !cancel.is_cancelled() {
            let offset = *self.offset.lock();
            let result = self
                .retry
                .run("poll_live", cancel, |_| async move {
                    limiter.wait(SOURCE_KEY, cancel).await?;
                    metrics.live_polls.inc();
                    let started = Instant::now();
                    // Dropping an in-flight poll leaves the offset where it was.
                    let batch = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        batch = source.poll_live(offset) => batch,
                    };
                    metrics
                        .fetch_latency_ms
                        .observe(started.elapsed().as_millis() as u64);
                    batch
                })
                .await;

            let wait = match result {
                Ok(batch) => {
                    self.ctx.health.source.set_healthy();
                    if let Some(next) = batch.next_offset {
                        *self.offset.lock() = Some(next);
                    }
                    let received = batch.items.len();
                    let mut accepted = 0;
                    for item in batch.items {
                        if self.ingest(item) {
                            accepted += 1;
                        }
                    }
                    if received > 0 {
                        debug!(received, accepted, "Live batch ingested");
                    }
                    (received == 0).then_some(EMPTY_POLL_DELAY)
                }
                Err(e) if e.is_cancelled() => break,
                Err(e) => {
                    metrics.source_errors.inc();
                    self.ctx.health.source.set_unhealthy(e.to_string());
                    error!(
                        error = %e,
                        pause_secs = pause.as_secs(),
                        "Live polling failed, pausing"
                    );
                    Some(pause)
                }
            };

            if let Some(wait) = wait {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
            }
        }
        info!("Live polling stopped");
    }

    async fn run_failure_consumer(&self, mut failures: mpsc::UnboundedReceiver<FlushFailure>) {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                failure = failures.recv() => match failure {
                    Some(failure) => {
                        warn!(
                            error = %failure.error,
                            code = ?failure.code,
                            events = failure.events,
                            "Flush failure reported"
                        );
                        self.ctx.health.storage.set_degraded(failure.error);
                    }
                    None => break,
                },
            }
        }
    }

    async fn run_backfill_schedule(&self, every: Duration) {
        let cancel = &self.ctx.cancel;
        let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            info!("Scheduled backfill starting");
            if let Err(e) = self.run_backfill().await {
                error!(error = %e, "Scheduled backfill failed");
            }
        }
    }

    /// Configured, allowed, stored and unfinished partitions the filter admits.
    pub async fn backfill_partitions(&self) -> Result<Vec<PartitionId>> {
        let mut partitions: BTreeSet<PartitionId> =
            self.config.backfill.partitions.iter().copied().collect();
        partitions.extend(self.config.filter.allowed_chats.iter().copied());
        partitions.extend(self.ctx.store.known_partitions().await?);
        partitions.extend(self.ctx.checkpoints.in_progress());
        partitions.retain(|p| self.filter.accepts_partition(*p));
        Ok(partitions.into_iter().collect())
    }

    pub async fn run_backfill(&self) -> Result<Vec<(PartitionId, BackfillOutcome)>> {
        let partitions = self.backfill_partitions().await?;
        if partitions.is_empty() {
            info!("No partitions to backfill");
            return Ok(Vec::new());
        }
        Ok(self.backfill.run_all(partitions).await)
    }

    /// Stop every task and make one last attempt to commit what is pending.
    ///
    /// Returns the number of events committed by that attempt.
    pub async fn shutdown(&self) -> Result<usize> {
        info!(pending = self.buffer.pending_len(), "Shutting down ingestion");
        self.ctx.cancel.cancel();

        let handles = std::mem::take(&mut *self.tasks.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }

        match self.buffer.flush_once().await {
            Ok(committed) => {
                info!(committed, "Shutdown complete");
                Ok(committed)
            }
            Err(e) => {
                error!(
                    pending = self.buffer.pending_len(),
                    error = %e,
                    "Shutdown flush failed, pending events not committed"
                );
                Err(e)
            }
        }
    }

    pub fn report(&self) -> PipelineReport {
        let now = Utc::now();
        let metrics = self.ctx.metrics.snapshot();
        let pending_events = self.buffer.pending_len();
        let last_flush_at = metrics.last_flush_at;
        let since = last_flush_at.unwrap_or(self.started_at);
        let flush_stale = pending_events > 0
            && (now - since).num_seconds() > self.config.stale_flush_secs as i64;

        PipelineReport {
            started_at: self.started_at,
            uptime_secs: (now - self.started_at).num_seconds(),
            health: self.ctx.health.report(),
            metrics,
            last_flush_at,
            pending_events,
            flush_stale,
            live_offset: *self.offset.lock(),
            checkpoints: self.ctx.checkpoints.snapshot(),
            backfill: self.backfill.registry().snapshot(),
        }
    }

    pub fn metrics(&self) -> &Arc<PipelineMetrics> {
        &self.ctx.metrics
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.ctx.health
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointStore> {
        &self.ctx.checkpoints
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        self.backfill.registry()
    }

    pub fn buffer(&self) -> &Arc<BatchBuffer> {
        &self.buffer
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }
}
