//! In-memory batch buffer with size and interval flush triggers.
//!
//! `add` only appends and signals; committing happens on the flush task or
//! an explicit `flush_now`/`flush_once`. A batch leaves memory only once it
//! is durably committed together with its checkpoint advances. On an
//! exhausted retry it is put back in front of newer events.

use chrono::{DateTime, Utc};
use ingest_core::{
    CheckpointAdvance, CheckpointKey, CheckpointPurpose, Error, Event, Result,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use store::{CommitBatch, CommitOutcome};
use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::BatchConfig;
use crate::context::PipelineContext;
use crate::rate_limit::{RateLimiter, STORAGE_KEY};
use crate::retry::RetryPolicy;

/// A flush that gave up, sent to the coordinator.
#[derive(Debug, Clone)]
pub struct FlushFailure {
    pub error: String,
    pub code: Option<&'static str>,
    /// Events kept in the buffer for the next flush.
    pub events: usize,
    pub at: DateTime<Utc>,
}

/// Collapse duplicate keys (first occurrence wins) and derive one checkpoint
/// advance per (partition, purpose).
///
/// Live events move the live cursor to the batch maximum; backfilled events
/// move the backfill cursor to the batch minimum.
pub fn build_batch(events: Vec<Event>) -> CommitBatch {
    let mut seen = HashSet::new();
    let events: Vec<Event> = events.into_iter().filter(|e| seen.insert(e.key())).collect();

    let mut grouped: BTreeMap<CheckpointKey, Vec<&Event>> = BTreeMap::new();
    for event in &events {
        let purpose = if event.is_backfilled {
            CheckpointPurpose::Backfill
        } else {
            CheckpointPurpose::Live
        };
        grouped
            .entry(CheckpointKey::new(event.partition, purpose))
            .or_default()
            .push(event);
    }

    let advances: Vec<CheckpointAdvance> = grouped
        .into_iter()
        .filter_map(|(key, group)| {
            let position = key.purpose.furthest_of(group.iter().map(|e| e.position))?;
            Some(CheckpointAdvance {
                key,
                position,
                timestamp: group.iter().map(|e| e.occurred_at).max(),
                delta_count: group.len() as u64,
            })
        })
        .collect();

    CommitBatch::from_events(events).with_advances(advances)
}

pub struct BatchBuffer {
    config: BatchConfig,
    ctx: PipelineContext,
    retry: RetryPolicy,
    limiter: Arc<RateLimiter>,
    pending: Mutex<Vec<Event>>,
    notify: Notify,
    flush_lock: AsyncMutex<()>,
    last_flush: Mutex<Instant>,
    failures: mpsc::UnboundedSender<FlushFailure>,
}

impl BatchBuffer {
    pub fn new(
        config: BatchConfig,
        ctx: PipelineContext,
        retry: RetryPolicy,
        limiter: Arc<RateLimiter>,
        failures: mpsc::UnboundedSender<FlushFailure>,
    ) -> Self {
        Self {
            config,
            ctx,
            retry,
            limiter,
            pending: Mutex::new(Vec::new()),
            notify: Notify::new(),
            flush_lock: AsyncMutex::new(()),
            last_flush: Mutex::new(Instant::now()),
            failures,
        }
    }

    /// Append an event. Returns true when the size threshold was reached
    /// and the flush task was signalled.
    pub fn add(&self, event: Event) -> bool {
        let len = {
            let mut pending = self.pending.lock();
            pending.push(event);
            pending.len()
        };
        self.ctx.metrics.buffer_depth.set(len as u64);

        if len >= self.config.max_size {
            self.notify.notify_one();
            return true;
        }
        false
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn take_pending(&self) -> Vec<Event> {
        let events = std::mem::take(&mut *self.pending.lock());
        self.ctx.metrics.buffer_depth.set(0);
        events
    }

    /// Put uncommitted events back ahead of anything added since.
    fn restore(&self, mut events: Vec<Event>) {
        let len = {
            let mut pending = self.pending.lock();
            events.append(&mut pending);
            *pending = events;
            pending.len()
        };
        self.ctx.metrics.buffer_depth.set(len as u64);
    }

    /// Spawn the task that flushes on size signal or interval.
    pub fn start_flush_task(self: &Arc<Self>) -> JoinHandle<()> {
        let buffer = self.clone();
        tokio::spawn(async move { buffer.run_flush_loop().await })
    }

    async fn run_flush_loop(&self) {
        let cancel = self.ctx.cancel.clone();
        info!(
            max_size = self.config.max_size,
            interval_secs = self.config.flush_interval_secs,
            "Flush task started"
        );

        loop {
            let deadline = *self.last_flush.lock() + self.config.flush_interval();
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline) => {}
            }

            if self.pending_len() == 0 {
                *self.last_flush.lock() = Instant::now();
                continue;
            }

            if let Err(e) = self.flush_now().await {
                if e.is_cancelled() {
                    break;
                }
            }
        }

        debug!("Flush task stopped");
    }

    /// Flush everything pending, retrying transient failures.
    ///
    /// Returns the number of events committed.
    pub async fn flush_now(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;
        *self.last_flush.lock() = Instant::now();

        let events = self.take_pending();
        if events.is_empty() {
            return Ok(0);
        }

        let batch = build_batch(events);
        match self.commit_with_retry("flush", &batch).await {
            Ok(outcome) => {
                self.record_commit(&batch, outcome);
                Ok(batch.events.len())
            }
            Err(e) if e.is_row_rejection() => self.isolate(batch.events, &e).await,
            Err(e) => {
                let count = batch.events.len();
                self.restore(batch.events);
                self.report_failure(&e, count);
                Err(e)
            }
        }
    }

    /// One commit attempt without rate limiting or retry, for shutdown.
    pub async fn flush_once(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let events = self.take_pending();
        if events.is_empty() {
            return Ok(0);
        }

        let batch = build_batch(events);
        let started = Instant::now();
        match self.ctx.checkpoints.commit(&batch).await {
            Ok(outcome) => {
                self.observe_latency(started);
                self.record_commit(&batch, outcome);
                Ok(batch.events.len())
            }
            Err(e) => {
                error!(
                    events = batch.events.len(),
                    error = %e,
                    "Final flush failed, events left uncommitted"
                );
                self.restore(batch.events);
                Err(e)
            }
        }
    }

    async fn commit_with_retry(&self, operation: &str, batch: &CommitBatch) -> Result<CommitOutcome> {
        let cancel = &self.ctx.cancel;
        let limiter = &self.limiter;
        let checkpoints = &self.ctx.checkpoints;
        let metrics = &self.ctx.metrics;

        self.retry
            .run(operation, cancel, |_| async move {
                limiter.wait(STORAGE_KEY, cancel).await?;
                let started = Instant::now();
                let outcome = checkpoints.commit(batch).await;
                metrics
                    .flush_latency_ms
                    .observe(started.elapsed().as_millis() as u64);
                outcome
            })
            .await
    }

    /// Commit events one at a time after the batch was rejected, skipping
    /// the ones storage still refuses.
    ///
    /// Any failure that is not a row rejection stops isolation and keeps the
    /// event that hit it along with everything after it.
    async fn isolate(&self, events: Vec<Event>, cause: &Error) -> Result<usize> {
        warn!(
            events = events.len(),
            error = %cause,
            "Batch rejected, committing events individually"
        );

        let mut committed = 0;
        let mut remaining = events.into_iter();
        while let Some(event) = remaining.next() {
            let single = build_batch(vec![event]);
            match self.commit_with_retry("flush_single", &single).await {
                Ok(outcome) => {
                    self.record_commit(&single, outcome);
                    committed += 1;
                }
                Err(e) if e.is_row_rejection() => {
                    if let Some(event) = single.events.first() {
                        error!(
                            partition = event.partition,
                            id = %event.id,
                            position = event.position,
                            error = %e,
                            "Skipping event rejected by storage"
                        );
                    }
                    self.ctx.metrics.events_skipped.inc();
                }
                Err(e) => {
                    let mut rest = single.events;
                    rest.extend(remaining);
                    let count = rest.len();
                    self.restore(rest);
                    self.report_failure(&e, count);
                    return Err(e);
                }
            }
        }

        Ok(committed)
    }

    fn observe_latency(&self, started: Instant) {
        self.ctx
            .metrics
            .flush_latency_ms
            .observe(started.elapsed().as_millis() as u64);
    }

    fn record_commit(&self, batch: &CommitBatch, outcome: CommitOutcome) {
        let metrics = &self.ctx.metrics;
        metrics.events_flushed.inc_by(batch.events.len() as u64);
        metrics.duplicates_ignored.inc_by(outcome.duplicates);
        metrics.batches_flushed.inc();
        metrics.last_flush_at.mark_now();
        self.ctx.health.storage.set_healthy();

        info!(
            events = batch.events.len(),
            inserted = outcome.inserted,
            duplicates = outcome.duplicates,
            checkpoints = batch.advances.len(),
            "Batch committed"
        );
    }

    fn report_failure(&self, err: &Error, events: usize) {
        if err.is_cancelled() {
            return;
        }

        let metrics = &self.ctx.metrics;
        metrics.flush_failures.inc();
        metrics.events_failed.inc_by(events as u64);
        error!(events, error = %err, "Flush failed, batch kept for next flush");

        let failure = FlushFailure {
            error: err.to_string(),
            code: err.error_code(),
            events,
            at: Utc::now(),
        };
        if self.failures.send(failure).is_err() {
            debug!("Failure channel closed");
        }
    }
}
