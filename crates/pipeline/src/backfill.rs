//! History backfill.
//!
//! Each partition is walked from its cursor toward older data in chunks of
//! `chunk_size`. The durable backfill checkpoint is the only recovery source:
//! it records the oldest committed position and whether a walk is in
//! progress. A walk that stops early leaves the flag set and resumes from the
//! checkpoint on the next run.
//!
//! ```text
//! IDLE -> FETCHING_CHUNK -> FILTERING -> BUFFERING -> (next chunk) -> COMPLETED
//!              |  ^
//!              v  |  transient failure
//!          BACKOFF_WAIT
//! ```

use chrono::{DateTime, Utc};
use ingest_core::{CheckpointKey, Error, Event, PartitionId, Result};
use parking_lot::RwLock;
use serde::Serialize;
use source::{EventSource, HistoryPage, SourceItem};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::buffer::BatchBuffer;
use crate::config::BackfillConfig;
use crate::context::PipelineContext;
use crate::filter::EventFilter;
use crate::rate_limit::{RateLimiter, SOURCE_KEY};
use crate::retry::RetryPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackfillPhase {
    Idle,
    FetchingChunk,
    BackoffWait,
    Filtering,
    Buffering,
    Completed,
    Paused,
    Aborted,
    Cancelled,
}

impl BackfillPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Paused | Self::Aborted | Self::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    SourceExhausted,
    MaxAgeReached,
}

/// How a partition walk ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackfillOutcome {
    Completed(CompletionReason),
    /// Retries exhausted; the flag stays set and the next run resumes.
    Paused,
    /// Permanent failure; the flag stays set.
    Aborted,
    /// Shutdown; the flag stays set.
    Cancelled,
    /// Already completed or already running.
    Skipped,
}

impl BackfillOutcome {
    fn phase(&self) -> BackfillPhase {
        match self {
            Self::Completed(_) | Self::Skipped => BackfillPhase::Completed,
            Self::Paused => BackfillPhase::Paused,
            Self::Aborted => BackfillPhase::Aborted,
            Self::Cancelled => BackfillPhase::Cancelled,
        }
    }
}

/// Live view of one partition's walk.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillProgress {
    pub partition: PartitionId,
    pub phase: BackfillPhase,
    pub cursor: Option<i64>,
    pub chunks_fetched: u64,
    pub events_buffered: u64,
    pub events_rejected: u64,
    pub malformed: u64,
    pub completion: Option<CompletionReason>,
    pub last_error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl BackfillProgress {
    fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            phase: BackfillPhase::Idle,
            cursor: None,
            chunks_fetched: 0,
            events_buffered: 0,
            events_rejected: 0,
            malformed: 0,
            completion: None,
            last_error: None,
            started_at: Utc::now(),
            finished_at: None,
        }
    }
}

/// Per-partition progress, read by the reporting surface.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: RwLock<BTreeMap<PartitionId, BackfillProgress>>,
}

impl ProgressRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim a partition. Fails if a walk is already running for it.
    pub fn try_start(&self, partition: PartitionId) -> bool {
        let mut entries = self.entries.write();
        if entries
            .get(&partition)
            .is_some_and(|p| !p.phase.is_terminal())
        {
            return false;
        }
        entries.insert(partition, BackfillProgress::new(partition));
        true
    }

    pub fn update(&self, partition: PartitionId, f: impl FnOnce(&mut BackfillProgress)) {
        if let Some(progress) = self.entries.write().get_mut(&partition) {
            f(progress);
        }
    }

    pub fn get(&self, partition: PartitionId) -> Option<BackfillProgress> {
        self.entries.read().get(&partition).cloned()
    }

    pub fn snapshot(&self) -> Vec<BackfillProgress> {
        self.entries.read().values().cloned().collect()
    }

    pub fn running(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|p| !p.phase.is_terminal())
            .count()
    }
}

/// What one chunk contributed.
struct Chunk {
    accepted: Vec<Event>,
    oldest: Option<i64>,
    reached_cutoff: bool,
    exhausted: bool,
}

pub struct BackfillEngine {
    config: BackfillConfig,
    source: Arc<dyn EventSource>,
    ctx: PipelineContext,
    buffer: Arc<BatchBuffer>,
    filter: Arc<EventFilter>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    registry: Arc<ProgressRegistry>,
}

impl BackfillEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BackfillConfig,
        source: Arc<dyn EventSource>,
        ctx: PipelineContext,
        buffer: Arc<BatchBuffer>,
        filter: Arc<EventFilter>,
        limiter: Arc<RateLimiter>,
        retry: RetryPolicy,
        registry: Arc<ProgressRegistry>,
    ) -> Self {
        Self {
            config,
            source,
            ctx,
            buffer,
            filter,
            limiter,
            retry,
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ProgressRegistry> {
        &self.registry
    }

    /// Walk partitions in parallel, at most `concurrency` at a time.
    pub async fn run_all(
        self: &Arc<Self>,
        partitions: Vec<PartitionId>,
    ) -> Vec<(PartitionId, BackfillOutcome)> {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tasks = JoinSet::new();

        info!(
            partitions = partitions.len(),
            concurrency = self.config.concurrency,
            "Starting backfill"
        );

        for partition in partitions {
            let engine = self.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (partition, BackfillOutcome::Cancelled);
                };
                (partition, engine.run_partition(partition).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => error!(error = %e, "Backfill task failed"),
            }
        }
        outcomes.sort_by_key(|(partition, _)| *partition);

        let completed = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, BackfillOutcome::Completed(_)))
            .count();
        info!(
            partitions = outcomes.len(),
            completed,
            "Backfill run finished"
        );
        outcomes
    }

    /// Walk one partition until the source is exhausted, the age limit is
    /// crossed, or something stops it.
    pub async fn run_partition(&self, partition: PartitionId) -> BackfillOutcome {
        if self.ctx.cancel.is_cancelled() {
            return BackfillOutcome::Cancelled;
        }
        if !self.registry.try_start(partition) {
            debug!(partition, "Backfill already running");
            return BackfillOutcome::Skipped;
        }

        let checkpoint = match self
            .ctx
            .checkpoints
            .get(CheckpointKey::backfill(partition))
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(e) => return self.finish(partition, outcome_for(&e), Some(&e)),
        };

        if checkpoint.as_ref().is_some_and(|c| c.backfill_completed()) {
            debug!(partition, "Backfill already completed");
            return self.finish(partition, BackfillOutcome::Skipped, None);
        }

        let resumed = checkpoint.as_ref().is_some_and(|c| c.backfill_in_progress);
        let cursor = match checkpoint.and_then(|c| c.last_position) {
            Some(position) => Some(position),
            None => match self.ctx.store.latest_position(partition).await {
                Ok(latest) => latest,
                Err(e) => return self.finish(partition, outcome_for(&e), Some(&e)),
            },
        };

        if let Err(e) = self.ctx.checkpoints.begin_backfill(partition).await {
            return self.finish(partition, outcome_for(&e), Some(&e));
        }

        info!(partition, ?cursor, resumed, "Backfill started");
        self.ctx.metrics.active_backfills.inc();
        let outcome = self.walk(partition, cursor).await;
        self.ctx.metrics.active_backfills.dec();

        match outcome {
            Ok(reason) => self.complete(partition, reason).await,
            Err(e) => self.finish(partition, outcome_for(&e), Some(&e)),
        }
    }

    async fn walk(&self, partition: PartitionId, mut cursor: Option<i64>) -> Result<CompletionReason> {
        let cutoff = self.config.max_age().map(|age| Utc::now() - age);
        let delay = self.config.inter_chunk_delay();

        loop {
            if self.ctx.cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            self.set_phase(partition, BackfillPhase::FetchingChunk);
            let page = self.fetch_chunk(partition, cursor).await?;
            self.ctx.metrics.backfill_chunks.inc();
            self.registry
                .update(partition, |p| p.chunks_fetched += 1);

            self.set_phase(partition, BackfillPhase::Filtering);
            let chunk = self.filter_chunk(partition, cursor, cutoff, page);

            self.set_phase(partition, BackfillPhase::Buffering);
            let buffered = chunk.accepted.len() as u64;
            for event in chunk.accepted {
                self.buffer.add(event.backfilled());
            }
            self.ctx.metrics.events_accepted.inc_by(buffered);
            self.ctx.metrics.backfill_events.inc_by(buffered);

            let advanced = match (chunk.oldest, cursor) {
                (Some(oldest), Some(current)) => oldest < current,
                (Some(_), None) => true,
                (None, _) => false,
            };
            if advanced {
                cursor = chunk.oldest;
            }
            self.registry.update(partition, |p| {
                p.events_buffered += buffered;
                p.cursor = cursor;
            });
            debug!(partition, buffered, ?cursor, "Backfill chunk buffered");

            if chunk.reached_cutoff {
                return Ok(CompletionReason::MaxAgeReached);
            }
            if chunk.exhausted || !advanced {
                return Ok(CompletionReason::SourceExhausted);
            }

            if !delay.is_zero() {
                tokio::select! {
                    _ = self.ctx.cancel.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    async fn fetch_chunk(&self, partition: PartitionId, before: Option<i64>) -> Result<HistoryPage> {
        let cancel = &self.ctx.cancel;
        let limiter = &self.limiter;
        let source = &self.source;
        let metrics = &self.ctx.metrics;
        let registry = &self.registry;
        let limit = self.config.chunk_size;

        let result = self
            .retry
            .run_classified(
                "fetch_history",
                cancel,
                Error::classify,
                |_, err, _| {
                    metrics.source_errors.inc();
                    registry.update(partition, |p| {
                        p.phase = BackfillPhase::BackoffWait;
                        p.last_error = Some(err.to_string());
                    });
                },
                |attempt| async move {
                    if attempt > 1 {
                        registry.update(partition, |p| p.phase = BackfillPhase::FetchingChunk);
                    }
                    limiter.wait(SOURCE_KEY, cancel).await?;
                    let started = Instant::now();
                    let page = tokio::select! {
                        _ = cancel.cancelled() => return Err(Error::Cancelled),
                        page = source.fetch_history(partition, before, limit) => page,
                    };
                    metrics
                        .fetch_latency_ms
                        .observe(started.elapsed().as_millis() as u64);
                    page
                },
            )
            .await;

        if let Err(e) = &result {
            if !e.is_cancelled() {
                metrics.source_errors.inc();
            }
        }
        result
    }

    /// Drop what must not be buffered and find the new frontier.
    fn filter_chunk(
        &self,
        partition: PartitionId,
        cursor: Option<i64>,
        cutoff: Option<DateTime<Utc>>,
        page: HistoryPage,
    ) -> Chunk {
        let exhausted = page.is_exhausted();
        let mut chunk = Chunk {
            accepted: Vec::new(),
            oldest: None,
            reached_cutoff: false,
            exhausted,
        };
        let mut rejected = 0;
        let mut malformed = 0;

        for item in page.events {
            let event = match item {
                SourceItem::Event(event) => event,
                SourceItem::Malformed { reason, raw } => {
                    warn!(partition, reason = %reason, raw = %raw, "Skipping malformed history payload");
                    self.ctx.metrics.events_skipped.inc();
                    malformed += 1;
                    continue;
                }
            };

            if event.partition != partition {
                warn!(
                    partition,
                    other = event.partition,
                    id = %event.id,
                    "History page returned an event of another partition"
                );
                continue;
            }
            if cursor.is_some_and(|c| event.position >= c) {
                debug!(partition, position = event.position, "Ignoring event at or after cursor");
                continue;
            }

            chunk.oldest = Some(chunk.oldest.map_or(event.position, |o| o.min(event.position)));

            if cutoff.is_some_and(|c| event.occurred_at < c) {
                chunk.reached_cutoff = true;
                continue;
            }

            self.ctx.metrics.events_received.inc();
            let decision = self.filter.evaluate(&event);
            if !decision.is_accepted() {
                debug!(partition, id = %event.id, reason = decision.reason(), "Event filtered");
                self.ctx.metrics.events_rejected.inc();
                rejected += 1;
                continue;
            }
            chunk.accepted.push(event);
        }

        // Newest first, so the committed frontier never skips a newer event.
        chunk
            .accepted
            .sort_by_key(|e| std::cmp::Reverse(e.position));

        self.registry.update(partition, |p| {
            p.events_rejected += rejected;
            p.malformed += malformed;
        });
        chunk
    }

    /// Flush what the walk buffered, then clear the flag.
    async fn complete(&self, partition: PartitionId, reason: CompletionReason) -> BackfillOutcome {
        if let Err(e) = self.buffer.flush_now().await {
            warn!(partition, error = %e, "Final backfill flush failed, leaving flag set");
            let outcome = if e.is_cancelled() {
                BackfillOutcome::Cancelled
            } else {
                BackfillOutcome::Paused
            };
            return self.finish(partition, outcome, Some(&e));
        }

        if let Err(e) = self.ctx.checkpoints.end_backfill(partition).await {
            return self.finish(partition, outcome_for(&e), Some(&e));
        }

        self.registry.update(partition, |p| p.completion = Some(reason));
        self.finish(partition, BackfillOutcome::Completed(reason), None)
    }

    fn finish(
        &self,
        partition: PartitionId,
        outcome: BackfillOutcome,
        err: Option<&Error>,
    ) -> BackfillOutcome {
        self.registry.update(partition, |p| {
            p.phase = outcome.phase();
            p.finished_at = Some(Utc::now());
            if let Some(err) = err {
                p.last_error = Some(err.to_string());
            }
        });

        match (outcome, err) {
            (BackfillOutcome::Completed(reason), _) => {
                info!(partition, ?reason, "Backfill completed")
            }
            (BackfillOutcome::Skipped, _) => debug!(partition, "Backfill skipped"),
            (BackfillOutcome::Cancelled, _) => info!(partition, "Backfill cancelled"),
            (_, Some(e)) => error!(partition, ?outcome, error = %e, "Backfill stopped"),
            (_, None) => warn!(partition, ?outcome, "Backfill stopped"),
        }
        outcome
    }

    fn set_phase(&self, partition: PartitionId, phase: BackfillPhase) {
        self.registry.update(partition, |p| p.phase = phase);
    }
}

/// Exhausted retries pause; everything else that is not shutdown aborts.
fn outcome_for(err: &Error) -> BackfillOutcome {
    match err {
        Error::Cancelled => BackfillOutcome::Cancelled,
        Error::RetriesExhausted { .. } => BackfillOutcome::Paused,
        e if e.is_transient() => BackfillOutcome::Paused,
        _ => BackfillOutcome::Aborted,
    }
}
