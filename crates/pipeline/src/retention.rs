//! Retention sweeps: delete events older than the configured horizon.
//!
//! Rows are removed by age, never by partition, so descriptors and
//! checkpoints survive a sweep. A backfill walk never reaches back past the
//! horizon, which keeps a sweep from being undone by the next walk.

use chrono::{DateTime, Utc};
use ingest_core::Result;
use store::RetentionOutcome;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::RetentionConfig;
use crate::context::PipelineContext;
use crate::retry::RetryPolicy;

/// Periodically deletes expired events from storage.
pub struct RetentionWorker {
    config: RetentionConfig,
    ctx: PipelineContext,
    retry: RetryPolicy,
}

impl RetentionWorker {
    pub fn new(config: RetentionConfig, ctx: PipelineContext, retry: RetryPolicy) -> Self {
        Self { config, ctx, retry }
    }

    /// Events that occurred before this instant are expired at `now`.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.config.keep().map(|keep| now - keep)
    }

    /// Run one sweep. Does nothing when retention is off.
    pub async fn run_once(&self, now: DateTime<Utc>) -> Result<RetentionOutcome> {
        let Some(cutoff) = self.cutoff(now) else {
            debug!("Retention disabled, nothing to delete");
            return Ok(RetentionOutcome::default());
        };

        let store = &self.ctx.store;
        let outcome = self
            .retry
            .run("delete_expired", &self.ctx.cancel, |_| async move {
                store.delete_older_than(cutoff).await
            })
            .await?;

        let metrics = &self.ctx.metrics;
        metrics.events_expired.inc_by(outcome.total());
        metrics.last_retention_at.mark_now();
        info!(
            %cutoff,
            messages_deleted = outcome.messages_deleted,
            actions_deleted = outcome.actions_deleted,
            "Retention sweep complete"
        );
        Ok(outcome)
    }

    /// Spawn the sweep loop; the first sweep runs immediately.
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move { self.run_schedule().await })
    }

    async fn run_schedule(&self) {
        let cancel = self.ctx.cancel.clone();
        let every = self.config.interval();
        let mut ticker = tokio::time::interval_at(Instant::now(), every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            keep_days = self.config.keep_days,
            interval_secs = self.config.interval_secs,
            "Retention task started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match self.run_once(Utc::now()).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => break,
                Err(e) => error!(error = %e, "Retention sweep failed"),
            }
        }
        debug!("Retention task stopped");
    }
}
