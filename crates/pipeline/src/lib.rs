//! Ingestion pipeline: filtering, batching, checkpointing and backfill.
//!
//! Live events and backfilled history flow through the same path:
//!
//! ```text
//! EventSource -> EventFilter -> BatchBuffer -> CheckpointStore::commit -> EventStore
//! ```
//!
//! An event counts as processed only once the batch containing it is
//! committed together with its checkpoint advances. Storage upserts on
//! (natural id, partition), so an event delivered by both the live feed
//! and a backfill walk is stored once.

pub mod backfill;
pub mod buffer;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod filter;
pub mod rate_limit;
pub mod retention;
pub mod retry;

#[cfg(test)]
mod test_support;

pub use backfill::{
    BackfillEngine, BackfillOutcome, BackfillPhase, BackfillProgress, CompletionReason,
    ProgressRegistry,
};
pub use buffer::{build_batch, BatchBuffer, FlushFailure};
pub use checkpoint::CheckpointStore;
pub use config::{
    BackfillConfig, BatchConfig, FilterConfig, PipelineConfig, RateLimitConfig, RetentionConfig,
    RetryConfig,
};
pub use context::PipelineContext;
pub use coordinator::{IngestionCoordinator, PipelineReport};
pub use filter::{EventFilter, FilterDecision};
pub use rate_limit::{RateLimiter, SOURCE_KEY, STORAGE_KEY};
pub use retention::RetentionWorker;
pub use retry::RetryPolicy;
