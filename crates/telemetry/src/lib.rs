//! Observability for the chat ingestion pipeline.
//!
//! Counters and health state are plain owned values shared by `Arc`; the
//! reporting surface reads snapshots of them.

pub mod health;
pub mod metrics;
pub mod tracing_setup;

pub use health::*;
pub use metrics::*;
pub use tracing_setup::*;
