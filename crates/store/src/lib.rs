//! Event and checkpoint storage.
//!
//! [`EventStore`] is the durable side of the pipeline. Two backends exist:
//! [`PostgresStore`] for production and [`MemoryStore`] for development and
//! tests. Both give the same guarantees: one row per (natural id, partition),
//! checkpoints that only move in their purpose's direction, and all writes of
//! a [`CommitBatch`] applied together or not at all.

pub mod client;
pub mod config;
pub mod errors;
pub mod memory;
pub mod ops;
pub mod schema;
pub mod store;

pub use client::PostgresClient;
pub use config::PostgresConfig;
pub use memory::MemoryStore;
pub use ops::PostgresStore;
pub use store::*;
