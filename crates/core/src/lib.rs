//! Core types, checkpoints, and error taxonomy for the chat ingestion pipeline.

pub mod checkpoint;
pub mod descriptors;
pub mod error;
pub mod events;

pub use checkpoint::*;
pub use descriptors::*;
pub use error::{Error, FailureClass, Result, SourceErrorCode, StorageErrorCode};
pub use events::*;
