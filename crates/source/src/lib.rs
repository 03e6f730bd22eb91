//! Where events come from.
//!
//! [`EventSource`] is the collaborator contract: a long-poll live feed and
//! paged history reads. [`HttpSource`] speaks that contract as JSON over
//! HTTP; [`wire`] turns raw payloads into [`ingest_core::Event`]s.

pub mod config;
pub mod http;
pub mod source;
pub mod wire;

pub use config::HttpSourceConfig;
pub use http::HttpSource;
pub use source::*;
