//! Read-only HTTP reporting surface for the ingestion pipeline.

pub mod response;
pub mod routes;
pub mod state;

pub use routes::router;
pub use state::{AppState, StatsCache};
