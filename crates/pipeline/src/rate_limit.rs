//! Sliding-window rate limiting for outbound calls.

use ingest_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::RateLimitConfig;

/// Key for calls to the event source.
pub const SOURCE_KEY: &str = "source";
/// Key for storage commits.
pub const STORAGE_KEY: &str = "storage";

/// Admits at most `max_calls` per key within any `window`.
///
/// Each call reserves an admission instant under the lock and returns how
/// long the caller must wait for it. Calls are never rejected, only delayed.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Reserve a slot for `key` and return the delay until it opens.
    pub fn acquire(&self, key: &str) -> Duration {
        if !self.config.enabled {
            return Duration::ZERO;
        }

        let now = Instant::now();
        let window = self.config.window();
        let max = self.config.max_calls.max(1) as usize;

        let mut windows = self.windows.lock();
        let slots = windows.entry(key.to_string()).or_default();

        while slots.front().is_some_and(|&t| t + window <= now) {
            slots.pop_front();
        }

        // Slots are ascending; the one `max` places back bounds the next admission.
        let admit_at = if slots.len() < max {
            now
        } else {
            (slots[slots.len() - max] + window).max(now)
        };
        slots.push_back(admit_at);

        admit_at.saturating_duration_since(now)
    }

    /// Acquire and sleep until admitted. Returns `Error::Cancelled` on shutdown.
    pub async fn wait(&self, key: &str, cancel: &CancellationToken) -> Result<()> {
        let delay = self.acquire(key);
        if delay.is_zero() {
            return Ok(());
        }

        debug!(key, delay_ms = delay.as_millis() as u64, "Rate limited, waiting");
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}
