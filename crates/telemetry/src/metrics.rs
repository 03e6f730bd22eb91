//! Pipeline counters.
//!
//! Counters live in an explicitly owned [`PipelineMetrics`] that the
//! coordinator shares by `Arc`. Reporting reads a [`MetricsSnapshot`]; no
//! reader ever takes a lock.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// A counter metric.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_by(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// A gauge metric (can go up or down).
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    pub fn set(&self, val: u64) {
        self.0.store(val, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec(&self) {
        // Saturate at zero; a racing set() may already have cleared it.
        let _ = self
            .0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }
}

/// Histogram for latency tracking.
#[derive(Debug)]
pub struct Histogram {
    /// Buckets: 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 5s, 10s
    buckets: [AtomicU64; 11],
    sum: AtomicU64,
    count: AtomicU64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    const BUCKET_BOUNDS: [u64; 11] = [1, 5, 10, 25, 50, 100, 250, 500, 1000, 5000, 10000];

    pub fn new() -> Self {
        Self {
            buckets: Default::default(),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Records a value in milliseconds.
    pub fn observe(&self, ms: u64) {
        self.sum.fetch_add(ms, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        let idx = Self::BUCKET_BOUNDS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(Self::BUCKET_BOUNDS.len() - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> f64 {
        let count = self.count();
        if count == 0 {
            0.0
        } else {
            self.sum.load(Ordering::Relaxed) as f64 / count as f64
        }
    }

    /// Returns bucket counts.
    pub fn buckets(&self) -> Vec<(u64, u64)> {
        Self::BUCKET_BOUNDS
            .iter()
            .zip(self.buckets.iter())
            .map(|(&bound, count)| (bound, count.load(Ordering::Relaxed)))
            .collect()
    }
}

/// Wall-clock instant stored as epoch milliseconds; zero means never.
#[derive(Debug, Default)]
pub struct Timestamp(AtomicI64);

impl Timestamp {
    pub fn mark_now(&self) {
        self.0.store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn get(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Relaxed) {
            0 => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }
}

/// Counters for one pipeline instance.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    // Intake
    pub events_received: Counter,
    pub events_accepted: Counter,
    pub events_rejected: Counter,
    /// Malformed payloads and rows that failed permanently.
    pub events_skipped: Counter,

    // Flush
    pub events_flushed: Counter,
    /// Events contained in flush attempts that exhausted their retries.
    pub events_failed: Counter,
    pub duplicates_ignored: Counter,
    pub batches_flushed: Counter,
    pub flush_failures: Counter,
    pub last_flush_at: Timestamp,

    // Source
    pub live_polls: Counter,
    pub source_errors: Counter,

    // Backfill
    pub backfill_chunks: Counter,
    pub backfill_events: Counter,

    // Retention
    pub events_expired: Counter,
    pub last_retention_at: Timestamp,

    // Latency histograms
    pub flush_latency_ms: Histogram,
    pub fetch_latency_ms: Histogram,

    // Gauges
    pub buffer_depth: Gauge,
    pub active_backfills: Gauge,
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

/// A snapshot of metrics at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub timestamp: DateTime<Utc>,
    pub events_received: u64,
    pub events_accepted: u64,
    pub events_rejected: u64,
    pub events_skipped: u64,
    pub events_flushed: u64,
    pub events_failed: u64,
    pub duplicates_ignored: u64,
    pub batches_flushed: u64,
    pub flush_failures: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub live_polls: u64,
    pub source_errors: u64,
    pub backfill_chunks: u64,
    pub backfill_events: u64,
    pub events_expired: u64,
    pub last_retention_at: Option<DateTime<Utc>>,
    pub flush_latency_mean_ms: f64,
    pub fetch_latency_mean_ms: f64,
    pub buffer_depth: u64,
    pub active_backfills: u64,
}

impl PipelineMetrics {
    /// Takes a snapshot of current metrics.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            timestamp: Utc::now(),
            events_received: self.events_received.get(),
            events_accepted: self.events_accepted.get(),
            events_rejected: self.events_rejected.get(),
            events_skipped: self.events_skipped.get(),
            events_flushed: self.events_flushed.get(),
            events_failed: self.events_failed.get(),
            duplicates_ignored: self.duplicates_ignored.get(),
            batches_flushed: self.batches_flushed.get(),
            flush_failures: self.flush_failures.get(),
            last_flush_at: self.last_flush_at.get(),
            live_polls: self.live_polls.get(),
            source_errors: self.source_errors.get(),
            backfill_chunks: self.backfill_chunks.get(),
            backfill_events: self.backfill_events.get(),
            events_expired: self.events_expired.get(),
            last_retention_at: self.last_retention_at.get(),
            flush_latency_mean_ms: self.flush_latency_ms.mean(),
            fetch_latency_mean_ms: self.fetch_latency_ms.mean(),
            buffer_depth: self.buffer_depth.get(),
            active_backfills: self.active_backfills.get(),
        }
    }
}
