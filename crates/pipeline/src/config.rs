//! Pipeline configuration.

use ingest_core::PartitionId;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use validator::{Validate, ValidationError};

fn default_true() -> bool {
    true
}

/// Batch buffer settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchConfig {
    /// Pending events that trigger a flush
    #[serde(default = "default_batch_max_size")]
    #[validate(range(min = 1, max = 500))]
    pub max_size: usize,
    /// Maximum time between flushes
    #[serde(default = "default_flush_interval_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub flush_interval_secs: u64,
}

fn default_batch_max_size() -> usize {
    5
}

fn default_flush_interval_secs() -> u64 {
    5
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            flush_interval_secs: default_flush_interval_secs(),
        }
    }
}

impl BatchConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }
}

/// Backoff schedule for outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[validate(schema(function = "validate_retry_bounds"))]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    #[validate(range(min = 1, max = 10))]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_secs")]
    #[validate(range(min = 0.1, max = 60.0))]
    pub base_delay_secs: f64,
    #[serde(default = "default_multiplier")]
    #[validate(range(min = 1.0, max = 10.0))]
    pub multiplier: f64,
    #[serde(default = "default_max_delay_secs")]
    #[validate(range(min = 0.1, max = 3600.0))]
    pub max_delay_secs: f64,
    /// Symmetric jitter as a fraction of the delay
    #[serde(default = "default_jitter")]
    #[validate(range(min = 0.0, max = 1.0))]
    pub jitter: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_secs() -> f64 {
    5.0
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay_secs() -> f64 {
    60.0
}

fn default_jitter() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_secs: default_base_delay_secs(),
            multiplier: default_multiplier(),
            max_delay_secs: default_max_delay_secs(),
            jitter: default_jitter(),
        }
    }
}

fn validate_retry_bounds(config: &RetryConfig) -> Result<(), ValidationError> {
    if config.max_delay_secs < config.base_delay_secs {
        let mut err = ValidationError::new("max_delay_below_base");
        err.message = Some(
            format!(
                "max_delay_secs {} is below base_delay_secs {}",
                config.max_delay_secs, config.base_delay_secs
            )
            .into(),
        );
        return Err(err);
    }
    Ok(())
}

/// Sliding-window limit on outbound calls.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_secs")]
    #[validate(range(min = 1, max = 3600))]
    pub window_secs: u64,
    #[serde(default = "default_max_calls")]
    #[validate(range(min = 1))]
    pub max_calls: u32,
}

fn default_window_secs() -> u64 {
    60
}

fn default_max_calls() -> u32 {
    30
}

impl RateLimitConfig {
    pub fn new(window_secs: u64, max_calls: u32) -> Self {
        Self {
            enabled: true,
            window_secs,
            max_calls,
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::source_default()
        }
    }

    /// 30 calls per minute.
    pub fn source_default() -> Self {
        Self::new(default_window_secs(), default_max_calls())
    }

    /// 600 calls per minute.
    pub fn storage_default() -> Self {
        Self::new(default_window_secs(), 600)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// History walk settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BackfillConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub on_startup: bool,
    /// Events requested per history fetch
    #[serde(default = "default_chunk_size")]
    #[validate(range(min = 1, max = 1000))]
    pub chunk_size: usize,
    #[serde(default = "default_inter_chunk_delay_secs")]
    #[validate(range(min = 0.0, max = 300.0))]
    pub inter_chunk_delay_secs: f64,
    /// Stop walking at events older than this
    #[serde(default)]
    #[validate(range(min = 1, max = 36500))]
    pub max_age_days: Option<u32>,
    /// Partitions walked in parallel
    #[serde(default = "default_concurrency")]
    #[validate(range(min = 1, max = 64))]
    pub concurrency: usize,
    /// Re-run the backfill on this schedule
    #[serde(default)]
    #[validate(range(min = 1))]
    pub interval_secs: Option<u64>,
    /// Partitions always backfilled, in addition to those known to storage
    #[serde(default)]
    pub partitions: Vec<PartitionId>,
}

fn default_chunk_size() -> usize {
    100
}

fn default_inter_chunk_delay_secs() -> f64 {
    1.0
}

fn default_concurrency() -> usize {
    4
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            on_startup: true,
            chunk_size: default_chunk_size(),
            inter_chunk_delay_secs: default_inter_chunk_delay_secs(),
            max_age_days: None,
            concurrency: default_concurrency(),
            interval_secs: None,
            partitions: Vec::new(),
        }
    }
}

impl BackfillConfig {
    pub fn inter_chunk_delay(&self) -> Duration {
        Duration::from_secs_f64(self.inter_chunk_delay_secs)
    }

    pub fn max_age(&self) -> Option<chrono::Duration> {
        self.max_age_days.map(|d| chrono::Duration::days(i64::from(d)))
    }
}

/// Deletion of old events.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RetentionConfig {
    /// Keep events newer than this; unset keeps everything
    #[serde(default)]
    #[validate(range(min = 1, max = 36500))]
    pub keep_days: Option<u32>,
    /// Time between sweeps
    #[serde(default = "default_retention_interval_secs")]
    #[validate(range(min = 60))]
    pub interval_secs: u64,
}

fn default_retention_interval_secs() -> u64 {
    86_400
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_days: None,
            interval_secs: default_retention_interval_secs(),
        }
    }
}

impl RetentionConfig {
    pub fn keep(&self) -> Option<chrono::Duration> {
        self.keep_days.map(|d| chrono::Duration::days(i64::from(d)))
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

/// Which events are in scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Only these chats, when non-empty
    #[serde(default)]
    pub allowed_chats: Vec<PartitionId>,
    #[serde(default)]
    pub ignored_chats: Vec<PartitionId>,
    /// Only these channel usernames, when non-empty
    #[serde(default)]
    pub allowed_channels: Vec<String>,
    #[serde(default)]
    pub ignored_channels: Vec<String>,
    #[serde(default = "default_true")]
    pub process_bot_messages: bool,
    #[serde(default = "default_true")]
    pub process_system_messages: bool,
    #[serde(default = "default_true")]
    pub process_channel_messages: bool,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            allowed_chats: Vec::new(),
            ignored_chats: Vec::new(),
            allowed_channels: Vec::new(),
            ignored_channels: Vec::new(),
            process_bot_messages: true,
            process_system_messages: true,
            process_channel_messages: true,
        }
    }
}

/// Everything the coordinator needs.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PipelineConfig {
    #[serde(default)]
    #[validate(nested)]
    pub batch: BatchConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retry: RetryConfig,
    #[serde(default = "RateLimitConfig::source_default")]
    #[validate(nested)]
    pub source_rate_limit: RateLimitConfig,
    #[serde(default = "RateLimitConfig::storage_default")]
    #[validate(nested)]
    pub storage_rate_limit: RateLimitConfig,
    #[serde(default)]
    #[validate(nested)]
    pub backfill: BackfillConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    #[validate(nested)]
    pub retention: RetentionConfig,
    /// Pause after the live feed exhausts its retries
    #[serde(default = "default_live_pause_secs")]
    pub live_pause_secs: u64,
    /// Pending events older than this without a flush mark the buffer stale
    #[serde(default = "default_stale_flush_secs")]
    pub stale_flush_secs: u64,
}

fn default_live_pause_secs() -> u64 {
    30
}

fn default_stale_flush_secs() -> u64 {
    300
}

impl PipelineConfig {
    /// Backfill settings with the walk held inside the retention horizon.
    pub fn effective_backfill(&self) -> BackfillConfig {
        let mut backfill = self.backfill.clone();
        if let Some(keep) = self.retention.keep_days {
            backfill.max_age_days = Some(backfill.max_age_days.map_or(keep, |age| age.min(keep)));
        }
        backfill
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            source_rate_limit: RateLimitConfig::source_default(),
            storage_rate_limit: RateLimitConfig::storage_default(),
            backfill: BackfillConfig::default(),
            filter: FilterConfig::default(),
            retention: RetentionConfig::default(),
            live_pause_secs: default_live_pause_secs(),
            stale_flush_secs: default_stale_flush_secs(),
        }
    }
}
