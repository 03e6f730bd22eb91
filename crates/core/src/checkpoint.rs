//! Durable per-partition cursors.
//!
//! A checkpoint exists per (partition, purpose). The `live` cursor follows
//! new events forward; the `backfill` cursor records the oldest position a
//! history walk has committed and therefore moves toward older data. Both
//! are monotonic in their own direction: an advance that would move the
//! cursor backwards is ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::events::PartitionId;

/// Why a cursor is kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointPurpose {
    /// Highest position committed from the live feed.
    Live,
    /// Oldest position committed by a history walk.
    Backfill,
}

impl CheckpointPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Backfill => "backfill",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "live" => Some(Self::Live),
            "backfill" => Some(Self::Backfill),
            _ => None,
        }
    }

    /// Pick the cursor that does not regress for this purpose.
    pub fn furthest(&self, current: Option<i64>, proposed: i64) -> i64 {
        match (self, current) {
            (_, None) => proposed,
            (Self::Live, Some(current)) => current.max(proposed),
            (Self::Backfill, Some(current)) => current.min(proposed),
        }
    }

    /// The furthest position of a set of positions in this purpose's direction.
    pub fn furthest_of(&self, positions: impl IntoIterator<Item = i64>) -> Option<i64> {
        let iter = positions.into_iter();
        match self {
            Self::Live => iter.max(),
            Self::Backfill => iter.min(),
        }
    }
}

impl fmt::Display for CheckpointPurpose {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Checkpoint identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CheckpointKey {
    pub partition: PartitionId,
    pub purpose: CheckpointPurpose,
}

impl CheckpointKey {
    pub fn new(partition: PartitionId, purpose: CheckpointPurpose) -> Self {
        Self { partition, purpose }
    }

    pub fn live(partition: PartitionId) -> Self {
        Self::new(partition, CheckpointPurpose::Live)
    }

    pub fn backfill(partition: PartitionId) -> Self {
        Self::new(partition, CheckpointPurpose::Backfill)
    }
}

/// Stored cursor state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition: PartitionId,
    pub purpose: CheckpointPurpose,
    pub last_position: Option<i64>,
    pub last_timestamp: Option<DateTime<Utc>>,
    pub total_processed: u64,
    pub backfill_in_progress: bool,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// A fresh checkpoint created on first contact with a partition.
    pub fn new(key: CheckpointKey) -> Self {
        Self {
            partition: key.partition,
            purpose: key.purpose,
            last_position: None,
            last_timestamp: None,
            total_processed: 0,
            backfill_in_progress: false,
            last_completed_at: None,
            updated_at: Utc::now(),
        }
    }

    pub fn key(&self) -> CheckpointKey {
        CheckpointKey::new(self.partition, self.purpose)
    }

    /// Apply an advance without ever regressing the cursor.
    pub fn apply(&mut self, advance: &CheckpointAdvance) {
        self.last_position = Some(self.purpose.furthest(self.last_position, advance.position));
        self.last_timestamp = match (self.last_timestamp, advance.timestamp) {
            (Some(current), Some(proposed)) => Some(current.max(proposed)),
            (current, proposed) => current.or(proposed),
        };
        self.total_processed += advance.delta_count;
        self.updated_at = Utc::now();
    }

    /// A backfill that finished cleanly and is not running again.
    pub fn backfill_completed(&self) -> bool {
        !self.backfill_in_progress && self.last_completed_at.is_some()
    }
}

/// A requested cursor move, produced from a committed batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointAdvance {
    pub key: CheckpointKey,
    pub position: i64,
    pub timestamp: Option<DateTime<Utc>>,
    pub delta_count: u64,
}
