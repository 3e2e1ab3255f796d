//! Per-feed watermark persistence.
//!
//! A `Checkpoint` records the event time of the newest record ingested for a
//! feed (`timestamp`) and when that checkpoint was written (`imported_at`).
//! Stores apply puts conditionally: a put whose `imported_at` is older than
//! the stored one is dropped, so racing writers converge on the most recent
//! operation regardless of arrival order.

mod memory;
mod object;

pub use memory::MemoryCheckpointStore;
pub use object::ObjectCheckpointStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use drover_core::StorageProvider;

use crate::config::FeedKey;
use crate::error::CheckpointError;

/// A reference-counted checkpoint store shared by every feed in the process.
pub type CheckpointStoreRef = Arc<dyn CheckpointStore>;

/// Persisted watermark for one feed.
///
/// Serialized with the field names `table_name`, `timestamp` and
/// `imported_at`; existing deployments read and write this exact shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Destination table of the feed.
    pub table_name: String,
    /// Watermark: event time of the newest ingested record.
    pub timestamp: DateTime<Utc>,
    /// Operation time of the write, used to arbitrate concurrent writers.
    pub imported_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(
        table_name: impl Into<String>,
        timestamp: DateTime<Utc>,
        imported_at: DateTime<Utc>,
    ) -> Self {
        Self {
            table_name: table_name.into(),
            timestamp,
            imported_at,
        }
    }

    /// Whether `self` may replace `existing`.
    ///
    /// Only a strictly newer existing write wins; equal operation times overwrite.
    pub fn supersedes(&self, existing: &Checkpoint) -> bool {
        existing.imported_at <= self.imported_at
    }
}

/// Durable mapping from feed to its latest checkpoint.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Fetch the checkpoint for `feed`. A feed never checkpointed yields `None`.
    async fn get(&self, feed: &FeedKey) -> Result<Option<Checkpoint>, CheckpointError>;

    /// Store `checkpoint` unless a checkpoint with a later `imported_at` is
    /// already stored, in which case this is a silent no-op.
    async fn put(&self, feed: &FeedKey, checkpoint: Checkpoint) -> Result<(), CheckpointError>;
}

/// Pick the store implementation for a storage location.
///
/// `memory://` locations use the in-process store; everything else keeps one
/// JSON object per feed in the object store.
pub fn open_store(storage: StorageProvider) -> CheckpointStoreRef {
    if storage.is_memory() {
        Arc::new(MemoryCheckpointStore::new())
    } else {
        Arc::new(ObjectCheckpointStore::new(storage))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, hour, 0, 0).unwrap()
    }

    #[test]
    fn test_serialized_shape() {
        let checkpoint = Checkpoint::new("otx_pulses", at(10), at(11));
        let json = serde_json::to_value(&checkpoint).unwrap();

        assert_eq!(json["table_name"], "otx_pulses");
        assert_eq!(json["timestamp"], "2024-03-01T10:00:00Z");
        assert_eq!(json["imported_at"], "2024-03-01T11:00:00Z");
    }

    #[test]
    fn test_reads_offset_timestamps() {
        let json = r#"{
            "table_name": "abusech_feodo",
            "timestamp": "2024-03-01T12:00:00+02:00",
            "imported_at": "2024-03-01T11:00:00.123456Z"
        }"#;
        let checkpoint: Checkpoint = serde_json::from_str(json).unwrap();
        assert_eq!(checkpoint.timestamp, at(10));
    }

    #[test]
    fn test_supersedes() {
        let older = Checkpoint::new("t", at(5), at(1));
        let newer = Checkpoint::new("t", at(4), at(2));

        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
        assert!(older.supersedes(&older.clone()));
    }
}
