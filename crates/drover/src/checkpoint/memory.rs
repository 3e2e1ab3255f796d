//! In-process checkpoint store.
//!
//! Backed by a sharded `DashMap`: a put holds the write guard of its entry
//! while it compares and replaces, so puts for one feed are serialized and
//! feeds on other shards are never blocked.

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

use super::{Checkpoint, CheckpointStore};
use crate::config::FeedKey;
use crate::error::CheckpointError;

/// Checkpoints held in memory for the lifetime of the process.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoints: DashMap<FeedKey, Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of feeds with a stored checkpoint.
    pub fn len(&self) -> usize {
        self.checkpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checkpoints.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self, feed: &FeedKey) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.checkpoints.get(feed).map(|entry| entry.value().clone()))
    }

    async fn put(&self, feed: &FeedKey, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        match self.checkpoints.entry(feed.clone()) {
            Entry::Occupied(mut entry) => {
                if checkpoint.supersedes(entry.get()) {
                    entry.insert(checkpoint);
                } else {
                    debug!(
                        feed = %feed,
                        stored = %entry.get().imported_at,
                        incoming = %checkpoint.imported_at,
                        "Ignoring checkpoint older than the stored one"
                    );
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(checkpoint);
            }
        }
        Ok(())
    }
}
