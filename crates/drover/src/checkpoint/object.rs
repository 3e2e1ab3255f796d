//! Checkpoints stored as one JSON object per feed.
//!
//! Puts are a compare-and-swap on the object version: read the stored
//! checkpoint with its e-tag, decide, then write with `PutMode::Update`
//! (or `PutMode::Create` when nothing is stored). Losing the race re-reads
//! and decides again. Backends without conditional writes (the local
//! filesystem) are rejected at configuration time.

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use snafu::prelude::*;
use tracing::debug;

use drover_core::StorageProvider;

use super::{Checkpoint, CheckpointStore};
use crate::config::FeedKey;
use crate::error::{
    CheckpointDecodeSnafu, CheckpointEncodeSnafu, CheckpointError, CheckpointReadSnafu,
    CheckpointWriteSnafu, ContendedSnafu,
};

/// Compare-and-swap rounds before a put gives up.
const MAX_CAS_ATTEMPTS: usize = 16;

/// Checkpoint store on top of any object store with conditional puts.
#[derive(Debug, Clone)]
pub struct ObjectCheckpointStore {
    storage: StorageProvider,
}

/// A stored checkpoint together with the version it was read at.
struct Versioned {
    checkpoint: Checkpoint,
    version: UpdateVersion,
}

impl ObjectCheckpointStore {
    pub fn new(storage: StorageProvider) -> Self {
        Self { storage }
    }

    fn location(&self, feed: &FeedKey) -> Path {
        self.storage.path(&format!("{}.json", feed.id()))
    }

    async fn read(&self, feed: &FeedKey) -> Result<Option<Versioned>, CheckpointError> {
        let location = self.location(feed);
        let result = match self.storage.store().get(&location).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(source).context(CheckpointReadSnafu { feed: feed.id() }),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result
            .bytes()
            .await
            .context(CheckpointReadSnafu { feed: feed.id() })?;
        let checkpoint =
            serde_json::from_slice(&bytes).context(CheckpointDecodeSnafu { feed: feed.id() })?;

        Ok(Some(Versioned {
            checkpoint,
            version,
        }))
    }
}

#[async_trait]
impl CheckpointStore for ObjectCheckpointStore {
    async fn get(&self, feed: &FeedKey) -> Result<Option<Checkpoint>, CheckpointError> {
        Ok(self.read(feed).await?.map(|stored| stored.checkpoint))
    }

    async fn put(&self, feed: &FeedKey, checkpoint: Checkpoint) -> Result<(), CheckpointError> {
        let payload = Bytes::from(
            serde_json::to_vec(&checkpoint).context(CheckpointEncodeSnafu { feed: feed.id() })?,
        );
        let location = self.location(feed);

        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let mode = match self.read(feed).await? {
                Some(stored) if !checkpoint.supersedes(&stored.checkpoint) => {
                    debug!(
                        feed = %feed,
                        stored = %stored.checkpoint.imported_at,
                        incoming = %checkpoint.imported_at,
                        "Ignoring checkpoint older than the stored one"
                    );
                    return Ok(());
                }
                Some(stored) => PutMode::Update(stored.version),
                None => PutMode::Create,
            };

            let options = PutOptions::from(mode);
            match self
                .storage
                .store()
                .put_opts(&location, PutPayload::from(payload.clone()), options)
                .await
            {
                Ok(_) => return Ok(()),
                Err(
                    object_store::Error::Precondition { .. }
                    | object_store::Error::AlreadyExists { .. },
                ) => {
                    debug!(feed = %feed, attempt, "Checkpoint changed concurrently, retrying");
                }
                Err(source) => {
                    return Err(source).context(CheckpointWriteSnafu { feed: feed.id() });
                }
            }
        }

        ContendedSnafu {
            feed: feed.id(),
            attempts: MAX_CAS_ATTEMPTS,
        }
        .fail()
    }
}
