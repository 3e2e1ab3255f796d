//! The ingestion orchestrator.
//!
//! One run of one feed walks
//! `Start -> SchemaReady -> Fetching -> Filtering -> Writing -> CheckpointAdvance -> Done`:
//!
//! 1. Read the feed's checkpoint; without one the watermark is `now - initial_lookback`.
//! 2. Create or evolve the destination table.
//! 3. Stream pages from the source. Keep records strictly newer than the
//!    watermark read in step 1, and track the newest event time over every
//!    record seen.
//! 4. Insert each page's kept records as one batch.
//! 5. After the last page, store the newest event time as the new watermark
//!    if it moved forward.
//!
//! Any error aborts the run before the checkpoint moves. A crash between an
//! insert and the checkpoint write re-inserts those records on the next run.

mod pipeline;

pub use pipeline::{FeedPipeline, build_pipelines};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use snafu::prelude::*;
use std::fmt;
use std::future::Future;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use drover_core::emit;

use crate::checkpoint::{Checkpoint, CheckpointStoreRef};
use crate::config::FeedKey;
use crate::error::{CheckpointSnafu, FeedSnafu, IngestError, SinkSnafu};
use crate::feed::{FeedRecord, FeedSourceRef};
use crate::metrics::events::{
    CheckpointAdvanced, PageFetched, RecordsInserted, RecordsKept, RunCompleted, RunOutcome,
};
use crate::sink::TableSink;

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    SchemaReady,
    Fetching,
    Filtering,
    Writing,
    CheckpointAdvance,
    Done,
    Failed,
}

impl RunState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Start => "start",
            RunState::SchemaReady => "schema_ready",
            RunState::Fetching => "fetching",
            RunState::Filtering => "filtering",
            RunState::Writing => "writing",
            RunState::CheckpointAdvance => "checkpoint_advance",
            RunState::Done => "done",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a successful run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub feed: FeedKey,
    pub pages: usize,
    /// Records returned by the source.
    pub seen: usize,
    /// Records newer than the input watermark.
    pub kept: usize,
    pub inserted: usize,
    pub watermark_before: DateTime<Utc>,
    pub watermark_after: DateTime<Utc>,
}

impl RunReport {
    fn new(feed: FeedKey, watermark: DateTime<Utc>) -> Self {
        Self {
            feed,
            pages: 0,
            seen: 0,
            kept: 0,
            inserted: 0,
            watermark_before: watermark,
            watermark_after: watermark,
        }
    }

    pub fn advanced(&self) -> bool {
        self.watermark_after > self.watermark_before
    }
}

/// Records of one page split against a watermark.
#[derive(Debug, Default)]
pub struct Filtered {
    /// Rows of records strictly newer than the watermark, in page order.
    pub rows: Vec<serde_json::Value>,
    /// Newest event time among all records, kept or not.
    pub max_observed: Option<DateTime<Utc>>,
}

/// Keep records whose event time is strictly after `watermark`.
pub fn filter_records(records: Vec<FeedRecord>, watermark: DateTime<Utc>) -> Filtered {
    let max_observed = records.iter().map(|record| record.event_time).max();
    let rows = records
        .into_iter()
        .filter(|record| record.event_time > watermark)
        .map(|record| record.row)
        .collect();

    Filtered { rows, max_observed }
}

/// Drives one feed from its source into its table.
pub struct Ingestion {
    feed: FeedKey,
    source: FeedSourceRef,
    sink: TableSink,
    checkpoints: CheckpointStoreRef,
    initial_lookback: ChronoDuration,
}

impl Ingestion {
    pub fn new(
        feed: FeedKey,
        source: FeedSourceRef,
        sink: TableSink,
        checkpoints: CheckpointStoreRef,
        initial_lookback: ChronoDuration,
    ) -> Self {
        Self {
            feed,
            source,
            sink,
            checkpoints,
            initial_lookback,
        }
    }

    pub fn feed(&self) -> &FeedKey {
        &self.feed
    }

    /// Run the feed once.
    ///
    /// Every store call and page fetch is abandoned as soon as `shutdown`
    /// is cancelled, which ends the run with `IngestError::Cancelled`.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<RunReport, IngestError> {
        let started = Instant::now();
        let result = self.execute(shutdown).await;

        let outcome = match &result {
            Ok(report) => {
                info!(
                    feed = %self.feed,
                    table = self.source.table(),
                    pages = report.pages,
                    seen = report.seen,
                    kept = report.kept,
                    inserted = report.inserted,
                    watermark = %report.watermark_after,
                    "Run completed"
                );
                RunOutcome::Success
            }
            Err(e) => {
                debug!(feed = %self.feed, state = %RunState::Failed, failed_in = %e.state(), "Run state");
                if e.is_cancelled() {
                    RunOutcome::Cancelled
                } else {
                    RunOutcome::Failed
                }
            }
        };
        emit!(RunCompleted {
            feed: self.feed.to_string(),
            outcome,
            duration: started.elapsed(),
        });

        result
    }

    async fn execute(&self, shutdown: &CancellationToken) -> Result<RunReport, IngestError> {
        let feed = self.feed.id();
        let table = self.source.table();

        let mut state = self.enter(RunState::Start);
        let stored = self
            .guard(shutdown, state, self.checkpoints.get(&self.feed))
            .await?
            .context(CheckpointSnafu { feed, state })?;
        let watermark = match stored {
            Some(checkpoint) => checkpoint.timestamp,
            None => {
                let initial = Utc::now()
                    .checked_sub_signed(self.initial_lookback)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                info!(feed = %self.feed, watermark = %initial, "No checkpoint, starting from lookback");
                initial
            }
        };
        let mut report = RunReport::new(self.feed.clone(), watermark);

        state = self.enter(RunState::SchemaReady);
        let shape = self.source.schema();
        self.guard(shutdown, state, self.sink.migrate_schema(table, &shape))
            .await?
            .context(SinkSnafu { feed, state })?;

        let mut max_observed: Option<DateTime<Utc>> = None;
        let mut pages = self.source.fetch(watermark);
        loop {
            state = self.enter(RunState::Fetching);
            let page = match self.guard(shutdown, state, pages.next()).await? {
                Some(page) => page.context(FeedSnafu { feed, state })?,
                None => break,
            };
            report.pages += 1;
            report.seen += page.len();
            emit!(PageFetched {
                feed: self.feed.to_string(),
                records: page.len() as u64,
            });

            self.enter(RunState::Filtering);
            let has_next = page.has_next();
            let filtered = filter_records(page.records, watermark);
            max_observed = max_observed.max(filtered.max_observed);
            report.kept += filtered.rows.len();
            emit!(RecordsKept {
                feed: self.feed.to_string(),
                count: filtered.rows.len() as u64,
            });
            debug!(
                feed = %self.feed,
                page = report.pages,
                kept = filtered.rows.len(),
                has_next,
                "Filtered page"
            );

            if filtered.rows.is_empty() {
                continue;
            }

            state = self.enter(RunState::Writing);
            let inserted = self
                .guard(
                    shutdown,
                    state,
                    self.sink.insert(table, &filtered.rows, shutdown),
                )
                .await?
                .context(SinkSnafu { feed, state })?;
            report.inserted += inserted;
            emit!(RecordsInserted {
                feed: self.feed.to_string(),
                count: inserted as u64,
            });
        }

        state = self.enter(RunState::CheckpointAdvance);
        match max_observed {
            Some(newest) if newest > watermark => {
                let checkpoint = Checkpoint::new(table, newest, Utc::now());
                self.guard(shutdown, state, self.checkpoints.put(&self.feed, checkpoint))
                    .await?
                    .context(CheckpointSnafu { feed, state })?;
                report.watermark_after = newest;
                emit!(CheckpointAdvanced {
                    feed: self.feed.to_string(),
                    watermark: newest.timestamp(),
                });
            }
            _ => debug!(feed = %self.feed, "Nothing newer than the watermark, checkpoint unchanged"),
        }

        self.enter(RunState::Done);
        Ok(report)
    }

    fn enter(&self, state: RunState) -> RunState {
        debug!(feed = %self.feed, state = %state, "Run state");
        state
    }

    /// Race `future` against shutdown.
    async fn guard<T>(
        &self,
        shutdown: &CancellationToken,
        state: RunState,
        future: impl Future<Output = T>,
    ) -> Result<T, IngestError> {
        shutdown.run_until_cancelled(future).await.ok_or_else(|| {
            info!(feed = %self.feed, state = %state, "Run cancelled");
            IngestError::Cancelled {
                feed: self.feed.to_string(),
                state,
            }
        })
    }
}
