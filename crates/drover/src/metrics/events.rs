//! Internal events for ingestion metrics.
//!
//! ## Labels
//!
//! Run-level metrics carry a `feed` label (e.g. `"otx-subscribed"`), sink
//! metrics a `table` label.

use drover_core::metrics::events::InternalEvent;
use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::trace;

// ============================================================================
// Fetch events
// ============================================================================

/// Event emitted for every page a feed source returns.
pub struct PageFetched {
    pub feed: String,
    pub records: u64,
}

impl InternalEvent for PageFetched {
    fn emit(self) {
        trace!(feed = %self.feed, records = self.records, "Page fetched");
        counter!("drover_pages_fetched_total", "feed" => self.feed.clone()).increment(1);
        counter!("drover_records_fetched_total", "feed" => self.feed).increment(self.records);
    }
}

/// Event emitted with the number of records newer than the watermark.
pub struct RecordsKept {
    pub feed: String,
    pub count: u64,
}

impl InternalEvent for RecordsKept {
    fn emit(self) {
        trace!(feed = %self.feed, count = self.count, "Records kept");
        counter!("drover_records_kept_total", "feed" => self.feed).increment(self.count);
    }
}

// ============================================================================
// Sink events
// ============================================================================

/// Event emitted when rows land in a table.
pub struct RecordsInserted {
    pub feed: String,
    pub count: u64,
}

impl InternalEvent for RecordsInserted {
    fn emit(self) {
        trace!(feed = %self.feed, count = self.count, "Records inserted");
        counter!("drover_records_inserted_total", "feed" => self.feed).increment(self.count);
    }
}

/// Event emitted when an insert is retried because the table is not visible.
pub struct InsertRetried {
    pub table: String,
}

impl InternalEvent for InsertRetried {
    fn emit(self) {
        counter!("drover_insert_retries_total", "table" => self.table).increment(1);
    }
}

/// Event emitted when an insert gives up after its last attempt.
pub struct RetriesExhausted {
    pub table: String,
}

impl InternalEvent for RetriesExhausted {
    fn emit(self) {
        trace!(table = %self.table, "Insert retries exhausted");
        counter!("drover_insert_retries_exhausted_total", "table" => self.table).increment(1);
    }
}

// ============================================================================
// Run events
// ============================================================================

/// Event emitted when a feed's watermark moves forward.
pub struct CheckpointAdvanced {
    pub feed: String,
    /// New watermark as Unix seconds.
    pub watermark: i64,
}

impl InternalEvent for CheckpointAdvanced {
    fn emit(self) {
        trace!(feed = %self.feed, watermark = self.watermark, "Checkpoint advanced");
        gauge!("drover_watermark_seconds", "feed" => self.feed).set(self.watermark as f64);
    }
}

/// How an ingestion run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    Failed,
    Cancelled,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Failed => "failed",
            RunOutcome::Cancelled => "cancelled",
        }
    }
}

/// Event emitted at the end of every ingestion run.
pub struct RunCompleted {
    pub feed: String,
    pub outcome: RunOutcome,
    pub duration: Duration,
}

impl InternalEvent for RunCompleted {
    fn emit(self) {
        trace!(
            feed = %self.feed,
            outcome = self.outcome.as_str(),
            duration_ms = self.duration.as_millis(),
            "Run completed"
        );
        counter!(
            "drover_runs_total",
            "feed" => self.feed.clone(),
            "outcome" => self.outcome.as_str()
        )
        .increment(1);
        histogram!("drover_run_duration_seconds", "feed" => self.feed)
            .record(self.duration.as_secs_f64());
    }
}
