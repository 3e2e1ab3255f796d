//! Error types for the drover ingester.
//!
//! Each layer attaches the context it knows (feed, table, URL, attempt
//! count) and the orchestrator wraps everything in `IngestError`, which
//! records the run state that failed and maps to an `ErrorCategory`.

use snafu::prelude::*;
use std::fmt;

pub use drover_core::error::{ConfigError, StorageError};

use crate::ingest::RunState;

/// Errors from the checkpoint store.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CheckpointError {
    /// Reading the stored checkpoint failed.
    #[snafu(display("Failed to read checkpoint for '{feed}': {source}"))]
    CheckpointRead {
        feed: String,
        source: object_store::Error,
    },

    /// Writing the checkpoint failed.
    #[snafu(display("Failed to write checkpoint for '{feed}': {source}"))]
    CheckpointWrite {
        feed: String,
        source: object_store::Error,
    },

    /// The stored checkpoint is not valid JSON of the expected shape.
    #[snafu(display("Stored checkpoint for '{feed}' is corrupt: {source}"))]
    CheckpointDecode {
        feed: String,
        source: serde_json::Error,
    },

    /// The checkpoint could not be serialized.
    #[snafu(display("Failed to encode checkpoint for '{feed}': {source}"))]
    CheckpointEncode {
        feed: String,
        source: serde_json::Error,
    },

    /// Concurrent writers kept winning the compare-and-swap.
    #[snafu(display("Checkpoint for '{feed}' still contended after {attempts} attempts"))]
    Contended { feed: String, attempts: usize },
}

/// Errors from schema comparison and evolution.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SchemaError {
    /// Schema is incompatible with the table schema.
    #[snafu(display("Incompatible schema: {details}"))]
    IncompatibleSchema { details: String },

    /// Type change not allowed (would be narrowing).
    #[snafu(display("Type change not allowed for field '{field}': {from} -> {to}"))]
    TypeChangeNotAllowed {
        field: String,
        from: String,
        to: String,
    },

    /// Cannot add a required (non-nullable) field.
    #[snafu(display("Cannot add required field '{field_name}' to existing table"))]
    RequiredFieldAddition { field_name: String },
}

/// Errors from the table sink.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SinkError {
    /// The table does not exist, or is not yet visible after creation.
    #[snafu(display("Table '{table}' not found"))]
    TableNotFound { table: String },

    /// Another writer created the table first.
    #[snafu(display("Table '{table}' already exists"))]
    TableExists { table: String },

    /// The table schema changed underneath a schema update.
    #[snafu(display("Schema of table '{table}' was modified concurrently"))]
    SchemaConflict { table: String },

    /// Every insert attempt hit a transient failure.
    #[snafu(display("Insert into '{table}' failed: exceeded retry limit of {attempts} attempts"))]
    RetriesExhausted { table: String, attempts: u32 },

    /// Shutdown interrupted the retry loop.
    #[snafu(display("Insert into '{table}' cancelled after {attempts} attempt(s)"))]
    InsertCancelled { table: String, attempts: u32 },

    /// The incoming shape cannot be reconciled with the table.
    #[snafu(display("Schema evolution for '{table}' rejected: {source}"))]
    Evolution { table: String, source: SchemaError },

    /// Backing object store failure.
    #[snafu(display("Storage error on table '{table}': {source}"))]
    TableStorage {
        table: String,
        source: object_store::Error,
    },

    /// The schema manifest could not be read or written.
    #[snafu(display("Invalid schema manifest for '{table}': {source}"))]
    Manifest {
        table: String,
        source: serde_json::Error,
    },

    /// Rows do not fit the table schema.
    #[snafu(display("Rows rejected by table '{table}': {source}"))]
    Encode {
        table: String,
        source: arrow::error::ArrowError,
    },

    /// Parquet encoding failed.
    #[snafu(display("Failed to write parquet for '{table}': {source}"))]
    Parquet {
        table: String,
        source: parquet::errors::ParquetError,
    },
}

impl SinkError {
    /// The only failure class the insert retry loop is allowed to retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::TableNotFound { .. })
    }
}

/// Errors from feed sources.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum FeedError {
    /// The HTTP client could not be constructed.
    #[snafu(display("Failed to build HTTP client: {source}"))]
    Client { source: reqwest::Error },

    /// A configured or derived URL is invalid.
    #[snafu(display("Invalid feed URL '{url}': {source}"))]
    InvalidUrl {
        url: String,
        source: url::ParseError,
    },

    /// The request failed in transit (connect, timeout, reset).
    #[snafu(display("Request to {url} failed: {source}"))]
    Request { url: String, source: reqwest::Error },

    /// The server answered with a non-success status.
    #[snafu(display("Request to {url} returned status {status}"))]
    Status { url: String, status: u16 },

    /// The response body is not the expected JSON document.
    #[snafu(display("Malformed response from {url}: {source}"))]
    Decode {
        url: String,
        source: serde_json::Error,
    },

    /// A record carries a timestamp that cannot be parsed.
    #[snafu(display("Record {record}: cannot parse {field} '{value}': {source}"))]
    EventTime {
        record: String,
        field: &'static str,
        value: String,
        source: chrono::ParseError,
    },

    /// A parsed record could not be turned into a row.
    #[snafu(display("Failed to encode record {record}: {source}"))]
    Row {
        record: String,
        source: serde_json::Error,
    },
}

impl FeedError {
    /// Network-level failures and server-side overload, as opposed to bad data.
    pub fn is_transient(&self) -> bool {
        match self {
            FeedError::Request { .. } => true,
            FeedError::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Coarse failure classes surfaced to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Network or sink visibility problems; rerunning later is expected to work.
    TransientInfrastructure,
    /// Unparseable or malformed feed data; rerunning will fail the same way.
    DataIntegrity,
    /// The checkpoint store could not be read or written.
    BackingStoreUnavailable,
    /// The sink refused the data or the schema.
    SinkRejected,
    /// Shutdown interrupted the run.
    Cancelled,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::TransientInfrastructure => "transient-infrastructure",
            ErrorCategory::DataIntegrity => "data-integrity",
            ErrorCategory::BackingStoreUnavailable => "backing-store-unavailable",
            ErrorCategory::SinkRejected => "sink-rejected",
            ErrorCategory::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed ingestion run.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum IngestError {
    #[snafu(display("Feed '{feed}' failed in {state} [backing-store-unavailable]: {source}"))]
    Checkpoint {
        feed: String,
        state: RunState,
        source: CheckpointError,
    },

    #[snafu(display("Feed '{feed}' failed in {state} [{}]: {source}", sink_category(source)))]
    Sink {
        feed: String,
        state: RunState,
        source: SinkError,
    },

    #[snafu(display("Feed '{feed}' failed in {state} [{}]: {source}", feed_category(source)))]
    Feed {
        feed: String,
        state: RunState,
        source: FeedError,
    },

    #[snafu(display("Feed '{feed}' cancelled in {state}"))]
    Cancelled { feed: String, state: RunState },

    /// Runs failed while the feed was being watched; `state` and `category`
    /// describe the most recent failure.
    #[snafu(display("Feed '{feed}' failed {failures} run(s) while watching [{category}], last in {state}: {last}"))]
    WatchFailed {
        feed: String,
        failures: usize,
        state: RunState,
        category: ErrorCategory,
        last: String,
    },
}

impl IngestError {
    /// Operator-facing failure class.
    pub fn category(&self) -> ErrorCategory {
        match self {
            IngestError::Checkpoint { .. } => ErrorCategory::BackingStoreUnavailable,
            IngestError::Sink { source, .. } => sink_category(source),
            IngestError::Feed { source, .. } => feed_category(source),
            IngestError::Cancelled { .. } => ErrorCategory::Cancelled,
            IngestError::WatchFailed { category, .. } => *category,
        }
    }

    /// The feed whose run failed.
    pub fn feed(&self) -> &str {
        match self {
            IngestError::Checkpoint { feed, .. }
            | IngestError::Sink { feed, .. }
            | IngestError::Feed { feed, .. }
            | IngestError::Cancelled { feed, .. }
            | IngestError::WatchFailed { feed, .. } => feed,
        }
    }

    /// The run state the orchestrator was in when the error occurred.
    pub fn state(&self) -> RunState {
        match self {
            IngestError::Checkpoint { state, .. }
            | IngestError::Sink { state, .. }
            | IngestError::Feed { state, .. }
            | IngestError::Cancelled { state, .. }
            | IngestError::WatchFailed { state, .. } => *state,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.category() == ErrorCategory::Cancelled
    }
}

fn sink_category(error: &SinkError) -> ErrorCategory {
    match error {
        SinkError::TableNotFound { .. }
        | SinkError::RetriesExhausted { .. }
        | SinkError::TableStorage { .. } => ErrorCategory::TransientInfrastructure,
        SinkError::InsertCancelled { .. } => ErrorCategory::Cancelled,
        _ => ErrorCategory::SinkRejected,
    }
}

fn feed_category(error: &FeedError) -> ErrorCategory {
    if error.is_transient() {
        ErrorCategory::TransientInfrastructure
    } else {
        ErrorCategory::DataIntegrity
    }
}
