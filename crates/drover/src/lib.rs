//! drover: incremental threat-intelligence feed ingestion.
//!
//! This crate handles:
//! - Fetching pages from upstream feeds (AlienVault OTX, abuse.ch Feodo Tracker)
//! - Filtering records against a per-feed watermark so reruns import nothing twice
//! - Landing new records in tables on object storage, with schema evolution and
//!   retries while freshly created tables become visible
//! - Advancing the watermark in a checkpoint store once a run has written everything

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod feed;
pub mod ingest;
pub mod metrics;
pub mod schema;
pub mod sink;

pub use checkpoint::{Checkpoint, CheckpointStore, CheckpointStoreRef};
pub use config::{Config, FeedKey};
pub use error::{ErrorCategory, IngestError};
pub use feed::{FeedRecord, FeedSource, Page};
pub use ingest::{FeedPipeline, Ingestion, RunReport, RunState};
pub use sink::{RetryPolicy, TableSink, TableStore};

pub use drover_core::{Application, CliArgs, PipelineContext, RunMode, StorageProvider};
