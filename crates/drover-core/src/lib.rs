//! drover-core: shared plumbing for the drover feed ingester.
//!
//! Nothing in here knows about threat-intelligence feeds. The crate provides:
//!
//! - `config/` - Multi-file YAML loading, environment interpolation and CLI arguments
//! - `storage` - Object store construction from URLs (S3, GCS, Azure, local, memory)
//! - `metrics/` - Prometheus recorder bootstrap and the `InternalEvent` pattern
//! - `topology` - Running several pipelines concurrently with shared shutdown
//! - `polling` - Interval-driven loop for long-running (watch) mode
//! - `signal` - Signal handling for graceful shutdown
//! - `app` - Application lifecycle that reduces main.rs to a single call

pub mod app;
pub mod config;
pub mod error;
pub mod metrics;
pub mod polling;
pub mod signal;
pub mod storage;
pub mod topology;
pub mod tracing;

pub use app::{AppConfig, Application};
pub use config::{CliArgs, ComponentKey, GlobalConfig, MetricsConfig};
pub use error::{ConfigError, MetricsError, PipelineSetupError, StorageError};
pub use metrics::init_global as init_metrics;
pub use polling::{IterationResult, PollingOptions, PollingProcessor, run_polling_loop};
pub use signal::shutdown_signal;
pub use storage::{StorageProvider, StorageProviderRef};
pub use topology::{
    Pipeline, PipelineContext, PipelineRunner, RunMode, RunSummary, random_jitter, run_pipelines,
};
pub use tracing::init_tracing;
