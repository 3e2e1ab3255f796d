//! Pipeline orchestration primitives.
//!
//! Runs every configured pipeline as its own task with a shared shutdown
//! token, optional global concurrency limit and jittered starts, then reports
//! how each one ended.

use std::fmt::Display;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use snafu::ResultExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::GlobalConfig;
use crate::error::{AddressParseSnafu, MetricsSnafu, PipelineSetupError};
use crate::signal::cancel_on_signal;

/// Whether pipelines run a single pass or keep polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Run every pipeline once and exit.
    #[default]
    Once,
    /// Re-run each pipeline on its poll interval until shutdown.
    Watch,
}

/// Shared resources for pipeline execution.
#[derive(Clone)]
pub struct PipelineContext {
    /// Optional global semaphore bounding concurrently executing runs.
    pub global_semaphore: Option<Arc<Semaphore>>,
    /// Maximum jitter in seconds to add to poll intervals.
    pub poll_jitter_secs: u64,
    /// Single pass or watch mode.
    pub mode: RunMode,
    /// Cancellation token for graceful shutdown.
    pub shutdown: CancellationToken,
}

impl PipelineContext {
    /// Create a new pipeline context.
    pub fn new(
        max_concurrent_runs: Option<usize>,
        poll_jitter_secs: u64,
        mode: RunMode,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            global_semaphore: max_concurrent_runs.map(|n| Arc::new(Semaphore::new(n.max(1)))),
            poll_jitter_secs,
            mode,
            shutdown,
        }
    }
}

/// A self-contained pipeline unit that can be executed.
pub trait Pipeline: Send + 'static {
    /// The key type used to identify this pipeline.
    type Key: Clone + Display + Send + 'static;

    /// The error type returned by this pipeline.
    type Error: std::error::Error + Send + 'static;

    /// Get a reference to the pipeline's key.
    fn key(&self) -> &Self::Key;

    /// Run this pipeline to completion.
    fn run(self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Whether an error only reports that shutdown interrupted the pipeline.
    fn is_cancellation(_error: &Self::Error) -> bool {
        false
    }
}

/// How every pipeline in one runner invocation ended.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Keys of pipelines that finished without error.
    pub completed: Vec<String>,
    /// Keys and error messages of pipelines that failed or panicked.
    pub failed: Vec<(String, String)>,
    /// Keys of pipelines interrupted by shutdown.
    pub cancelled: Vec<String>,
}

impl RunSummary {
    /// True when nothing failed and nothing was interrupted.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.cancelled.is_empty()
    }
}

/// Orchestrates multiple pipeline executions with shared shutdown handling.
pub struct PipelineRunner<P: Pipeline> {
    pipelines: Vec<P>,
    shutdown: CancellationToken,
    poll_jitter_secs: u64,
    typetag: &'static str,
}

impl<P: Pipeline> PipelineRunner<P> {
    /// Create a new pipeline runner.
    pub fn new(
        pipelines: Vec<P>,
        shutdown: CancellationToken,
        poll_jitter_secs: u64,
        typetag: &'static str,
    ) -> Self {
        Self {
            pipelines,
            shutdown,
            poll_jitter_secs,
            typetag,
        }
    }

    /// Run all pipelines to completion.
    #[allow(clippy::type_complexity)]
    pub async fn run(self) -> RunSummary {
        let mut handles: JoinSet<(String, Result<(), P::Error>, bool)> = JoinSet::new();
        let typetag = self.typetag;

        for pipeline in self.pipelines {
            let shutdown = self.shutdown.clone();
            let key = pipeline.key().to_string();
            let start_jitter = random_jitter(self.poll_jitter_secs);

            handles.spawn(async move {
                if !start_jitter.is_zero() {
                    info!(
                        target = %key,
                        jitter_secs = start_jitter.as_secs(),
                        "Delaying {} start for jitter", typetag
                    );
                    if shutdown
                        .run_until_cancelled(tokio::time::sleep(start_jitter))
                        .await
                        .is_none()
                    {
                        info!(target = %key, "Shutdown requested during jitter delay");
                        return (key, Ok(()), true);
                    }
                }

                let result = pipeline.run().await;
                (key, result, false)
            });
        }

        info!("Spawned {} {} tasks", handles.len(), typetag);

        let mut summary = RunSummary::default();
        while let Some(joined) = handles.join_next().await {
            match joined {
                Ok((key, _, true)) => summary.cancelled.push(key),
                Ok((key, Ok(()), false)) => {
                    info!(target = %key, "{} completed", typetag);
                    summary.completed.push(key);
                }
                Ok((key, Err(e), false)) if P::is_cancellation(&e) => {
                    warn!(target = %key, error = %e, "{} cancelled", typetag);
                    summary.cancelled.push(key);
                }
                Ok((key, Err(e), false)) => {
                    error!(target = %key, error = %e, "{} failed", typetag);
                    summary.failed.push((key, e.to_string()));
                }
                Err(e) => {
                    error!(error = %e, "{} task panicked", typetag);
                    summary.failed.push(("<unknown>".to_string(), e.to_string()));
                }
            }
        }

        info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            cancelled = summary.cancelled.len(),
            "All {}s finished", typetag
        );
        summary
    }
}

/// Run pipelines with shared setup logic.
///
/// 1. Start the metrics endpoint if an address is configured
/// 2. Create the shutdown token (cancelled on SIGINT/SIGTERM/SIGQUIT)
/// 3. Build pipelines through `create_pipelines`
/// 4. Run them all and collect the summary
pub async fn run_pipelines<P, F, Fut>(
    metrics_address: Option<&str>,
    global: &GlobalConfig,
    mode: RunMode,
    typetag: &'static str,
    create_pipelines: F,
) -> Result<RunSummary, PipelineSetupError>
where
    P: Pipeline,
    F: FnOnce(PipelineContext) -> Fut,
    Fut: Future<Output = Result<Vec<P>, PipelineSetupError>>,
{
    if let Some(address) = metrics_address {
        let addr: SocketAddr = address.parse().context(AddressParseSnafu)?;
        crate::init_metrics(addr).context(MetricsSnafu)?;
    }

    let shutdown = CancellationToken::new();
    let context = PipelineContext::new(
        global.max_concurrent_runs,
        global.poll_jitter_secs,
        mode,
        shutdown.clone(),
    );

    let pipelines = create_pipelines(context).await?;

    let signals = cancel_on_signal(shutdown.clone());
    let summary = PipelineRunner::new(pipelines, shutdown, global.poll_jitter_secs, typetag)
        .run()
        .await;
    signals.abort();

    Ok(summary)
}

/// Generate a random jitter duration up to the specified maximum seconds.
pub fn random_jitter(max_secs: u64) -> Duration {
    if max_secs > 0 {
        Duration::from_millis(rand::rng().random_range(0..max_secs * 1000))
    } else {
        Duration::ZERO
    }
}
