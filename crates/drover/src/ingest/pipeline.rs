//! Feed pipelines for the core runner.
//!
//! A `FeedPipeline` owns one feed's `Ingestion`. In single-pass mode it runs
//! it once; in watch mode it hands itself to the core polling loop and runs
//! every `poll_interval` until shutdown. A watched feed that failed any run,
//! or was stopped in the middle of one, still ends with an error so the
//! process exit code reflects it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::SemaphorePermit;
use tracing::info;

use drover_core::{
    IterationResult, Pipeline, PipelineContext, PipelineSetupError, PollingOptions,
    PollingProcessor, RunMode, StorageProvider, run_polling_loop,
};

use super::{Ingestion, RunReport, RunState};
use crate::checkpoint::open_store;
use crate::config::{Config, FeedKey};
use crate::error::{ErrorCategory, IngestError};
use crate::feed::build_source;
use crate::sink::{ObjectTableStore, TableSink, TableStoreRef};

/// One feed, ready to run.
pub struct FeedPipeline {
    key: FeedKey,
    ingestion: Ingestion,
    context: PipelineContext,
    poll_interval: Duration,
    max_failures: usize,
    watch: WatchOutcome,
}

/// What happened across the runs of a watched feed.
#[derive(Debug, Default)]
struct WatchOutcome {
    failures: usize,
    last_failure: Option<(RunState, ErrorCategory, String)>,
    interrupted: Option<IngestError>,
}

impl FeedPipeline {
    pub fn new(
        ingestion: Ingestion,
        context: PipelineContext,
        poll_interval: Duration,
        max_failures: usize,
    ) -> Self {
        Self {
            key: ingestion.feed().clone(),
            ingestion,
            context,
            poll_interval,
            max_failures,
            watch: WatchOutcome::default(),
        }
    }

    /// Run the feed once, holding a global permit if runs are limited.
    pub async fn run_once(&self) -> Result<RunReport, IngestError> {
        let _permit = self.acquire_permit().await?;
        self.ingestion.run(&self.context.shutdown).await
    }

    async fn acquire_permit(&self) -> Result<Option<SemaphorePermit<'_>>, IngestError> {
        let Some(semaphore) = &self.context.global_semaphore else {
            return Ok(None);
        };

        match self
            .context
            .shutdown
            .run_until_cancelled(semaphore.acquire())
            .await
        {
            Some(permit) => Ok(permit.ok()),
            None => Err(IngestError::Cancelled {
                feed: self.key.to_string(),
                state: RunState::Start,
            }),
        }
    }
}

impl Pipeline for FeedPipeline {
    type Key = FeedKey;
    type Error = IngestError;

    fn key(&self) -> &FeedKey {
        &self.key
    }

    async fn run(mut self) -> Result<(), IngestError> {
        match self.context.mode {
            RunMode::Once => self.run_once().await.map(|_| ()),
            RunMode::Watch => {
                let options = PollingOptions {
                    poll_interval: self.poll_interval,
                    poll_jitter_secs: self.context.poll_jitter_secs,
                    max_failures: self.max_failures,
                };
                let shutdown = self.context.shutdown.clone();
                let name = self.key.to_string();

                info!(
                    feed = %self.key,
                    poll_interval_secs = self.poll_interval.as_secs(),
                    "Watching feed"
                );
                run_polling_loop(&mut self, options, shutdown, &name).await?;
                self.finish_watch()
            }
        }
    }

    fn is_cancellation(error: &IngestError) -> bool {
        error.is_cancelled()
    }
}

#[async_trait]
impl PollingProcessor for FeedPipeline {
    type Error = IngestError;

    async fn poll(&mut self, _cold_start: bool) -> Result<IterationResult, IngestError> {
        match self.run_once().await {
            Ok(report) if report.inserted > 0 || report.advanced() => {
                Ok(IterationResult::ProcessedItems)
            }
            Ok(_) => Ok(IterationResult::NoItems),
            Err(e) if e.is_cancelled() => {
                self.watch.interrupted = Some(e);
                Ok(IterationResult::Shutdown)
            }
            Err(e) => {
                self.watch.failures += 1;
                self.watch.last_failure = Some((e.state(), e.category(), e.to_string()));
                Err(e)
            }
        }
    }
}

impl FeedPipeline {
    /// Outcome of a watch session that ended on shutdown.
    fn finish_watch(self) -> Result<(), IngestError> {
        let WatchOutcome {
            failures,
            last_failure,
            interrupted,
        } = self.watch;

        if let Some((state, category, last)) = last_failure {
            return Err(IngestError::WatchFailed {
                feed: self.key.to_string(),
                failures,
                state,
                category,
                last,
            });
        }
        match interrupted {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Build one pipeline per configured feed.
///
/// All feeds share one checkpoint store and one table sink.
pub fn build_pipelines(
    config: &Config,
    context: PipelineContext,
) -> Result<Vec<FeedPipeline>, PipelineSetupError> {
    let (Some(checkpoint), Some(sink)) = (&config.checkpoint, &config.sink) else {
        return Err(setup_error(
            "configuration",
            "checkpoint and sink sections are required",
        ));
    };

    let checkpoint_storage = StorageProvider::for_url_with_options(
        &checkpoint.url,
        checkpoint.storage_options.clone(),
    )
    .map_err(|e| setup_error("checkpoint store", e))?;
    let checkpoints = open_store(checkpoint_storage);

    let sink_storage =
        StorageProvider::for_url_with_options(&sink.url, sink.storage_options.clone())
            .map_err(|e| setup_error("table sink", e))?;
    let tables: TableStoreRef = Arc::new(ObjectTableStore::new(sink_storage));
    let table_sink = TableSink::new(tables, sink.retry.into(), sink.schema_evolution);

    config
        .feeds()
        .map(|(key, feed)| -> Result<FeedPipeline, PipelineSetupError> {
            let source = build_source(feed).map_err(|e| setup_error(&format!("feed '{key}'"), e))?;
            let ingestion = Ingestion::new(
                key.clone(),
                source,
                table_sink.clone(),
                Arc::clone(&checkpoints),
                feed.initial_lookback(),
            );
            Ok(FeedPipeline::new(
                ingestion,
                context.clone(),
                feed.poll_interval(),
                feed.max_failures,
            ))
        })
        .collect()
}

fn setup_error(
    component: &str,
    source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> PipelineSetupError {
    PipelineSetupError::Build {
        component: component.to_string(),
        source: source.into(),
    }
}
