//! Interval-driven polling loop used by watch mode.

use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::emit;
use crate::metrics::events::{IterationCompleted, IterationDuration, IterationResultType};
use crate::topology::random_jitter;

/// Result of a single processing iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IterationResult {
    /// Items were processed successfully.
    ProcessedItems,
    /// No items were available to process.
    NoItems,
    /// Shutdown was requested.
    Shutdown,
}

/// A unit of work the polling loop calls once per interval.
#[async_trait]
pub trait PollingProcessor: Send {
    /// The error type for this processor.
    type Error: std::error::Error + Send;

    /// Run one iteration. `cold_start` is true on the first call only.
    async fn poll(&mut self, cold_start: bool) -> Result<IterationResult, Self::Error>;
}

/// Options controlling the polling loop.
#[derive(Debug, Clone, Copy)]
pub struct PollingOptions {
    pub poll_interval: Duration,
    pub poll_jitter_secs: u64,
    /// Consecutive failed iterations tolerated before giving up (0 = never give up).
    pub max_failures: usize,
}

/// Run `processor` every `poll_interval` (plus jitter) until shutdown.
///
/// A failed iteration is logged and retried on the next tick. Once
/// `max_failures` consecutive iterations have failed the last error is
/// returned.
///
/// An iteration in progress is not raced against `shutdown`: the processor
/// observes the token itself, so it can report how the interrupted
/// iteration ended.
pub async fn run_polling_loop<P: PollingProcessor>(
    processor: &mut P,
    options: PollingOptions,
    shutdown: CancellationToken,
    name: &str,
) -> Result<(), P::Error> {
    let mut cold_start = true;
    let mut consecutive_failures = 0usize;

    loop {
        if shutdown.is_cancelled() {
            info!(target = name, "Shutdown requested before iteration");
            break;
        }
        let iteration_start = Instant::now();

        let outcome = processor.poll(cold_start).await;
        cold_start = false;

        let result_type = match outcome {
            Ok(IterationResult::Shutdown) => break,
            Err(_) if shutdown.is_cancelled() => break,
            Ok(IterationResult::ProcessedItems) => {
                consecutive_failures = 0;
                IterationResultType::Processed
            }
            Ok(IterationResult::NoItems) => {
                consecutive_failures = 0;
                IterationResultType::NoItems
            }
            Err(e) => {
                consecutive_failures += 1;
                error!(
                    target = name,
                    error = %e,
                    consecutive_failures,
                    "Iteration failed"
                );
                emit!(IterationCompleted {
                    result: IterationResultType::Failed,
                    target: name.to_string(),
                });
                if options.max_failures > 0 && consecutive_failures >= options.max_failures {
                    return Err(e);
                }
                IterationResultType::Failed
            }
        };

        if result_type != IterationResultType::Failed {
            emit!(IterationCompleted {
                result: result_type,
                target: name.to_string(),
            });
        }
        emit!(IterationDuration {
            duration: iteration_start.elapsed(),
            target: name.to_string(),
        });

        let sleep_duration = options.poll_interval + random_jitter(options.poll_jitter_secs);
        debug!(
            target = name,
            "Waiting {}s before next poll",
            sleep_duration.as_secs()
        );
        if shutdown
            .run_until_cancelled(tokio::time::sleep(sleep_duration))
            .await
            .is_none()
        {
            info!(target = name, "Shutdown requested during poll wait");
            break;
        }
    }

    Ok(())
}
