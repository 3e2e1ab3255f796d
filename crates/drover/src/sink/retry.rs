//! Backoff for inserts racing table creation.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use drover_core::emit;

use crate::error::SinkError;
use crate::metrics::events::{InsertRetried, RetriesExhausted};

const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_MAX_ATTEMPTS: u32 = 12;

/// Capped exponential backoff.
///
/// Every transient failure is followed by a wait that starts at
/// `initial_delay` and doubles each time. After `max_attempts` failures the
/// operation has waited `initial_delay * (2^max_attempts - 1)` in total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    initial_delay: Duration,
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS)
    }
}

impl RetryPolicy {
    /// At least one attempt is always made.
    pub fn new(initial_delay: Duration, max_attempts: u32) -> Self {
        Self {
            initial_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Wait after the `attempt`-th failure (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_delay.saturating_mul(factor)
    }

    /// Total time spent waiting when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (1..=self.max_attempts)
            .map(|attempt| self.delay_after(attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Run `operation` until it succeeds, fails permanently, or attempts run out.
    ///
    /// Only `SinkError::is_transient` failures are retried. Waits are
    /// abandoned as soon as `shutdown` is cancelled.
    pub async fn run<T, F, Fut>(
        &self,
        table: &str,
        shutdown: &CancellationToken,
        mut operation: F,
    ) -> Result<T, SinkError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, SinkError>>,
    {
        for attempt in 1..=self.max_attempts {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() => e,
                Err(e) => return Err(e),
            };

            let delay = self.delay_after(attempt);
            warn!(
                table,
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Table not visible yet, backing off"
            );
            emit!(InsertRetried {
                table: table.to_string(),
            });

            if shutdown
                .run_until_cancelled(tokio::time::sleep(delay))
                .await
                .is_none()
            {
                return Err(SinkError::InsertCancelled {
                    table: table.to_string(),
                    attempts: attempt,
                });
            }
        }

        emit!(RetriesExhausted {
            table: table.to_string(),
        });
        Err(SinkError::RetriesExhausted {
            table: table.to_string(),
            attempts: self.max_attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn not_found() -> SinkError {
        SinkError::TableNotFound {
            table: "t".to_string(),
        }
    }

    #[test]
    fn test_delays_double() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 4);
        assert_eq!(policy.delay_after(1), Duration::from_millis(100));
        assert_eq!(policy.delay_after(2), Duration::from_millis(200));
        assert_eq!(policy.delay_after(4), Duration::from_millis(800));
        assert_eq!(policy.total_backoff(), Duration::from_millis(1500));
    }

    #[test]
    fn test_at_least_one_attempt() {
        assert_eq!(RetryPolicy::new(Duration::ZERO, 0).max_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_after_exact_attempts() {
        let policy = RetryPolicy::new(Duration::from_millis(100), 12);
        let calls = AtomicU32::new(0);
        let counter = &calls;
        let started = Instant::now();

        let result: Result<(), _> = policy
            .run("t", &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(not_found())
            })
            .await;

        assert!(matches!(
            result,
            Err(SinkError::RetriesExhausted { attempts: 12, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        assert!(started.elapsed() >= Duration::from_millis(100 * ((1 << 12) - 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let inserted = policy
            .run("t", &CancellationToken::new(), move || async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(not_found())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(inserted, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_not_retried() {
        let policy = RetryPolicy::default();
        let calls = AtomicU32::new(0);
        let counter = &calls;

        let result: Result<(), _> = policy
            .run("t", &CancellationToken::new(), move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(SinkError::SchemaConflict {
                    table: "t".to_string(),
                })
            })
            .await;

        assert!(matches!(result, Err(SinkError::SchemaConflict { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let policy = RetryPolicy::new(Duration::from_secs(3600), 5);
        let shutdown = CancellationToken::new();
        let canceller = shutdown.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let started = Instant::now();
        let result: Result<(), _> = policy
            .run("t", &shutdown, || async { Err(not_found()) })
            .await;

        assert!(matches!(
            result,
            Err(SinkError::InsertCancelled { attempts: 1, .. })
        ));
        assert!(started.elapsed() < Duration::from_secs(3600));
    }
}
