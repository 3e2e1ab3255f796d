//! Internal events shared by all drover components.
//!
//! Each event struct represents a measurable occurrence. Events implement
//! `InternalEvent`, which records the corresponding Prometheus metric.
//! Metrics carry a `target` label naming the component they belong to.

use metrics::{counter, histogram};
use std::time::Duration;
use tracing::trace;

/// Trait for internal events that can be emitted as metrics.
pub trait InternalEvent {
    /// Emit this event as a metric.
    fn emit(self);
}

/// Outcome of one polling iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationResultType {
    Processed,
    NoItems,
    Failed,
}

impl IterationResultType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IterationResultType::Processed => "processed",
            IterationResultType::NoItems => "no_items",
            IterationResultType::Failed => "failed",
        }
    }
}

/// Event emitted when a polling iteration finishes.
pub struct IterationCompleted {
    pub result: IterationResultType,
    pub target: String,
}

impl InternalEvent for IterationCompleted {
    fn emit(self) {
        trace!(result = self.result.as_str(), target = %self.target, "Iteration completed");
        counter!(
            "drover_iterations_total",
            "result" => self.result.as_str(),
            "target" => self.target
        )
        .increment(1);
    }
}

/// Event emitted with the wall time of a polling iteration.
pub struct IterationDuration {
    pub duration: Duration,
    pub target: String,
}

impl InternalEvent for IterationDuration {
    fn emit(self) {
        trace!(
            duration_ms = self.duration.as_millis(),
            target = %self.target,
            "Iteration duration"
        );
        histogram!("drover_iteration_duration_seconds", "target" => self.target)
            .record(self.duration.as_secs_f64());
    }
}
