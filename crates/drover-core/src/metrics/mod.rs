//! Metrics infrastructure.
//!
//! - `events`: the `InternalEvent` trait and events shared by every component
//! - `init_global`: one-time Prometheus recorder installation

pub mod events;

use metrics_exporter_prometheus::PrometheusBuilder;
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::OnceLock;
use tracing::info;

use crate::error::{AlreadyInitializedSnafu, MetricsError, PrometheusInitSnafu};

/// Histogram buckets for duration metrics (in seconds).
const DURATION_BUCKETS: &[f64] = &[
    0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

static INSTALLED: OnceLock<SocketAddr> = OnceLock::new();

/// Install the Prometheus recorder and serve `/metrics` on `addr`.
///
/// Must be called from within a tokio runtime. Without this call every
/// `emit!` is still valid, it just records into the no-op recorder.
pub fn init_global(addr: SocketAddr) -> Result<(), MetricsError> {
    ensure!(INSTALLED.set(addr).is_ok(), AlreadyInitializedSnafu);

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .set_buckets(DURATION_BUCKETS)
        .context(PrometheusInitSnafu)?
        .install()
        .context(PrometheusInitSnafu)?;

    info!(%addr, "Metrics endpoint started");
    Ok(())
}

/// Macro for emitting metric events.
///
/// Calls `InternalEvent::emit()` on the given event, which records the
/// corresponding metric.
///
/// # Example
///
/// ```ignore
/// use drover_core::emit;
/// use drover_core::metrics::events::{IterationCompleted, IterationResultType};
///
/// emit!(IterationCompleted {
///     result: IterationResultType::Processed,
///     target: "otx-subscribed".to_string(),
/// });
/// ```
#[macro_export]
macro_rules! emit {
    ($event:expr) => {
        $crate::metrics::events::InternalEvent::emit($event)
    };
}
