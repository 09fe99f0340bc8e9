//! Prometheus metrics for projection runners.
//!
//! Runners record through [`ProjectionMetrics`] whether or not an exporter is
//! installed; without a recorder the `metrics` macros are no-ops.
//!
//! # Example
//!
//! ```rust,no_run
//! use projector_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Metrics available at http://localhost:9090/metrics
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install metrics exporter
    #[error("Failed to install metrics exporter: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Install the global recorder and spawn the HTTP listener.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or installed.
    /// An already installed recorder is not an error; it is logged and kept.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[
                    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
                ],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        match metrics::set_global_recorder(recorder) {
            Ok(()) => {
                let addr = self.addr;
                tokio::spawn(async move {
                    if exporter.await.is_err() {
                        tracing::error!(addr = %addr, "Metrics listener stopped");
                    }
                });
                self.handle = Some(handle);
                tracing::info!(
                    addr = %self.addr,
                    "Metrics server started - available at http://{}/metrics",
                    self.addr
                );
                Ok(())
            }
            Err(e) => {
                let err_msg = e.to_string();
                if err_msg.contains("already initialized") {
                    tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
                    Ok(())
                } else {
                    Err(MetricsError::Install(err_msg))
                }
            }
        }
    }

    /// Render current metrics in Prometheus format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "projection_events_applied_total",
        "Total number of events applied to projection tables"
    );
    describe_counter!(
        "projection_events_deferred_total",
        "Total number of events deferred because a dependency was not projected yet"
    );
    describe_counter!(
        "projection_failures_total",
        "Total number of failed runner passes"
    );
    describe_histogram!(
        "projection_batch_duration_seconds",
        "Time taken to reduce and apply one batch"
    );
    describe_gauge!(
        "projection_checkpoint_sequence",
        "Sequence of the last applied event per projection and instance"
    );
}

/// Projection runner metrics recorder.
pub struct ProjectionMetrics;

impl ProjectionMetrics {
    /// Record a committed batch.
    pub fn record_batch(projection: &'static str, events: usize, duration: Duration) {
        counter!("projection_events_applied_total", "projection" => projection)
            .increment(u64::try_from(events).unwrap_or(u64::MAX));
        histogram!("projection_batch_duration_seconds", "projection" => projection)
            .record(duration.as_secs_f64());
    }

    /// Record a deferred event.
    pub fn record_deferred(projection: &'static str) {
        counter!("projection_events_deferred_total", "projection" => projection).increment(1);
    }

    /// Record a failed pass.
    pub fn record_failure(projection: &'static str) {
        counter!("projection_failures_total", "projection" => projection).increment(1);
    }

    /// Record the checkpoint reached for one instance.
    #[allow(clippy::cast_precision_loss)] // gauges are f64
    pub fn record_checkpoint(projection: &'static str, instance_id: &str, sequence: u64) {
        gauge!(
            "projection_checkpoint_sequence",
            "projection" => projection,
            "instance_id" => instance_id.to_string()
        )
        .set(sequence as f64);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn server_starts_and_renders_projection_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();

        ProjectionMetrics::record_batch("members", 3, Duration::from_millis(20));
        ProjectionMetrics::record_deferred("members");
        ProjectionMetrics::record_checkpoint("members", "instance-1", 42);

        // Another test may have installed the recorder first.
        if let Some(rendered) = server.render() {
            assert!(rendered.contains("projection_events_applied_total"));
            assert!(rendered.contains("projection_checkpoint_sequence"));
        }
    }

    #[test]
    fn recording_without_recorder_is_harmless() {
        ProjectionMetrics::record_failure("members");
    }
}
