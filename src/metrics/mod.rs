//! Prometheus metrics module
//!
//! Installs the global recorder and registers metric descriptions. The
//! orchestrator, monitor and registry record through the `metrics` macros;
//! without an installed recorder (library tests) those are no-ops.

use metrics::{counter, describe_counter, describe_gauge, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;

/// Orchestrator metrics collector
#[derive(Clone)]
pub struct OrchestratorMetrics {
    handle: Arc<PrometheusHandle>,
}

impl OrchestratorMetrics {
    /// Initialize metrics and return handle
    pub fn new() -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("Failed to install Prometheus recorder");

        Self::register_metrics();

        Self {
            handle: Arc::new(handle),
        }
    }

    fn register_metrics() {
        describe_counter!(
            "orchestrator_respawns_total",
            Unit::Count,
            "Workers re-entered Pending by the respawn policy"
        );
        describe_counter!(
            "orchestrator_workers_failed_total",
            Unit::Count,
            "Workers terminally failed (respawn disabled or retries exhausted)"
        );
        describe_counter!(
            "orchestrator_heartbeat_missed_total",
            Unit::Count,
            "Workers declared lost by the heartbeat monitor"
        );
        describe_counter!(
            "orchestrator_handshake_rejected_total",
            Unit::Count,
            "Remote connections closed during handshake"
        );
        describe_counter!(
            "orchestrator_errors_total",
            Unit::Count,
            "Startup-level orchestrator errors"
        );

        describe_gauge!(
            "orchestrator_workers_ready",
            Unit::Count,
            "Workers in the Ready state"
        );
        describe_gauge!(
            "orchestrator_workers_total",
            Unit::Count,
            "Workers in the shard plan"
        );
        describe_gauge!(
            "orchestrator_last_heartbeat_ms",
            Unit::Milliseconds,
            "Epoch milliseconds of each worker's latest heartbeat"
        );
    }

    /// Record a startup-level error by taxonomy label.
    pub fn record_error(&self, error_type: &'static str) {
        counter!("orchestrator_errors_total", "error_type" => error_type).increment(1);
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

impl Default for OrchestratorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
