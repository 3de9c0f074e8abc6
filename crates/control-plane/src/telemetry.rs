//! Tracing setup and Prometheus metrics for the control plane.

#![allow(clippy::cast_precision_loss)]

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Initialize the tracing subscriber. `LOG_FORMAT=json` selects JSON output.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());

    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    let result = if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if let Err(error) = result {
        eprintln!("tracing subscriber already installed: {error}");
    }
}

/// Install the Prometheus recorder and return the handle used by `GET /metrics`.
pub fn init_metrics() -> Option<PrometheusHandle> {
    match PrometheusBuilder::new().install_recorder() {
        Ok(handle) => Some(handle),
        Err(error) => {
            tracing::warn!("Failed to install Prometheus recorder: {error}");
            None
        }
    }
}

/// Set the number of pending jobs in a queue.
pub fn queue_depth(queue: &str, depth: u64) {
    gauge!("cp_job_queue_depth", "queue" => queue.to_string()).set(depth as f64);
}

/// Set the age of the oldest pending job in a queue.
pub fn queue_oldest_age(queue: &str, age_seconds: f64) {
    gauge!("cp_job_queue_oldest_age_seconds", "queue" => queue.to_string()).set(age_seconds);
}

/// Record a job being rescheduled after a retryable failure.
pub fn job_retried(queue: &str) {
    counter!("cp_job_retries_total", "queue" => queue.to_string()).increment(1);
}

/// Record a job reaching a final state.
pub fn job_finished(queue: &str, outcome: &str, duration_ms: u64) {
    counter!("cp_jobs_total", "queue" => queue.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    histogram!("cp_job_duration_ms", "queue" => queue.to_string()).record(duration_ms as f64);
}

/// Record a deployment ending in a terminal state.
pub fn deployment_finished(status: &str) {
    counter!("cp_deployments_total", "status" => status.to_string()).increment(1);
}

/// Record an extension execution ending and how many steps it ran.
pub fn extension_finished(status: &str, steps: usize) {
    counter!("cp_extension_executions_total", "status" => status.to_string()).increment(1);
    histogram!("cp_extension_steps").record(steps as f64);
}

/// Record a health probe outcome.
pub fn probe_finished(kind: &str, ok: bool, latency_ms: u64) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("cp_probes_total", "kind" => kind.to_string(), "outcome" => outcome).increment(1);
    histogram!("cp_probe_latency_ms", "kind" => kind.to_string()).record(latency_ms as f64);
}

/// Adjust the count of open websocket connections.
pub fn websocket_connections(endpoint: &'static str, delta: f64) {
    gauge!("cp_websocket_connections", "endpoint" => endpoint).increment(delta);
}

/// Record a proxy reload.
pub fn proxy_reloaded(ok: bool) {
    let outcome = if ok { "ok" } else { "failed" };
    counter!("cp_proxy_reloads_total", "outcome" => outcome).increment(1);
}

/// Record one served HTTP request.
pub fn http_request(handler: &'static str, status: u16, latency_ms: u64) {
    counter!("cp_http_requests_total", "handler" => handler, "status" => status.to_string()).increment(1);
    histogram!("cp_http_request_duration_ms", "handler" => handler).record(latency_ms as f64);
}
