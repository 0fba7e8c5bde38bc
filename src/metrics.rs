use anyhow::{Context, Result};
use axum::{http::StatusCode, response::IntoResponse, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    CounterVec, Encoder, Gauge, HistogramOpts, HistogramVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric name prefix for all scheduler metrics
const PREFIX: &str = "recheck";

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // Check cycles
    pub static ref CHECK_CYCLES_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_check_cycles_total"), "Check cycles by outcome"),
        &["outcome"]
    ).expect("Failed to create check_cycles_total metric");

    pub static ref CHECK_INTERVAL_SECONDS: Gauge = Gauge::new(
        format!("{PREFIX}_check_interval_seconds"),
        "Current delay between check cycles"
    ).expect("Failed to create check_interval_seconds metric");

    // Task executions
    pub static ref TASK_EXECUTIONS_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_task_executions_total"), "Task executions by type and status"),
        &["task_type", "status"]
    ).expect("Failed to create task_executions_total metric");

    pub static ref TASK_EXECUTION_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            format!("{PREFIX}_task_execution_duration_seconds"),
            "Task execution duration in seconds"
        )
        .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 30.0, 60.0, 300.0]),
        &["task_type"]
    ).expect("Failed to create task_execution_duration_seconds metric");

    pub static ref TASKS_SKIPPED_TOTAL: CounterVec = CounterVec::new(
        Opts::new(format!("{PREFIX}_tasks_skipped_total"), "Due tasks skipped because already leased"),
        &["task_type"]
    ).expect("Failed to create tasks_skipped_total metric");

    pub static ref ACTIVE_EXECUTIONS: IntGauge = IntGauge::new(
        format!("{PREFIX}_active_executions"),
        "Executions currently in flight"
    ).expect("Failed to create active_executions metric");

    // Leadership
    pub static ref IS_LEADER: IntGauge = IntGauge::new(
        format!("{PREFIX}_is_leader"),
        "1 if this process holds the leader lock"
    ).expect("Failed to create is_leader metric");
}

/// Register all metrics. Safe to call more than once.
pub fn init_metrics() {
    let _ = REGISTRY.register(Box::new(CHECK_CYCLES_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(CHECK_INTERVAL_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASK_EXECUTIONS_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(TASK_EXECUTION_DURATION_SECONDS.clone()));
    let _ = REGISTRY.register(Box::new(TASKS_SKIPPED_TOTAL.clone()));
    let _ = REGISTRY.register(Box::new(ACTIVE_EXECUTIONS.clone()));
    let _ = REGISTRY.register(Box::new(IS_LEADER.clone()));

    tracing::info!("Metrics system initialized successfully");
}

pub fn record_check_cycle(outcome: &str) {
    CHECK_CYCLES_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_check_interval(interval: Duration) {
    CHECK_INTERVAL_SECONDS.set(interval.as_secs_f64());
}

pub fn record_task_execution(task_type: &str, status: &str, duration: Duration) {
    TASK_EXECUTIONS_TOTAL
        .with_label_values(&[task_type, status])
        .inc();
    TASK_EXECUTION_DURATION_SECONDS
        .with_label_values(&[task_type])
        .observe(duration.as_secs_f64());
}

pub fn record_task_skipped(task_type: &str) {
    TASKS_SKIPPED_TOTAL.with_label_values(&[task_type]).inc();
}

pub fn set_active_executions(count: usize) {
    ACTIVE_EXECUTIONS.set(count as i64);
}

pub fn set_is_leader(is_leader: bool) {
    IS_LEADER.set(is_leader as i64);
}

/// Handler for the /metrics endpoint
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = vec![];
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => {
            let response = String::from_utf8(buffer).unwrap_or_else(|_| String::from(""));
            (StatusCode::OK, response)
        }
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

/// Serve `/metrics` until `shutdown` is cancelled.
pub async fn serve_metrics(port: u16, shutdown: CancellationToken) -> Result<()> {
    let app = Router::new().route("/metrics", get(metrics_handler));
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("Failed to bind metrics port {}", port))?;
    info!("Metrics available at port {}", port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("Metrics server failed")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_initialization() {
        init_metrics();

        let metric_families = REGISTRY.gather();
        assert!(!metric_families.is_empty(), "Metrics should be registered");
    }

    #[test]
    fn test_record_task_execution() {
        init_metrics();

        record_task_execution("audit", "success", Duration::from_millis(50));
        record_task_execution("audit", "failed", Duration::from_millis(10));

        let count = TASK_EXECUTIONS_TOTAL
            .with_label_values(&["audit", "success"])
            .get();
        assert!(count >= 1.0);
        let metrics = REGISTRY.gather();
        assert!(metrics
            .iter()
            .any(|m| m.get_name() == "recheck_task_executions_total"));
    }

    #[tokio::test]
    async fn test_metrics_handler_encodes_registry() {
        init_metrics();
        record_check_cycle("completed");

        let response = metrics_handler().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
