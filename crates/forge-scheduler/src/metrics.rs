use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::State;
use axum::response::IntoResponse;

use forge_scheduler::SweepReport;

use crate::state::AppState;

/// Counters bumped by the background loops, safe for concurrent access.
#[derive(Debug, Default)]
pub struct SharedMetrics {
    /// Liveness/timeout sweep iterations.
    pub sweep_total: AtomicU64,
    /// Admission passes, event driven or periodic.
    pub admission_passes_total: AtomicU64,
    pub runs_admitted_total: AtomicU64,
    pub runs_requeued_total: AtomicU64,
    /// Runs that ran out of retries.
    pub runs_failed_total: AtomicU64,
    pub runs_timed_out_total: AtomicU64,
    pub nodes_offline_total: AtomicU64,
}

impl SharedMetrics {
    /// Count the offline transitions and run outcomes of a sweep, heartbeat or failure report.
    pub fn record_report(&self, report: &SweepReport) {
        let offline = report.transitions.iter().filter(|t| t.went_offline()).count();
        self.nodes_offline_total
            .fetch_add(offline as u64, Ordering::Relaxed);
        self.runs_requeued_total
            .fetch_add(report.requeued.len() as u64, Ordering::Relaxed);
        self.runs_failed_total
            .fetch_add(report.failed.len() as u64, Ordering::Relaxed);
        self.runs_timed_out_total
            .fetch_add(report.timed_out.len() as u64, Ordering::Relaxed);
    }
}

fn write_metric(out: &mut String, name: &str, kind: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(out, "# HELP forge_scheduler_{name} {help}");
    let _ = writeln!(out, "# TYPE forge_scheduler_{name} {kind}");
    let _ = writeln!(out, "forge_scheduler_{name} {value}");
}

/// GET /metrics: Prometheus text exposition format.
pub async fn metrics_handler(State(st): State<AppState>) -> impl IntoResponse {
    let summary = st.cluster.lock().await.summary();
    let m = &st.metrics;
    let mut body = String::new();

    for (name, help, counter) in [
        ("sweep_total", "Liveness sweep iterations.", &m.sweep_total),
        ("admission_passes_total", "Admission passes.", &m.admission_passes_total),
        ("runs_admitted_total", "Runs placed on a node.", &m.runs_admitted_total),
        ("runs_requeued_total", "Runs sent back to the queue after a failure.", &m.runs_requeued_total),
        ("runs_failed_total", "Runs failed after exhausting retries.", &m.runs_failed_total),
        ("runs_timed_out_total", "Runs stopped for exceeding the run timeout.", &m.runs_timed_out_total),
        ("nodes_offline_total", "Node transitions to offline.", &m.nodes_offline_total),
    ] {
        write_metric(&mut body, name, "counter", help, counter.load(Ordering::Relaxed));
    }

    write_metric(&mut body, "nodes_healthy", "gauge", "Healthy nodes.", summary.healthy);
    write_metric(&mut body, "nodes_degraded", "gauge", "Degraded nodes.", summary.degraded);
    write_metric(&mut body, "nodes_offline", "gauge", "Offline nodes.", summary.offline);
    write_metric(&mut body, "gpus_total", "gauge", "GPUs across registered nodes.", summary.total_gpus);
    write_metric(&mut body, "gpus_available", "gauge", "Free GPUs on healthy nodes.", summary.available_gpus);
    write_metric(&mut body, "runs_running", "gauge", "Runs currently running.", summary.running_runs);
    write_metric(&mut body, "runs_pending", "gauge", "Runs waiting in the queue.", summary.pending_runs);
    write_metric(&mut body, "burn_rate_per_hour", "gauge", "Current spend per hour.", summary.burn_rate_per_hour);
    write_metric(&mut body, "feed_events", "gauge", "Events retained in the feed.", st.feed.len());

    (axum::http::StatusCode::OK, body)
}

/// GET /healthz: liveness check.
pub async fn healthz_handler() -> impl IntoResponse {
    (axum::http::StatusCode::OK, "ok")
}
