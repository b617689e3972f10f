use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use forge_scheduler::{AdmissionReport, SweepReport};

use crate::state::AppState;

/// Liveness sweep: count missed heartbeats, fail over offline nodes, time out runs.
pub async fn sweep_loop(st: AppState, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(interval_secs = interval.as_secs(), "sweep loop started");

    loop {
        ticker.tick().await;
        let report = sweep_once(&st).await;
        if report.capacity_changed() {
            st.request_admission();
        }
    }
}

pub async fn sweep_once(st: &AppState) -> SweepReport {
    st.metrics.sweep_total.fetch_add(1, Ordering::Relaxed);
    let report = st.cluster.lock().await.sweep(Instant::now());
    st.metrics.record_report(&report);

    if !report.transitions.is_empty() || !report.timed_out.is_empty() {
        info!(
            transitions = report.transitions.len(),
            requeued = report.requeued.len(),
            failed = report.failed.len(),
            timed_out = report.timed_out.len(),
            "sweep applied changes"
        );
    }
    report
}

/// Admission: woken by mutating handlers, with a periodic fallback tick.
pub async fn admission_loop(st: AppState, fallback: Duration) {
    info!(fallback_secs = fallback.as_secs(), "admission loop started");

    loop {
        tokio::select! {
            _ = st.admission.notified() => {}
            _ = tokio::time::sleep(fallback) => {}
        }
        admit_once(&st).await;
    }
}

pub async fn admit_once(st: &AppState) -> AdmissionReport {
    st.metrics
        .admission_passes_total
        .fetch_add(1, Ordering::Relaxed);
    let report = st.cluster.lock().await.admit(Instant::now());

    st.metrics
        .runs_admitted_total
        .fetch_add(report.admitted.len() as u64, Ordering::Relaxed);
    if report.admitted.is_empty() && report.unschedulable.is_empty() {
        debug!("admission pass placed nothing");
    } else {
        info!(
            admitted = report.admitted.len(),
            unschedulable = report.unschedulable.len(),
            rolled_back = report.rolled_back,
            "admission pass"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::auth::AuthConfig;
    use forge_common::{NodeSpec, Recipe, RunLaunch, RunStatus};
    use forge_scheduler::{Cluster, SchedulerConfig};

    fn state() -> AppState {
        AppState::new(
            Cluster::new(SchedulerConfig::default()),
            AuthConfig::disabled(),
        )
    }

    #[tokio::test]
    async fn admit_once_places_queued_runs_and_counts() {
        let st = state();
        let run = {
            let mut c = st.cluster.lock().await;
            c.register_node(
                NodeSpec {
                    node_id: "node-01".into(),
                    gpu_count: 8,
                    gpu_type: "H100".into(),
                    spot: false,
                },
                Instant::now(),
            )
            .unwrap();
            let dataset_id = c
                .register_dataset(
                    serde_json::from_value(serde_json::json!({
                        "name": "alpaca",
                        "source_path": "s3://data/alpaca.jsonl"
                    }))
                    .unwrap(),
                )
                .unwrap()
                .id;
            c.submit_run(RunLaunch {
                name: "sft".into(),
                base_model: "llama-3-8b".into(),
                dataset_id,
                recipe: Recipe::LoraSft,
                config_overrides: Default::default(),
                gpu_count: 2,
                priority: 0,
                tags: vec![],
                max_retries: None,
            })
            .unwrap()
        };

        let report = admit_once(&st).await;
        assert_eq!(report.admitted.len(), 1);
        assert_eq!(st.metrics.runs_admitted_total.load(Ordering::Relaxed), 1);
        assert_eq!(
            st.cluster.lock().await.run(&run.id).unwrap().status,
            RunStatus::Running
        );
    }

    #[tokio::test]
    async fn sweep_once_counts_iterations() {
        let st = state();
        let report = sweep_once(&st).await;
        assert!(!report.capacity_changed());
        assert_eq!(st.metrics.sweep_total.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn notify_wakes_admission_loop() {
        let st = state();
        let handle = tokio::spawn(admission_loop(st.clone(), Duration::from_secs(3600)));

        st.request_admission();
        for _ in 0..50 {
            if st.metrics.admission_passes_total.load(Ordering::Relaxed) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(st.metrics.admission_passes_total.load(Ordering::Relaxed) >= 1);
        handle.abort();
    }
}
