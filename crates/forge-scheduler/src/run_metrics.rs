use dashmap::DashMap;

use forge_common::RunMetricPoint;

use crate::error::{Result, SchedulerError};

/// Per-run training metric series, readable without the cluster lock.
#[derive(Debug)]
pub struct RunMetricsStore {
    series: DashMap<String, Vec<RunMetricPoint>>,
    max_points: usize,
}

impl RunMetricsStore {
    pub fn new(max_points: usize) -> Self {
        Self {
            series: DashMap::new(),
            max_points: max_points.max(1),
        }
    }

    /// Start an empty series; done when the run is submitted.
    pub fn open(&self, run_id: &str) {
        self.series.entry(run_id.to_string()).or_default();
    }

    /// Insert keeping step order. A re-reported step replaces the earlier point.
    pub fn record(&self, run_id: &str, point: RunMetricPoint) -> Result<()> {
        if !point.loss.is_finite() || !point.learning_rate.is_finite() {
            return Err(SchedulerError::InvalidRequest(format!(
                "step {} has a non-finite loss or learning rate",
                point.step
            )));
        }

        let mut series = self
            .series
            .get_mut(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))?;

        match series.binary_search_by_key(&point.step, |p| p.step) {
            Ok(i) => series[i] = point,
            Err(i) => series.insert(i, point),
        }
        if series.len() > self.max_points {
            let excess = series.len() - self.max_points;
            series.drain(..excess);
        }
        Ok(())
    }

    /// The whole series, or only its last `last_n` points.
    pub fn series(&self, run_id: &str, last_n: Option<usize>) -> Result<Vec<RunMetricPoint>> {
        let series = self
            .series
            .get(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))?;

        let skip = last_n.map_or(0, |n| series.len().saturating_sub(n));
        Ok(series[skip..].to_vec())
    }

    /// Drop a run's series once the run itself is no longer retained.
    pub fn remove(&self, run_id: &str) {
        self.series.remove(run_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn point(step: u64, loss: f64) -> RunMetricPoint {
        RunMetricPoint {
            step,
            loss,
            learning_rate: 2e-4,
            epoch: step as f64 / 100.0,
            gpu_memory_mb: None,
            throughput_samples_sec: None,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn keeps_step_order_and_replaces_duplicates() {
        let store = RunMetricsStore::new(100);
        store.open("r1");
        for step in [30, 10, 20] {
            store.record("r1", point(step, 1.0)).unwrap();
        }
        store.record("r1", point(20, 0.5)).unwrap();

        let series = store.series("r1", None).unwrap();
        assert_eq!(
            series.iter().map(|p| p.step).collect::<Vec<_>>(),
            vec![10, 20, 30]
        );
        assert_eq!(series[1].loss, 0.5);
    }

    #[test]
    fn removed_series_is_gone() {
        let store = RunMetricsStore::new(5);
        store.open("r1");
        store.record("r1", point(1, 1.0)).unwrap();
        store.remove("r1");
        assert!(store.series("r1", None).is_err());
        assert!(store.record("r1", point(2, 1.0)).is_err());
    }

    #[test]
    fn last_n_returns_tail() {
        let store = RunMetricsStore::new(100);
        store.open("r1");
        for step in 0..10 {
            store.record("r1", point(step, 1.0)).unwrap();
        }
        let tail = store.series("r1", Some(3)).unwrap();
        assert_eq!(
            tail.iter().map(|p| p.step).collect::<Vec<_>>(),
            vec![7, 8, 9]
        );
        assert_eq!(store.series("r1", Some(50)).unwrap().len(), 10);
    }

    #[test]
    fn bounded_per_run() {
        let store = RunMetricsStore::new(5);
        store.open("r1");
        for step in 0..8 {
            store.record("r1", point(step, 1.0)).unwrap();
        }
        let series = store.series("r1", None).unwrap();
        assert_eq!(series.len(), 5);
        assert_eq!(series[0].step, 3);
    }

    #[test]
    fn unknown_run_is_rejected() {
        let store = RunMetricsStore::new(5);
        assert_eq!(
            store.record("nope", point(1, 1.0)).unwrap_err(),
            SchedulerError::RunNotFound("nope".into())
        );
        assert!(store.series("nope", None).is_err());
    }

    #[test]
    fn rejects_nan_loss() {
        let store = RunMetricsStore::new(5);
        store.open("r1");
        assert!(matches!(
            store.record("r1", point(1, f64::NAN)),
            Err(SchedulerError::InvalidRequest(_))
        ));
    }
}
