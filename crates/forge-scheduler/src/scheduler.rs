//! Run lifecycle: `pending → running → {completed, failed, cancelled}`, with
//! failures and node interruptions sent back to `pending` until the retry
//! budget is spent.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use forge_common::{Recipe, RunLaunch, RunRecord, RunStatus};

use crate::error::{Result, SchedulerError};
use crate::queue::RunQueue;

#[derive(Debug, Clone)]
struct RunEntry {
    record: RunRecord,
    seq: u64,
    started: Option<Instant>,
}

/// What happened to a running run that failed or lost its node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Requeued { retry_count: u32 },
    Exhausted { retry_count: u32, message: String },
}

#[derive(Debug)]
pub struct RunScheduler {
    runs: HashMap<String, RunEntry>,
    queue: RunQueue,
    next_seq: u64,
    max_concurrent_runs: usize,
    running: usize,
    /// Terminal runs, oldest first.
    terminal: VecDeque<String>,
    max_terminal_runs: usize,
}

impl RunScheduler {
    pub fn new(max_concurrent_runs: usize, max_terminal_runs: usize) -> Self {
        Self {
            runs: HashMap::new(),
            queue: RunQueue::new(),
            next_seq: 0,
            max_concurrent_runs,
            running: 0,
            terminal: VecDeque::new(),
            max_terminal_runs: max_terminal_runs.max(1),
        }
    }

    pub fn submit(&mut self, launch: RunLaunch, default_max_retries: u32) -> Result<RunRecord> {
        for (field, value) in [
            ("name", &launch.name),
            ("base_model", &launch.base_model),
            ("dataset_id", &launch.dataset_id),
        ] {
            if value.trim().is_empty() {
                return Err(SchedulerError::InvalidRequest(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if launch.gpu_count == 0 {
            return Err(SchedulerError::InvalidRequest(
                "gpu_count must be at least 1".into(),
            ));
        }

        let record = RunRecord {
            id: Uuid::new_v4().to_string(),
            name: launch.name,
            base_model: launch.base_model,
            dataset_id: launch.dataset_id,
            recipe: launch.recipe,
            config: launch.recipe.resolve_config(&launch.config_overrides),
            tags: launch.tags,
            gpu_count: launch.gpu_count,
            priority: launch.priority,
            status: RunStatus::Pending,
            assigned_node: None,
            retry_count: 0,
            max_retries: launch.max_retries.unwrap_or(default_max_retries),
            unschedulable: false,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        };

        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(&record.id, record.priority, seq);

        info!(run_id=%record.id, name=%record.name, recipe=%record.recipe, gpus=record.gpu_count, priority=record.priority, "run submitted");
        self.runs.insert(
            record.id.clone(),
            RunEntry {
                record: record.clone(),
                seq,
                started: None,
            },
        );
        Ok(record)
    }

    pub fn get(&self, run_id: &str) -> Result<&RunRecord> {
        self.runs
            .get(run_id)
            .map(|e| &e.record)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))
    }

    /// Newest first, optionally filtered by status and recipe.
    pub fn list(&self, status: Option<RunStatus>, recipe: Option<Recipe>) -> Vec<&RunRecord> {
        let mut entries: Vec<&RunEntry> = self
            .runs
            .values()
            .filter(|e| status.map_or(true, |s| e.record.status == s))
            .filter(|e| recipe.map_or(true, |r| e.record.recipe == r))
            .collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries.into_iter().map(|e| &e.record).collect()
    }

    /// Queued runs in admission order with their GPU request.
    pub fn pending_in_order(&self) -> Vec<(String, u32)> {
        self.queue
            .iter()
            .filter_map(|id| self.runs.get(id))
            .map(|e| (e.record.id.clone(), e.record.gpu_count))
            .collect()
    }

    /// Retained runs of any status that were launched against the dataset.
    pub fn dataset_references(&self, dataset_id: &str) -> usize {
        self.runs
            .values()
            .filter(|e| e.record.dataset_id == dataset_id)
            .count()
    }

    /// Drop the oldest terminal runs beyond the retention cap and return their ids.
    pub fn prune_terminal(&mut self) -> Vec<String> {
        let mut dropped = Vec::new();
        while self.terminal.len() > self.max_terminal_runs {
            let Some(run_id) = self.terminal.pop_front() else {
                break;
            };
            self.runs.remove(&run_id);
            dropped.push(run_id);
        }
        if !dropped.is_empty() {
            debug!(dropped = dropped.len(), "pruned terminal runs");
        }
        dropped
    }

    pub fn has_capacity(&self) -> bool {
        self.running < self.max_concurrent_runs
    }

    pub fn running_count(&self) -> usize {
        self.running
    }

    pub fn pending_count(&self) -> usize {
        self.queue.len()
    }

    pub fn running_runs(&self) -> impl Iterator<Item = &RunRecord> + '_ {
        self.runs
            .values()
            .map(|e| &e.record)
            .filter(|r| r.status == RunStatus::Running)
    }

    /// Returns true when the flag actually changed.
    pub fn set_unschedulable(&mut self, run_id: &str, flagged: bool) -> bool {
        match self.runs.get_mut(run_id) {
            Some(e) if e.record.unschedulable != flagged => {
                e.record.unschedulable = flagged;
                true
            }
            _ => false,
        }
    }

    /// Bind a placement. Fails if the run stopped being pending in the meantime.
    pub fn start(&mut self, run_id: &str, node_id: &str, now: Instant) -> Result<()> {
        let entry = self.entry_mut(run_id)?;
        if entry.record.status != RunStatus::Pending {
            return Err(invalid(&entry.record, "start"));
        }

        entry.record.status = RunStatus::Running;
        entry.record.assigned_node = Some(node_id.to_string());
        entry.record.unschedulable = false;
        entry.record.started_at = Some(Utc::now());
        entry.started = Some(now);
        self.queue.remove(run_id);
        self.running += 1;

        info!(run_id, node_id, "run started");
        Ok(())
    }

    /// Returns the node the run was holding.
    pub fn complete(&mut self, run_id: &str) -> Result<Option<String>> {
        let entry = self.entry_mut(run_id)?;
        if entry.record.status != RunStatus::Running {
            return Err(invalid(&entry.record, "complete"));
        }

        entry.record.status = RunStatus::Completed;
        entry.record.completed_at = Some(Utc::now());
        entry.started = None;
        let node = entry.record.assigned_node.take();
        self.running -= 1;
        self.terminal.push_back(run_id.to_string());

        info!(run_id, "run completed");
        Ok(node)
    }

    /// The node agent reported the run failed.
    pub fn fail(&mut self, run_id: &str, reason: &str) -> Result<FailureOutcome> {
        self.stop_and_retry(run_id, reason, "fail")
    }

    /// The run's node went offline or the run overran its timeout.
    pub fn interrupt(&mut self, run_id: &str, reason: &str) -> Result<FailureOutcome> {
        self.stop_and_retry(run_id, reason, "interrupt")
    }

    /// Returns the node the run was holding if it was running.
    pub fn cancel(&mut self, run_id: &str) -> Result<Option<String>> {
        let entry = self.entry_mut(run_id)?;
        let was = entry.record.status;
        if was.is_terminal() {
            return Err(invalid(&entry.record, "cancel"));
        }

        entry.record.status = RunStatus::Cancelled;
        entry.record.completed_at = Some(Utc::now());
        entry.started = None;
        let node = entry.record.assigned_node.take();

        match was {
            RunStatus::Running => self.running -= 1,
            _ => {
                self.queue.remove(run_id);
            }
        }
        self.terminal.push_back(run_id.to_string());

        info!(run_id, was=%was, "run cancelled");
        Ok(node)
    }

    /// Running runs started longer than `timeout` ago.
    pub fn timed_out(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.runs
            .values()
            .filter(|e| e.record.status == RunStatus::Running)
            .filter(|e| {
                e.started
                    .is_some_and(|t| now.saturating_duration_since(t) > timeout)
            })
            .map(|e| e.record.id.clone())
            .collect()
    }

    fn stop_and_retry(
        &mut self,
        run_id: &str,
        reason: &str,
        action: &'static str,
    ) -> Result<FailureOutcome> {
        let entry = self.entry_mut(run_id)?;
        if entry.record.status != RunStatus::Running {
            return Err(invalid(&entry.record, action));
        }

        entry.record.assigned_node = None;
        entry.started = None;

        let outcome = if entry.record.retry_count < entry.record.max_retries {
            entry.record.retry_count += 1;
            entry.record.status = RunStatus::Pending;
            entry.record.error_message = Some(reason.to_string());
            let (priority, seq) = (entry.record.priority, entry.seq);
            let retry_count = entry.record.retry_count;

            self.queue.push(run_id, priority, seq);
            warn!(run_id, reason, retry_count, "run requeued");
            FailureOutcome::Requeued { retry_count }
        } else {
            let message = SchedulerError::RetriesExhausted {
                run_id: run_id.to_string(),
                retries: entry.record.retry_count,
                reason: reason.to_string(),
            }
            .to_string();
            entry.record.status = RunStatus::Failed;
            entry.record.completed_at = Some(Utc::now());
            entry.record.error_message = Some(message.clone());
            let retry_count = entry.record.retry_count;

            warn!(run_id, reason, retry_count, "run failed permanently");
            FailureOutcome::Exhausted {
                retry_count,
                message,
            }
        };

        self.running -= 1;
        if matches!(outcome, FailureOutcome::Exhausted { .. }) {
            self.terminal.push_back(run_id.to_string());
        }
        Ok(outcome)
    }

    /// Overwrite a status while leaving the queue alone.
    #[cfg(test)]
    pub(crate) fn force_status(&mut self, run_id: &str, status: RunStatus) {
        if let Some(e) = self.runs.get_mut(run_id) {
            e.record.status = status;
        }
    }

    fn entry_mut(&mut self, run_id: &str) -> Result<&mut RunEntry> {
        self.runs
            .get_mut(run_id)
            .ok_or_else(|| SchedulerError::RunNotFound(run_id.to_string()))
    }
}

fn invalid(record: &RunRecord, action: &'static str) -> SchedulerError {
    SchedulerError::InvalidTransition {
        run_id: record.id.clone(),
        status: record.status.to_string(),
        action,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::Recipe;

    fn launch(name: &str, gpus: u32, priority: i32) -> RunLaunch {
        RunLaunch {
            name: name.to_string(),
            base_model: "llama-3-8b".to_string(),
            dataset_id: "ds-1".to_string(),
            recipe: Recipe::LoraSft,
            config_overrides: Default::default(),
            gpu_count: gpus,
            priority,
            tags: vec![],
            max_retries: None,
        }
    }

    #[test]
    fn submit_queues_in_priority_order() {
        let mut s = RunScheduler::new(4, 100);
        let a = s.submit(launch("a", 1, 5), 3).unwrap();
        let b = s.submit(launch("b", 2, 0), 3).unwrap();
        let c = s.submit(launch("c", 1, 5), 3).unwrap();

        let order: Vec<_> = s.pending_in_order().into_iter().map(|(id, _)| id).collect();
        assert_eq!(order, vec![b.id.clone(), a.id.clone(), c.id.clone()]);
        assert_eq!(s.get(&a.id).unwrap().max_retries, 3);
        assert_eq!(s.get(&a.id).unwrap().config["r"], 16);
    }

    #[test]
    fn submit_validates_request() {
        let mut s = RunScheduler::new(4, 100);
        assert!(matches!(
            s.submit(launch("", 1, 0), 3),
            Err(SchedulerError::InvalidRequest(_))
        ));
        assert!(matches!(
            s.submit(launch("x", 0, 0), 3),
            Err(SchedulerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn running_iff_assigned_node() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();
        assert!(s.get(&r.id).unwrap().assigned_node.is_none());

        s.start(&r.id, "node-01", Instant::now()).unwrap();
        let rec = s.get(&r.id).unwrap();
        assert_eq!(rec.status, RunStatus::Running);
        assert_eq!(rec.assigned_node.as_deref(), Some("node-01"));

        s.complete(&r.id).unwrap();
        let rec = s.get(&r.id).unwrap();
        assert_eq!(rec.status, RunStatus::Completed);
        assert!(rec.assigned_node.is_none());
        assert_eq!(s.running_count(), 0);
    }

    #[test]
    fn four_failures_exhaust_three_retries() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();

        for attempt in 1..=3 {
            s.start(&r.id, "node-01", Instant::now()).unwrap();
            let out = s.fail(&r.id, "oom").unwrap();
            assert_eq!(out, FailureOutcome::Requeued { retry_count: attempt });
            assert_eq!(s.get(&r.id).unwrap().status, RunStatus::Pending);
        }

        s.start(&r.id, "node-01", Instant::now()).unwrap();
        let out = s.fail(&r.id, "oom").unwrap();
        assert!(matches!(out, FailureOutcome::Exhausted { retry_count: 3, .. }));

        let rec = s.get(&r.id).unwrap();
        assert_eq!(rec.status, RunStatus::Failed);
        assert_eq!(rec.retry_count, 3);
        assert!(rec.error_message.as_deref().unwrap().contains("after 3 retries"));
        assert_eq!(s.pending_count(), 0);
    }

    #[test]
    fn cancel_pending_and_terminal() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();
        assert_eq!(s.cancel(&r.id).unwrap(), None);
        assert_eq!(s.pending_count(), 0);

        let err = s.cancel(&r.id).unwrap_err();
        assert!(matches!(err, SchedulerError::InvalidTransition { action: "cancel", .. }));

        let done = s.submit(launch("b", 1, 0), 3).unwrap();
        s.start(&done.id, "node-01", Instant::now()).unwrap();
        s.complete(&done.id).unwrap();
        assert!(matches!(
            s.cancel(&done.id),
            Err(SchedulerError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn cancel_running_returns_node() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();
        s.start(&r.id, "node-02", Instant::now()).unwrap();
        assert_eq!(s.cancel(&r.id).unwrap().as_deref(), Some("node-02"));
        assert_eq!(s.running_count(), 0);
    }

    #[test]
    fn start_rejects_non_pending() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();
        s.cancel(&r.id).unwrap();
        assert!(s.start(&r.id, "node-01", Instant::now()).is_err());
    }

    #[test]
    fn complete_and_fail_require_running() {
        let mut s = RunScheduler::new(4, 100);
        let r = s.submit(launch("a", 1, 0), 3).unwrap();
        assert!(matches!(
            s.complete(&r.id),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.fail(&r.id, "x"),
            Err(SchedulerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            s.fail("missing", "x"),
            Err(SchedulerError::RunNotFound(_))
        ));
    }

    #[test]
    fn timeouts_only_cover_running_runs() {
        let mut s = RunScheduler::new(4, 100);
        let t0 = Instant::now();
        let a = s.submit(launch("a", 1, 0), 3).unwrap();
        let _b = s.submit(launch("b", 1, 0), 3).unwrap();
        s.start(&a.id, "node-01", t0).unwrap();

        let timeout = Duration::from_secs(60);
        assert!(s.timed_out(t0 + Duration::from_secs(30), timeout).is_empty());
        assert_eq!(s.timed_out(t0 + Duration::from_secs(61), timeout), vec![a.id]);
    }

    #[test]
    fn list_is_newest_first() {
        let mut s = RunScheduler::new(4, 100);
        let a = s.submit(launch("a", 1, 0), 3).unwrap();
        let b = s.submit(launch("b", 1, 0), 3).unwrap();
        s.cancel(&a.id).unwrap();

        let all: Vec<_> = s.list(None, None).into_iter().map(|r| r.id.clone()).collect();
        assert_eq!(all, vec![b.id.clone(), a.id.clone()]);
        let cancelled = s.list(Some(RunStatus::Cancelled), None);
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a.id);
    }

    #[test]
    fn list_filters_by_recipe() {
        let mut s = RunScheduler::new(4, 100);
        let sft = s.submit(launch("sft", 1, 0), 3).unwrap();
        let mut dpo = launch("dpo", 1, 0);
        dpo.recipe = Recipe::Dpo;
        let dpo = s.submit(dpo, 3).unwrap();

        let ids: Vec<_> = s
            .list(None, Some(Recipe::Dpo))
            .into_iter()
            .map(|r| r.id.clone())
            .collect();
        assert_eq!(ids, vec![dpo.id]);
        assert_eq!(s.list(Some(RunStatus::Pending), Some(Recipe::LoraSft))[0].id, sft.id);
        assert!(s.list(None, Some(Recipe::Rlhf)).is_empty());
    }

    #[test]
    fn prune_keeps_newest_terminal_runs() {
        let mut s = RunScheduler::new(4, 2);
        let ids: Vec<String> = (0..4)
            .map(|i| s.submit(launch(&format!("r{i}"), 1, 0), 0).unwrap().id)
            .collect();
        let live = s.submit(launch("live", 1, 0), 0).unwrap();

        s.cancel(&ids[0]).unwrap();
        s.start(&ids[1], "node-01", Instant::now()).unwrap();
        s.complete(&ids[1]).unwrap();
        assert!(s.prune_terminal().is_empty());

        s.start(&ids[2], "node-01", Instant::now()).unwrap();
        s.fail(&ids[2], "oom").unwrap();
        s.cancel(&ids[3]).unwrap();

        assert_eq!(s.prune_terminal(), vec![ids[0].clone(), ids[1].clone()]);
        assert!(matches!(s.get(&ids[0]), Err(SchedulerError::RunNotFound(_))));
        assert_eq!(s.get(&ids[2]).unwrap().status, RunStatus::Failed);
        assert_eq!(s.get(&live.id).unwrap().status, RunStatus::Pending);
        assert_eq!(s.list(None, None).len(), 3);
        assert_eq!(s.dataset_references("ds-1"), 3);
    }
}
