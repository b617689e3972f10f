//! The single owner of all mutable scheduling state.
//!
//! Every cross-entity operation (node failure → reclaim → requeue, admission
//! → allocate → bind) happens inside one `&mut self` call, so callers holding
//! the service lock never observe it half done.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use forge_common::{
    ClusterSummary, CostEstimate, DatasetRecord, DatasetRegister, EvalRecord, EvalReport,
    EvalStatus, EventKind, Heartbeat, ModelPromote, ModelRecord, ModelStage, NodeHealth,
    NodeSpec, NodeStatus, PiiScan, Recipe, RunLaunch, RunRecord, RunStatus,
};

use crate::allocator::{Allocator, RunInterrupted};
use crate::config::SchedulerConfig;
use crate::cost;
use crate::datasets::{DatasetFilter, DatasetRegistry};
use crate::error::{Result, SchedulerError};
use crate::feed::Feed;
use crate::heartbeat::{HealthTransition, HeartbeatMonitor};
use crate::models::ModelRegistry;
use crate::registry::NodeRegistry;
use crate::run_metrics::RunMetricsStore;
use crate::scheduler::{FailureOutcome, RunScheduler};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admitted {
    pub run_id: String,
    pub node_id: String,
    pub gpus: u32,
}

#[derive(Debug, Default)]
pub struct AdmissionReport {
    pub admitted: Vec<Admitted>,
    /// Runs newly flagged as too large for any registered node.
    pub unschedulable: Vec<String>,
    pub rolled_back: usize,
}

/// Health transitions and run failures caused by one sweep, heartbeat or failure report.
#[derive(Debug, Default)]
pub struct SweepReport {
    pub transitions: Vec<HealthTransition>,
    pub requeued: Vec<String>,
    pub failed: Vec<String>,
    pub timed_out: Vec<String>,
}

impl SweepReport {
    /// Something happened that may let a queued run in.
    pub fn capacity_changed(&self) -> bool {
        !self.requeued.is_empty()
            || !self.timed_out.is_empty()
            || self.transitions.iter().any(HealthTransition::recovered)
    }
}

#[derive(Debug)]
pub struct Cluster {
    config: SchedulerConfig,
    registry: NodeRegistry,
    heartbeat: HeartbeatMonitor,
    allocator: Allocator,
    runs: RunScheduler,
    datasets: DatasetRegistry,
    models: ModelRegistry,
    feed: Feed,
    run_metrics: Arc<RunMetricsStore>,
}

impl Cluster {
    pub fn new(config: SchedulerConfig) -> Self {
        Self::with_allocator(config, Allocator::default())
    }

    pub fn with_allocator(config: SchedulerConfig, allocator: Allocator) -> Self {
        Self {
            registry: NodeRegistry::new(),
            heartbeat: HeartbeatMonitor::new(config.miss_timeout(), config.offline_threshold),
            allocator,
            runs: RunScheduler::new(config.max_concurrent_runs, config.max_terminal_runs),
            datasets: DatasetRegistry::new(),
            models: ModelRegistry::new(),
            feed: Feed::new(config.feed_capacity),
            run_metrics: Arc::new(RunMetricsStore::new(config.max_metric_points)),
            config,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Shared handle; the feed synchronizes internally.
    pub fn feed(&self) -> Feed {
        self.feed.clone()
    }

    pub fn run_metrics(&self) -> Arc<RunMetricsStore> {
        Arc::clone(&self.run_metrics)
    }

    // ── Nodes ───────────────────────────────────────────────────────

    pub fn register_node(&mut self, spec: NodeSpec, now: Instant) -> Result<NodeStatus> {
        let (gpu_count, spot) = (spec.gpu_count, spec.spot);
        let node_id = self.registry.register(spec, now)?;
        self.feed.publish(EventKind::NodeRegistered {
            node_id: node_id.clone(),
            gpu_count,
            spot,
        });
        self.registry.get(&node_id)
    }

    pub fn decommission_node(&mut self, node_id: &str) -> Result<()> {
        self.registry.decommission(node_id)?;
        self.feed.publish(EventKind::NodeDecommissioned {
            node_id: node_id.to_string(),
        });
        Ok(())
    }

    pub fn node(&self, node_id: &str) -> Result<NodeStatus> {
        self.registry.get(node_id)
    }

    /// Ordered by node id.
    pub fn nodes(&self, health: Option<NodeHealth>) -> impl Iterator<Item = NodeStatus> + '_ {
        self.registry
            .list()
            .filter(move |n| health.map_or(true, |h| n.health == h))
    }

    /// A heartbeat reporting `healthy: false` can take the node offline and requeue its runs.
    pub fn heartbeat(
        &mut self,
        node_id: &str,
        hb: &Heartbeat,
        now: Instant,
    ) -> Result<(NodeStatus, SweepReport)> {
        let mut report = SweepReport::default();
        if let Some(t) = self.heartbeat.record(&mut self.registry, node_id, hb, now)? {
            self.apply_transition(t, &mut report);
        }
        self.prune_terminal();
        Ok((self.registry.get(node_id)?, report))
    }

    /// Count missed heartbeats, fail over offline nodes and time out overrunning runs.
    pub fn sweep(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for t in self.heartbeat.sweep(&mut self.registry, now) {
            self.apply_transition(t, &mut report);
        }

        let limit = self.config.run_timeout;
        for run_id in self.runs.timed_out(now, limit) {
            self.release(&run_id);
            let reason = format!("run exceeded timeout of {}s", limit.as_secs());
            match self.runs.interrupt(&run_id, &reason) {
                Ok(outcome) => self.publish_outcome(&run_id, &reason, outcome, &mut report),
                Err(err) => warn!(run_id=%run_id, error=%err, "failed to time out run"),
            }
            report.timed_out.push(run_id);
        }

        self.prune_terminal();
        report
    }

    fn apply_transition(&mut self, t: HealthTransition, report: &mut SweepReport) {
        self.feed.publish(EventKind::NodeHealthChanged {
            node_id: t.node_id.clone(),
            from: t.from,
            to: t.to,
            consecutive_failures: t.consecutive_failures,
        });

        if t.went_offline() {
            let interrupted = self.allocator.reclaim_node(&mut self.registry, &t.node_id);
            for run in interrupted {
                self.requeue_interrupted(run, report);
            }
        }
        report.transitions.push(t);
    }

    fn requeue_interrupted(&mut self, run: RunInterrupted, report: &mut SweepReport) {
        self.feed.publish(EventKind::AllocationReleased {
            run_id: run.run_id.clone(),
            node_id: run.node_id.clone(),
            gpus: run.gpus,
        });

        let reason = format!("node {} went offline", run.node_id);
        match self.runs.interrupt(&run.run_id, &reason) {
            Ok(outcome) => self.publish_outcome(&run.run_id, &reason, outcome, report),
            Err(err) => warn!(run_id=%run.run_id, error=%err, "interrupted run was not running"),
        }
    }

    fn publish_outcome(
        &mut self,
        run_id: &str,
        reason: &str,
        outcome: FailureOutcome,
        report: &mut SweepReport,
    ) {
        match outcome {
            FailureOutcome::Requeued { retry_count } => {
                self.feed.publish(EventKind::RunRequeued {
                    run_id: run_id.to_string(),
                    reason: reason.to_string(),
                    retry_count,
                });
                report.requeued.push(run_id.to_string());
            }
            FailureOutcome::Exhausted {
                retry_count,
                message,
            } => {
                self.feed.publish(EventKind::RunFailed {
                    run_id: run_id.to_string(),
                    reason: message,
                    retry_count,
                });
                report.failed.push(run_id.to_string());
            }
        }
    }

    fn prune_terminal(&mut self) {
        for run_id in self.runs.prune_terminal() {
            self.run_metrics.remove(&run_id);
        }
    }

    fn release(&mut self, run_id: &str) {
        if let Some(p) = self.allocator.release(&mut self.registry, run_id) {
            self.feed.publish(EventKind::AllocationReleased {
                run_id: run_id.to_string(),
                node_id: p.node_id,
                gpus: p.gpus,
            });
        }
    }

    // ── Runs ────────────────────────────────────────────────────────

    /// The dataset must be registered.
    pub fn submit_run(&mut self, launch: RunLaunch) -> Result<RunRecord> {
        if !launch.dataset_id.trim().is_empty() {
            self.datasets.get(&launch.dataset_id)?;
        }
        let record = self.runs.submit(launch, self.config.default_max_retries)?;
        self.run_metrics.open(&record.id);
        self.feed.publish(EventKind::RunSubmitted {
            run_id: record.id.clone(),
            gpu_count: record.gpu_count,
            priority: record.priority,
        });
        Ok(record)
    }

    pub fn run(&self, run_id: &str) -> Result<&RunRecord> {
        self.runs.get(run_id)
    }

    /// Newest first.
    pub fn runs(&self, status: Option<RunStatus>, recipe: Option<Recipe>) -> Vec<&RunRecord> {
        self.runs.list(status, recipe)
    }

    /// Pending runs leave the queue untouched by the allocator; running runs free their GPUs.
    pub fn cancel_run(&mut self, run_id: &str) -> Result<RunRecord> {
        if self.runs.cancel(run_id)?.is_some() {
            self.release(run_id);
        }
        self.feed.publish(EventKind::RunCancelled {
            run_id: run_id.to_string(),
        });
        let record = self.runs.get(run_id).cloned();
        self.prune_terminal();
        record
    }

    pub fn complete_run(&mut self, run_id: &str) -> Result<RunRecord> {
        self.runs.complete(run_id)?;
        self.release(run_id);
        self.feed.publish(EventKind::RunCompleted {
            run_id: run_id.to_string(),
        });
        let record = self.runs.get(run_id).cloned();
        self.prune_terminal();
        record
    }

    /// Failure reported by the node agent; requeued while retries remain.
    pub fn fail_run(&mut self, run_id: &str, reason: &str) -> Result<(RunRecord, SweepReport)> {
        let reason = if reason.trim().is_empty() {
            "run failed"
        } else {
            reason
        };
        let outcome = self.runs.fail(run_id, reason)?;
        self.release(run_id);
        let mut report = SweepReport::default();
        self.publish_outcome(run_id, reason, outcome, &mut report);
        let record = self.runs.get(run_id).cloned()?;
        self.prune_terminal();
        Ok((record, report))
    }

    /// Walk the queue in priority order and place what fits.
    ///
    /// Runs too large for every registered node are flagged once and skipped;
    /// runs that merely lack free capacity are skipped so smaller ones behind
    /// them can backfill.
    pub fn admit(&mut self, now: Instant) -> AdmissionReport {
        let mut report = AdmissionReport::default();
        let largest = self.allocator.largest_node(&self.registry);

        for (run_id, gpus) in self.runs.pending_in_order() {
            if !self.runs.has_capacity() {
                debug!(
                    running = self.runs.running_count(),
                    "concurrency cap reached, admission paused"
                );
                break;
            }

            if gpus > largest {
                if self.runs.set_unschedulable(&run_id, true) {
                    let err = SchedulerError::Unschedulable {
                        requested: gpus,
                        max_node_gpus: largest,
                    };
                    warn!(run_id=%run_id, error=%err, "run cannot fit on any node");
                    self.feed.publish(EventKind::RunUnschedulable {
                        run_id: run_id.clone(),
                        requested: gpus,
                        max_node_gpus: largest,
                    });
                    report.unschedulable.push(run_id);
                }
                continue;
            }
            self.runs.set_unschedulable(&run_id, false);

            let node_id = match self.allocator.allocate(&mut self.registry, &run_id, gpus) {
                Ok(node_id) => node_id,
                Err(SchedulerError::InsufficientCapacity { .. }) => continue,
                Err(err) => {
                    warn!(run_id=%run_id, error=%err, "allocation failed");
                    continue;
                }
            };

            match self.runs.start(&run_id, &node_id, now) {
                Ok(()) => {
                    info!(run_id=%run_id, node_id=%node_id, gpus, "run admitted");
                    self.feed.publish(EventKind::RunAdmitted {
                        run_id: run_id.clone(),
                        node_id: node_id.clone(),
                        gpus,
                    });
                    report.admitted.push(Admitted {
                        run_id,
                        node_id,
                        gpus,
                    });
                }
                Err(err) => {
                    // Queued but no longer pending: undo the allocation.
                    debug!(run_id=%run_id, error=%err, "binding refused, rolling back");
                    self.allocator.release(&mut self.registry, &run_id);
                    self.feed.publish(EventKind::AllocationRolledBack { run_id, node_id });
                    report.rolled_back += 1;
                }
            }
        }

        report
    }

    // ── Datasets ────────────────────────────────────────────────────

    pub fn register_dataset(&mut self, req: DatasetRegister) -> Result<DatasetRecord> {
        let dataset = self.datasets.register(req)?;
        self.feed.publish(EventKind::DatasetRegistered {
            dataset_id: dataset.id.clone(),
            name: dataset.name.clone(),
            version: dataset.version.clone(),
        });
        Ok(dataset)
    }

    pub fn dataset(&self, dataset_id: &str) -> Result<&DatasetRecord> {
        self.datasets.get(dataset_id)
    }

    /// Newest first.
    pub fn datasets(&self, filter: DatasetFilter<'_>) -> Vec<&DatasetRecord> {
        self.datasets.list(filter)
    }

    pub fn dataset_lineage(&self, dataset_id: &str) -> Result<Vec<DatasetRecord>> {
        self.datasets.lineage(dataset_id)
    }

    pub fn scan_dataset_pii(&self, dataset_id: &str, fields: &[String]) -> Result<PiiScan> {
        self.datasets.scan_pii(dataset_id, fields)
    }

    /// Refused while any retained run was launched against the dataset.
    pub fn delete_dataset(&mut self, dataset_id: &str) -> Result<()> {
        self.datasets.get(dataset_id)?;
        let refs = self.runs.dataset_references(dataset_id);
        if refs > 0 {
            return Err(SchedulerError::Conflict(format!(
                "cannot delete dataset '{dataset_id}': referenced by {refs} run(s)"
            )));
        }
        self.datasets.remove(dataset_id)?;
        self.feed.publish(EventKind::DatasetDeleted {
            dataset_id: dataset_id.to_string(),
        });
        Ok(())
    }

    // ── Models and evals ────────────────────────────────────────────

    pub fn promote_model(&mut self, req: ModelPromote) -> Result<ModelRecord> {
        let run = self.runs.get(&req.run_id)?;
        let model = self.models.promote(run, req)?;
        self.feed.publish(EventKind::ModelPromoted {
            model_id: model.id.clone(),
            run_id: model.run_id.clone(),
            stage: model.stage,
        });
        Ok(model)
    }

    pub fn set_model_stage(&mut self, model_id: &str, stage: ModelStage) -> Result<ModelRecord> {
        let (model, from) = self.models.set_stage(model_id, stage)?;
        if from != stage {
            self.feed.publish(EventKind::ModelStageChanged {
                model_id: model_id.to_string(),
                from,
                to: stage,
            });
        }
        Ok(model)
    }

    pub fn record_eval(&mut self, report: EvalReport) -> Result<EvalRecord> {
        let eval = self.models.record_eval(report)?;
        self.feed.publish(EventKind::EvalRecorded {
            eval_id: eval.id.clone(),
            model_id: eval.model_id.clone(),
            passed: eval.status == EvalStatus::Passed,
        });
        Ok(eval)
    }

    pub fn model(&self, model_id: &str) -> Result<&ModelRecord> {
        self.models.get(model_id)
    }

    pub fn models(&self, stage: Option<ModelStage>, name: Option<&str>) -> Vec<&ModelRecord> {
        self.models.list(stage, name)
    }

    pub fn evals(&self, status: Option<EvalStatus>, model_id: Option<&str>) -> Vec<&EvalRecord> {
        self.models.evals(status, model_id)
    }

    // ── Aggregates ──────────────────────────────────────────────────

    pub fn summary(&self) -> ClusterSummary {
        let mut summary = ClusterSummary {
            total_nodes: self.registry.len(),
            healthy: 0,
            degraded: 0,
            offline: 0,
            total_gpus: 0,
            available_gpus: self.allocator.total_free(&self.registry),
            avg_gpu_utilization: 0.0,
            cost_per_gpu_hour: self.config.on_demand_rate,
            spot_cost_per_gpu_hour: self.config.spot_rate,
            burn_rate_per_hour: 0.0,
            running_runs: self.runs.running_count(),
            pending_runs: self.runs.pending_count(),
        };

        let mut util = 0.0;
        for node in self.registry.nodes() {
            match node.health {
                NodeHealth::Healthy => summary.healthy += 1,
                NodeHealth::Degraded => summary.degraded += 1,
                NodeHealth::Offline => summary.offline += 1,
            }
            summary.total_gpus += node.spec.gpu_count;
            util += node.gpu_utilization;
        }
        if !self.registry.is_empty() {
            summary.avg_gpu_utilization = cost::round2(util / self.registry.len() as f64);
        }

        let burn: f64 = self
            .runs
            .running_runs()
            .map(|run| {
                let spot = run
                    .assigned_node
                    .as_deref()
                    .and_then(|id| self.registry.node(id))
                    .is_some_and(|n| n.spec.spot);
                f64::from(run.gpu_count) * self.config.rate_for(spot)
            })
            .fold(0.0, |acc, cost| acc + cost);
        summary.burn_rate_per_hour = cost::round2(burn);

        summary
    }

    pub fn estimate_cost(&self, gpu_count: u32, hours: f64, spot: bool) -> Result<CostEstimate> {
        let rate = self.config.rate_for(spot);
        cost::validate(hours, rate)?;
        Ok(cost::estimate(gpu_count, hours, rate))
    }
}
