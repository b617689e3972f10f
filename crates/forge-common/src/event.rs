use serde::{Deserialize, Serialize};

use crate::{ModelStage, NodeHealth};

/// One state change published on the observability feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Strictly increasing per scheduler process.
    pub seq: u64,
    pub at_ms: u64,

    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NodeRegistered {
        node_id: String,
        gpu_count: u32,
        spot: bool,
    },
    NodeDecommissioned {
        node_id: String,
    },
    NodeHealthChanged {
        node_id: String,
        from: NodeHealth,
        to: NodeHealth,
        consecutive_failures: u32,
    },
    RunSubmitted {
        run_id: String,
        gpu_count: u32,
        priority: i32,
    },
    RunAdmitted {
        run_id: String,
        node_id: String,
        gpus: u32,
    },
    RunRequeued {
        run_id: String,
        reason: String,
        retry_count: u32,
    },
    RunCompleted {
        run_id: String,
    },
    RunFailed {
        run_id: String,
        reason: String,
        retry_count: u32,
    },
    RunCancelled {
        run_id: String,
    },
    RunUnschedulable {
        run_id: String,
        requested: u32,
        max_node_gpus: u32,
    },
    AllocationReleased {
        run_id: String,
        node_id: String,
        gpus: u32,
    },
    AllocationRolledBack {
        run_id: String,
        node_id: String,
    },
    DatasetRegistered {
        dataset_id: String,
        name: String,
        version: String,
    },
    DatasetDeleted {
        dataset_id: String,
    },
    ModelPromoted {
        model_id: String,
        run_id: String,
        stage: ModelStage,
    },
    ModelStageChanged {
        model_id: String,
        from: ModelStage,
        to: ModelStage,
    },
    EvalRecorded {
        eval_id: String,
        model_id: String,
        passed: bool,
    },
}

impl EventKind {
    pub fn name(&self) -> &'static str {
        match self {
            EventKind::NodeRegistered { .. } => "node_registered",
            EventKind::NodeDecommissioned { .. } => "node_decommissioned",
            EventKind::NodeHealthChanged { .. } => "node_health_changed",
            EventKind::RunSubmitted { .. } => "run_submitted",
            EventKind::RunAdmitted { .. } => "run_admitted",
            EventKind::RunRequeued { .. } => "run_requeued",
            EventKind::RunCompleted { .. } => "run_completed",
            EventKind::RunFailed { .. } => "run_failed",
            EventKind::RunCancelled { .. } => "run_cancelled",
            EventKind::RunUnschedulable { .. } => "run_unschedulable",
            EventKind::AllocationReleased { .. } => "allocation_released",
            EventKind::AllocationRolledBack { .. } => "allocation_rolled_back",
            EventKind::DatasetRegistered { .. } => "dataset_registered",
            EventKind::DatasetDeleted { .. } => "dataset_deleted",
            EventKind::ModelPromoted { .. } => "model_promoted",
            EventKind::ModelStageChanged { .. } => "model_stage_changed",
            EventKind::EvalRecorded { .. } => "eval_recorded",
        }
    }
}

/// Response of a polling read on the feed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPage {
    pub events: Vec<Event>,

    /// Oldest sequence number still retained; a poller whose cursor is older lost events.
    pub oldest_seq: Option<u64>,
    pub next_seq: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_flat_with_type_tag() {
        let ev = Event {
            seq: 7,
            at_ms: 1_000,
            kind: EventKind::RunAdmitted {
                run_id: "r1".to_string(),
                node_id: "node-01".to_string(),
                gpus: 4,
            },
        };
        let v = serde_json::to_value(&ev).unwrap();
        assert_eq!(v["type"], "run_admitted");
        assert_eq!(v["seq"], 7);
        assert_eq!(v["node_id"], "node-01");

        let back: Event = serde_json::from_value(v).unwrap();
        assert_eq!(back, ev);
    }
}
