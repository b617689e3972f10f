pub mod cluster;
pub mod dataset;
pub mod event;
pub mod model;
pub mod node_status;
pub mod page;
pub mod run;

pub use cluster::{ClusterSummary, CostBreakdown, CostEstimate};
pub use dataset::{DatasetRecord, DatasetRegister, PiiScan};
pub use event::{Event, EventKind, EventPage};
pub use model::{
    EvalRecord, EvalReport, EvalResult, EvalStatus, ModelPromote, ModelRecord, ModelStage,
    StageChange,
};
pub use node_status::{Heartbeat, NodeAssignment, NodeHealth, NodeSpec, NodeStatus};
pub use page::Page;
pub use run::{Recipe, RunFailure, RunLaunch, RunMetricPoint, RunRecord, RunStatus};

pub mod auth;
pub mod telemetry;

/// Returned when a status/stage string from a query or CLI flag is not a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    pub fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
