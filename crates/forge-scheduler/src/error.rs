use thiserror::Error;

/// Every way a scheduling operation can be refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SchedulerError {
    #[error("node '{0}' is already registered")]
    DuplicateNode(String),

    #[error("node '{0}' not found")]
    NodeNotFound(String),

    #[error("node '{node_id}' still has {runs} assigned run(s)")]
    NodeBusy { node_id: String, runs: usize },

    /// Normal "stay queued" signal; never logged as an error.
    #[error("no healthy node has {requested} free GPU(s)")]
    InsufficientCapacity { requested: u32 },

    #[error("run requests {requested} GPU(s) but the largest node has {max_node_gpus}")]
    Unschedulable { requested: u32, max_node_gpus: u32 },

    #[error("run '{run_id}' cannot {action} while {status}")]
    InvalidTransition {
        run_id: String,
        status: String,
        action: &'static str,
    },

    #[error("run '{run_id}' failed after {retries} retries: {reason}")]
    RetriesExhausted {
        run_id: String,
        retries: u32,
        reason: String,
    },

    #[error("run '{0}' not found")]
    RunNotFound(String),

    #[error("dataset '{0}' not found")]
    DatasetNotFound(String),

    #[error("model '{0}' not found")]
    ModelNotFound(String),

    #[error("model '{model_id}' cannot move from {from} to {to}")]
    InvalidStageTransition {
        model_id: String,
        from: String,
        to: String,
    },

    #[error("{0}")]
    Conflict(String),

    #[error("latest passed eval of run '{run_id}' scored {score:.4}, below the required {required:.4}")]
    EvalGate {
        run_id: String,
        score: f64,
        required: f64,
    },

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl SchedulerError {
    /// Stable machine readable code used in API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::DuplicateNode(_) => "duplicate_node",
            SchedulerError::NodeNotFound(_) => "node_not_found",
            SchedulerError::NodeBusy { .. } => "node_busy",
            SchedulerError::InsufficientCapacity { .. } => "insufficient_capacity",
            SchedulerError::Unschedulable { .. } => "unschedulable",
            SchedulerError::InvalidTransition { .. } => "invalid_transition",
            SchedulerError::RetriesExhausted { .. } => "retries_exhausted",
            SchedulerError::RunNotFound(_) => "run_not_found",
            SchedulerError::DatasetNotFound(_) => "dataset_not_found",
            SchedulerError::ModelNotFound(_) => "model_not_found",
            SchedulerError::InvalidStageTransition { .. } => "invalid_stage_transition",
            SchedulerError::Conflict(_) => "conflict",
            SchedulerError::EvalGate { .. } => "eval_gate",
            SchedulerError::InvalidRequest(_) => "invalid_request",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
