use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeHealth {
    Healthy,
    Degraded,
    Offline,
}

impl NodeHealth {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeHealth::Healthy => "healthy",
            NodeHealth::Degraded => "degraded",
            NodeHealth::Offline => "offline",
        }
    }
}

impl std::fmt::Display for NodeHealth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for NodeHealth {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(NodeHealth::Healthy),
            "degraded" => Ok(NodeHealth::Degraded),
            "offline" => Ok(NodeHealth::Offline),
            other => Err(ParseEnumError::new("node health", other)),
        }
    }
}

/// Registration payload sent by a node agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub node_id: String,
    pub gpu_count: u32,

    #[serde(default = "default_gpu_type")]
    pub gpu_type: String,

    /// Node can be allocated as preemptible (spot) capacity.
    #[serde(default)]
    pub spot: bool,
}

fn default_gpu_type() -> String {
    "A100".to_string()
}

/// Periodic liveness signal. `healthy = false` reports a failed local health check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    #[serde(default)]
    pub gpu_utilization: f64,
    #[serde(default)]
    pub memory_utilization: f64,
    #[serde(default = "default_healthy")]
    pub healthy: bool,
}

fn default_healthy() -> bool {
    true
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            gpu_utilization: 0.0,
            memory_utilization: 0.0,
            healthy: true,
        }
    }
}

/// Snapshot of a registered node as exposed to readers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub node_id: String,
    pub gpu_count: u32,
    pub gpu_type: String,
    pub spot: bool,
    pub health: NodeHealth,
    pub consecutive_failures: u32,
    pub free_gpus: u32,

    /// run id → GPUs held on this node.
    #[serde(default)]
    pub assigned_runs: Vec<NodeAssignment>,

    pub last_heartbeat_ms: u64,
    pub gpu_utilization: f64,
    pub memory_utilization: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeAssignment {
    pub run_id: String,
    pub gpus: u32,
}
