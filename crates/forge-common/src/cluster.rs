use serde::{Deserialize, Serialize};

/// Aggregate view consumed by the dashboard's cluster page.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSummary {
    pub total_nodes: usize,
    pub healthy: usize,
    pub degraded: usize,
    pub offline: usize,
    pub total_gpus: u32,
    pub available_gpus: u32,
    pub avg_gpu_utilization: f64,
    pub cost_per_gpu_hour: f64,
    pub spot_cost_per_gpu_hour: f64,

    /// Current spend per hour across all running runs.
    pub burn_rate_per_hour: f64,

    pub running_runs: usize,
    pub pending_runs: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostEstimate {
    pub gpu_cost: f64,
    pub platform_overhead: f64,
    pub total: f64,
    pub breakdown: CostBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostBreakdown {
    pub gpu_count: u32,
    pub hours: f64,
    pub rate_per_gpu_hour: f64,
}
