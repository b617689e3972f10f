use std::time::Duration;

/// Tunables for the scheduling core. The service builds this from its CLI args.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub heartbeat_interval: Duration,
    /// A node is one miss behind after `heartbeat_interval * miss_multiplier` of silence.
    pub miss_multiplier: u32,
    /// Consecutive failures that take a node offline.
    pub offline_threshold: u32,
    pub max_concurrent_runs: usize,
    pub default_max_retries: u32,
    pub run_timeout: Duration,
    pub feed_capacity: usize,
    pub max_metric_points: usize,
    /// Completed, failed and cancelled runs retained; older ones are dropped with their metrics.
    pub max_terminal_runs: usize,
    pub on_demand_rate: f64,
    pub spot_rate: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            miss_multiplier: 2,
            offline_threshold: 3,
            max_concurrent_runs: 4,
            default_max_retries: 3,
            run_timeout: Duration::from_secs(86_400),
            feed_capacity: 1024,
            max_metric_points: 10_000,
            max_terminal_runs: 1000,
            on_demand_rate: 2.50,
            spot_rate: 1.00,
        }
    }
}

impl SchedulerConfig {
    pub fn miss_timeout(&self) -> Duration {
        self.heartbeat_interval * self.miss_multiplier.max(1)
    }

    pub fn rate_for(&self, spot: bool) -> f64 {
        if spot {
            self.spot_rate
        } else {
            self.on_demand_rate
        }
    }
}
