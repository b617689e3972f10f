use std::time::Duration;

use clap::Parser;

use forge_scheduler::SchedulerConfig;

#[derive(Debug, Parser)]
#[command(name = "forge-scheduler", about = "Cluster-aware training-run scheduler")]
pub struct Args {
    #[arg(long, env = "FORGE_LISTEN_ADDR", default_value = "0.0.0.0:8000")]
    pub listen_addr: String,

    /// Seconds between expected node heartbeats.
    #[arg(long, env = "FORGE_HEARTBEAT_INTERVAL", default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Silence of `interval * multiplier` counts as one missed heartbeat.
    #[arg(long, env = "FORGE_HEARTBEAT_MISS_MULTIPLIER", default_value_t = 2)]
    pub miss_multiplier: u32,

    /// How often the liveness and run-timeout sweep runs.
    #[arg(long, env = "FORGE_SWEEP_INTERVAL", default_value_t = 5)]
    pub sweep_interval_secs: u64,

    /// Fallback admission tick when no handler has signalled a change.
    #[arg(long, env = "FORGE_ADMISSION_INTERVAL", default_value_t = 10)]
    pub admission_interval_secs: u64,

    #[arg(long, env = "FORGE_MAX_CONCURRENT_RUNS", default_value_t = 4)]
    pub max_concurrent_runs: usize,

    #[arg(long, env = "FORGE_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    #[arg(long, env = "FORGE_RUN_TIMEOUT_SECONDS", default_value_t = 86_400)]
    pub run_timeout_secs: u64,

    #[arg(long, env = "FORGE_FEED_CAPACITY", default_value_t = 1024)]
    pub feed_capacity: usize,

    #[arg(long, env = "FORGE_MAX_METRIC_POINTS", default_value_t = 10_000)]
    pub max_metric_points: usize,

    /// Finished runs kept for listing before the oldest are dropped.
    #[arg(long, env = "FORGE_MAX_TERMINAL_RUNS", default_value_t = 1000)]
    pub max_terminal_runs: usize,

    #[arg(long, env = "FORGE_COST_PER_GPU_HOUR", default_value_t = 2.50)]
    pub cost_per_gpu_hour: f64,

    #[arg(long, env = "FORGE_SPOT_COST_PER_GPU_HOUR", default_value_t = 1.00)]
    pub spot_cost_per_gpu_hour: f64,

    /// Register node-01..node-04 at startup (8/8/4/4 GPUs).
    #[arg(long, env = "FORGE_SEED_DEMO_NODES", default_value_t = false)]
    pub seed_demo_nodes: bool,

    /// OTLP/HTTP traces endpoint; stdout logging only when unset.
    #[arg(long, env = "FORGE_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,

    #[arg(long, env = "FORGE_OTLP_TOKEN")]
    pub otlp_token: Option<String>,
}

impl Args {
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            miss_multiplier: self.miss_multiplier,
            max_concurrent_runs: self.max_concurrent_runs,
            default_max_retries: self.max_retries,
            run_timeout: Duration::from_secs(self.run_timeout_secs),
            feed_capacity: self.feed_capacity,
            max_metric_points: self.max_metric_points,
            max_terminal_runs: self.max_terminal_runs,
            on_demand_rate: self.cost_per_gpu_hour,
            spot_rate: self.spot_cost_per_gpu_hour,
            ..SchedulerConfig::default()
        }
    }
}
