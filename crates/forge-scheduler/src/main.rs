mod args;
mod handlers;
mod metrics;
mod reconcile;
mod routes;
mod state;

use std::time::{Duration, Instant};

use clap::Parser;
use tracing::{info, warn};

use forge_common::auth::parse_auth_from_env;
use forge_common::telemetry::init_tracing;
use forge_common::NodeSpec;
use forge_scheduler::Cluster;

use crate::args::Args;
use crate::reconcile::{admission_loop, sweep_loop};
use crate::state::AppState;

const DEMO_NODES: [(&str, u32, &str); 4] = [
    ("node-01", 8, "A100-80GB"),
    ("node-02", 8, "A100-80GB"),
    ("node-03", 4, "A100-40GB"),
    ("node-04", 4, "H100"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let telemetry = init_tracing(
        "forge-scheduler",
        args.otlp_endpoint.as_deref(),
        args.otlp_token.as_deref(),
    );
    info!(otlp = telemetry.otlp_enabled(), "forge-scheduler starting...");

    let config = args.scheduler_config();
    info!(
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        miss_timeout_secs = config.miss_timeout().as_secs(),
        max_concurrent_runs = config.max_concurrent_runs,
        "scheduler configured"
    );
    let mut cluster = Cluster::new(config);

    if args.seed_demo_nodes {
        let now = Instant::now();
        for (node_id, gpu_count, gpu_type) in DEMO_NODES {
            let spec = NodeSpec {
                node_id: node_id.to_string(),
                gpu_count,
                gpu_type: gpu_type.to_string(),
                spot: false,
            };
            if let Err(e) = cluster.register_node(spec, now) {
                warn!(node_id, error=%e, "failed to seed demo node");
            }
        }
    }

    let st = AppState::new(cluster, parse_auth_from_env());

    tokio::spawn(sweep_loop(
        st.clone(),
        Duration::from_secs(args.sweep_interval_secs.max(1)),
    ));
    tokio::spawn(admission_loop(
        st.clone(),
        Duration::from_secs(args.admission_interval_secs.max(1)),
    ));

    let app = routes::app(st);
    let listener = tokio::net::TcpListener::bind(&args.listen_addr).await?;
    info!("listening on {}", args.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("forge-scheduler stopped");
    telemetry.shutdown();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error=%e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
