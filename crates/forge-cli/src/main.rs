mod args;
mod client;
mod follow;
mod output;

use anyhow::Result;
use clap::Parser;
use serde_json::{json, Map, Value};

use forge_common::{
    ClusterSummary, CostEstimate, DatasetRecord, DatasetRegister, EvalRecord, EventPage,
    Heartbeat, ModelPromote, ModelRecord, NodeSpec, NodeStatus, Page, PiiScan, RunLaunch,
    RunMetricPoint, RunRecord, StageChange,
};

use crate::args::{
    Args, ClusterCommand, Command, DatasetCommand, EvalCommand, ModelCommand, NodeCommand,
    RunCommand,
};
use crate::client::{fetch, send, ForgeClient};
use crate::follow::follow_events;
use crate::output::{
    print_cluster_status, print_cost, print_dataset_detail, print_datasets, print_evals,
    print_event, print_lineage, print_model_detail, print_models, print_node_detail,
    print_nodes, print_pii_scan, print_run_detail, print_run_metrics, print_runs,
};

#[derive(serde::Deserialize)]
struct MetricsSeries {
    run_id: String,
    metrics: Vec<RunMetricPoint>,
}

/// Query pairs for the optional filters that were given.
fn filters(pairs: &[(&str, Option<String>)]) -> Vec<(String, String)> {
    pairs
        .iter()
        .filter_map(|(k, v)| v.clone().map(|v| (k.to_string(), v)))
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let client = ForgeClient::new(&args.url, args.token);

    match args.command {
        Command::Cluster { subcommand } => match subcommand {
            ClusterCommand::Status => {
                let summary: ClusterSummary =
                    fetch(client.get("/cluster/status"), "get cluster status").await?;
                let nodes: Page<NodeStatus> = fetch(
                    client.get("/nodes").query(&[("limit", "500")]),
                    "list nodes",
                )
                .await?;
                print_cluster_status(&summary, &nodes.items);
            }
            ClusterCommand::Cost { gpus, hours, spot } => {
                let req = client.get("/cluster/cost").query(&[
                    ("num_gpus", gpus.to_string()),
                    ("hours", hours.to_string()),
                    ("spot", spot.to_string()),
                ]);
                let estimate: CostEstimate = fetch(req, "estimate cost").await?;
                print_cost(&estimate);
            }
        },
        Command::Node { subcommand } => match subcommand {
            NodeCommand::List { status } => {
                let q = filters(&[("status", status.map(|s| s.to_string()))]);
                let page: Page<NodeStatus> =
                    fetch(client.get("/nodes").query(&q), "list nodes").await?;
                print_nodes(&page.items);
            }
            NodeCommand::Get { node_id } => {
                let node: NodeStatus =
                    fetch(client.get(&format!("/nodes/{node_id}")), "get node").await?;
                print_node_detail(&node);
            }
            NodeCommand::Register {
                node_id,
                gpus,
                gpu_type,
                spot,
            } => {
                let spec = NodeSpec {
                    node_id,
                    gpu_count: gpus,
                    gpu_type,
                    spot,
                };
                let node: NodeStatus =
                    fetch(client.post("/nodes").json(&spec), "register node").await?;
                println!(
                    "✓ Node '{}' registered ({} x {})",
                    node.node_id, node.gpu_count, node.gpu_type
                );
            }
            NodeCommand::Decommission { node_id } => {
                send(
                    client.delete(&format!("/nodes/{node_id}")),
                    "decommission node",
                )
                .await?;
                println!("✓ Node '{node_id}' decommissioned");
            }
            NodeCommand::Heartbeat {
                node_id,
                gpu_util,
                mem_util,
                unhealthy,
            } => {
                let hb = Heartbeat {
                    gpu_utilization: gpu_util,
                    memory_utilization: mem_util,
                    healthy: !unhealthy,
                };
                let node: NodeStatus = fetch(
                    client
                        .post(&format!("/nodes/{node_id}/heartbeat"))
                        .json(&hb),
                    "send heartbeat",
                )
                .await?;
                println!("✓ Heartbeat accepted, node '{}' is {}", node.node_id, node.health);
            }
        },
        Command::Run { subcommand } => match subcommand {
            RunCommand::List { status, recipe } => {
                let q = filters(&[
                    ("status", status.map(|s| s.to_string())),
                    ("recipe", recipe.map(|r| r.to_string())),
                ]);
                let page: Page<RunRecord> =
                    fetch(client.get("/runs").query(&q), "list runs").await?;
                print_runs(&page);
            }
            RunCommand::Get { run_id } => {
                let run: RunRecord =
                    fetch(client.get(&format!("/runs/{run_id}")), "get run").await?;
                print_run_detail(&run);
            }
            RunCommand::Launch {
                name,
                base_model,
                dataset,
                recipe,
                gpus,
                priority,
                max_retries,
                tags,
                overrides,
            } => {
                let launch = RunLaunch {
                    name,
                    base_model,
                    dataset_id: dataset,
                    recipe,
                    config_overrides: overrides.into_iter().collect::<Map<String, Value>>(),
                    gpu_count: gpus,
                    priority,
                    tags,
                    max_retries,
                };
                let run: RunRecord =
                    fetch(client.post("/runs/launch").json(&launch), "launch run").await?;
                println!("✓ Run '{}' queued: {}", run.name, run.id);
            }
            RunCommand::Cancel { run_id } => {
                let run: RunRecord = fetch(
                    client.post(&format!("/runs/{run_id}/cancel")),
                    "cancel run",
                )
                .await?;
                println!("✓ Run '{}' cancelled", run.id);
            }
            RunCommand::Complete { run_id } => {
                let run: RunRecord = fetch(
                    client.post(&format!("/runs/{run_id}/complete")),
                    "complete run",
                )
                .await?;
                println!("✓ Run '{}' completed", run.id);
            }
            RunCommand::Fail { run_id, reason } => {
                let run: RunRecord = fetch(
                    client
                        .post(&format!("/runs/{run_id}/fail"))
                        .json(&json!({ "reason": reason })),
                    "fail run",
                )
                .await?;
                println!(
                    "✓ Run '{}' is now {} (retry {}/{})",
                    run.id, run.status, run.retry_count, run.max_retries
                );
            }
            RunCommand::Metrics { run_id, last_n } => {
                let q = filters(&[("last_n", last_n.map(|n| n.to_string()))]);
                let series: MetricsSeries = fetch(
                    client.get(&format!("/runs/{run_id}/metrics")).query(&q),
                    "get run metrics",
                )
                .await?;
                print_run_metrics(&series.run_id, &series.metrics);
            }
        },
        Command::Dataset { subcommand } => match subcommand {
            DatasetCommand::List { name, version, tag } => {
                let q = filters(&[("name", name), ("version", version), ("tag", tag)]);
                let page: Page<DatasetRecord> =
                    fetch(client.get("/datasets").query(&q), "list datasets").await?;
                print_datasets(&page);
            }
            DatasetCommand::Get { dataset_id } => {
                let dataset: DatasetRecord =
                    fetch(client.get(&format!("/datasets/{dataset_id}")), "get dataset").await?;
                print_dataset_detail(&dataset);
            }
            DatasetCommand::Register {
                name,
                source,
                version,
                format,
                description,
                license,
                pii_checked,
                tags,
                rows,
                parent,
            } => {
                let req = DatasetRegister {
                    name,
                    version,
                    source_path: source,
                    format,
                    description,
                    license,
                    pii_checked,
                    tags,
                    row_count: rows,
                    parent_dataset_id: parent,
                };
                let dataset: DatasetRecord = fetch(
                    client.post("/datasets/register").json(&req),
                    "register dataset",
                )
                .await?;
                println!(
                    "✓ Dataset '{} {}' registered: {}",
                    dataset.name, dataset.version, dataset.id
                );
            }
            DatasetCommand::Lineage { dataset_id } => {
                let chain: Vec<DatasetRecord> = fetch(
                    client.get(&format!("/datasets/{dataset_id}/lineage")),
                    "get dataset lineage",
                )
                .await?;
                print_lineage(&chain);
            }
            DatasetCommand::ScanPii { dataset_id, fields } => {
                let scan: PiiScan = fetch(
                    client
                        .post(&format!("/datasets/{dataset_id}/scan-pii"))
                        .json(&fields),
                    "scan dataset fields",
                )
                .await?;
                print_pii_scan(&scan);
            }
            DatasetCommand::Delete { dataset_id } => {
                send(
                    client.delete(&format!("/datasets/{dataset_id}")),
                    "delete dataset",
                )
                .await?;
                println!("✓ Dataset '{dataset_id}' deleted");
            }
        },
        Command::Model { subcommand } => match subcommand {
            ModelCommand::List { stage, name } => {
                let q = filters(&[("stage", stage.map(|s| s.to_string())), ("name", name)]);
                let page: Page<ModelRecord> =
                    fetch(client.get("/models").query(&q), "list models").await?;
                print_models(&page);
            }
            ModelCommand::Get { model_id } => {
                let model: ModelRecord =
                    fetch(client.get(&format!("/models/{model_id}")), "get model").await?;
                print_model_detail(&model);
            }
            ModelCommand::Promote {
                run_id,
                name,
                version,
                description,
                stage,
                min_eval_score,
            } => {
                let req = ModelPromote {
                    run_id,
                    name,
                    version,
                    description,
                    target_stage: stage,
                    min_eval_score,
                };
                let model: ModelRecord =
                    fetch(client.post("/models/promote").json(&req), "promote model").await?;
                println!(
                    "✓ Model '{} {}' registered as {} ({})",
                    model.name, model.version, model.stage, model.id
                );
            }
            ModelCommand::Stage { model_id, stage } => {
                let model: ModelRecord = fetch(
                    client
                        .post(&format!("/models/{model_id}/stage"))
                        .json(&StageChange { stage }),
                    "change model stage",
                )
                .await?;
                println!("✓ Model '{}' is now {}", model.id, model.stage);
            }
        },
        Command::Eval { subcommand } => match subcommand {
            EvalCommand::List { status, model_id } => {
                let q = filters(&[
                    ("status", status.map(|s| s.to_string())),
                    ("model_id", model_id),
                ]);
                let page: Page<EvalRecord> =
                    fetch(client.get("/evals").query(&q), "list evals").await?;
                print_evals(&page);
            }
        },
        Command::Events {
            since,
            limit,
            follow,
        } => {
            if follow {
                follow_events(&client, since).await?;
            } else {
                let q = filters(&[
                    ("since", since.map(|s| s.to_string())),
                    ("limit", limit.map(|l| l.to_string())),
                ]);
                let page: EventPage =
                    fetch(client.get("/events").query(&q), "list events").await?;
                for ev in &page.events {
                    print_event(ev);
                }
                if page.events.is_empty() {
                    println!("No events (next seq {}).", page.next_seq);
                }
            }
        }
        Command::Whoami => {
            let who: Value = fetch(client.get("/whoami"), "fetch identity").await?;
            println!(
                "{} ({})",
                who["principal"].as_str().unwrap_or("unknown"),
                who["role"].as_str().unwrap_or("unknown")
            );
        }
    }

    Ok(())
}
