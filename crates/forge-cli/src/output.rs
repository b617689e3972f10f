use forge_common::{
    ClusterSummary, CostEstimate, DatasetRecord, EvalRecord, Event, ModelRecord, NodeStatus,
    Page, PiiScan, RunMetricPoint, RunRecord,
};
use serde_json::Value;

pub fn print_cluster_status(summary: &ClusterSummary, nodes: &[NodeStatus]) {
    println!("\n=== Forge Cluster Status ===");
    println!(
        "\n  Nodes: {} ({} healthy, {} degraded, {} offline)",
        summary.total_nodes, summary.healthy, summary.degraded, summary.offline
    );
    println!(
        "  GPUs:  {}/{} available, avg util {:.2}",
        summary.available_gpus, summary.total_gpus, summary.avg_gpu_utilization
    );
    println!(
        "  Runs:  {} running, {} pending",
        summary.running_runs, summary.pending_runs
    );
    println!(
        "  Burn:  ${:.2}/h (on-demand ${:.2}, spot ${:.2} per GPU-hour)",
        summary.burn_rate_per_hour, summary.cost_per_gpu_hour, summary.spot_cost_per_gpu_hour
    );

    println!("\n[Nodes]");
    print_nodes(nodes);
}

pub fn print_nodes(nodes: &[NodeStatus]) {
    if nodes.is_empty() {
        println!("  (No nodes registered)");
        return;
    }
    println!(
        "  {:<20} {:<12} {:<10} {:<10} {:<8} {:<6}",
        "Node ID", "GPU Type", "Health", "Free/Total", "Util", "Runs"
    );
    for n in nodes {
        println!(
            "  {:<20} {:<12} {:<10} {:<10} {:<8.2} {:<6}",
            n.node_id,
            n.gpu_type,
            n.health.as_str(),
            format!("{}/{}", n.free_gpus, n.gpu_count),
            n.gpu_utilization,
            n.assigned_runs.len()
        );
    }
    println!();
}

pub fn print_node_detail(node: &NodeStatus) {
    println!("\n=== Node Detail ===\n");
    println!("  ID:       {}", node.node_id);
    println!("  GPUs:     {} x {}", node.gpu_count, node.gpu_type);
    println!("  Spot:     {}", node.spot);
    println!("  Health:   {}", node.health);
    println!("  Failures: {}", node.consecutive_failures);
    println!("  Free:     {}", node.free_gpus);
    if !node.assigned_runs.is_empty() {
        println!("\n  [Assigned runs]");
        for a in &node.assigned_runs {
            println!("  {:<40} {} GPUs", a.run_id, a.gpus);
        }
    }
    println!();
}

pub fn print_runs(page: &Page<RunRecord>) {
    println!("\n=== Training Runs ({} total) ===\n", page.total);
    if page.items.is_empty() {
        println!("No runs found.");
        return;
    }
    println!(
        "{:<38} {:<20} {:<10} {:<10} {:<5} {:<12} {:<6}",
        "Run ID", "Name", "Recipe", "Status", "GPUs", "Node", "Retry"
    );
    println!("{:-<105}", "");
    for r in &page.items {
        let status = if r.unschedulable {
            format!("{}*", r.status)
        } else {
            r.status.to_string()
        };
        println!(
            "{:<38} {:<20} {:<10} {:<10} {:<5} {:<12} {}/{}",
            r.id,
            r.name,
            r.recipe.as_str(),
            status,
            r.gpu_count,
            r.assigned_node.as_deref().unwrap_or("-"),
            r.retry_count,
            r.max_retries
        );
    }
    if page.items.iter().any(|r| r.unschedulable) {
        println!("\n* larger than any registered node");
    }
    println!();
}

pub fn print_run_detail(run: &RunRecord) {
    println!("\n=== Run Detail ===\n");
    println!("  ID:       {}", run.id);
    println!("  Name:     {}", run.name);
    println!("  Model:    {}", run.base_model);
    println!("  Dataset:  {}", run.dataset_id);
    println!("  Recipe:   {}", run.recipe);
    println!("  Status:   {}", run.status);
    println!("  GPUs:     {}", run.gpu_count);
    println!("  Priority: {}", run.priority);
    println!("  Node:     {}", run.assigned_node.as_deref().unwrap_or("-"));
    println!("  Retries:  {}/{}", run.retry_count, run.max_retries);
    if let Some(err) = &run.error_message {
        println!("  Error:    {err}");
    }
    println!(
        "  Config:   {}",
        serde_json::to_string(&run.config).unwrap_or_default()
    );
    println!();
}

pub fn print_run_metrics(run_id: &str, points: &[RunMetricPoint]) {
    println!("\n=== Metrics for {run_id} ===\n");
    if points.is_empty() {
        println!("No metrics reported yet.");
        return;
    }
    println!(
        "{:<10} {:<12} {:<12} {:<8}",
        "Step", "Loss", "LR", "Epoch"
    );
    for p in points {
        println!(
            "{:<10} {:<12.4} {:<12.2e} {:<8.2}",
            p.step, p.loss, p.learning_rate, p.epoch
        );
    }
    println!();
}

pub fn print_datasets(page: &Page<DatasetRecord>) {
    println!("\n=== Datasets ({} total) ===\n", page.total);
    if page.items.is_empty() {
        println!("No datasets found.");
        return;
    }
    println!(
        "{:<38} {:<24} {:<10} {:<8} {:<10}",
        "Dataset ID", "Name", "Version", "Format", "Rows"
    );
    println!("{:-<95}", "");
    for d in &page.items {
        println!(
            "{:<38} {:<24} {:<10} {:<8} {:<10}",
            d.id,
            d.name,
            d.version,
            d.format,
            d.row_count
                .map(|n| n.to_string())
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
}

pub fn print_dataset_detail(dataset: &DatasetRecord) {
    println!("\n=== Dataset Detail ===\n");
    println!("  ID:       {}", dataset.id);
    println!("  Name:     {} {}", dataset.name, dataset.version);
    println!("  Source:   {} ({})", dataset.source_path, dataset.format);
    println!("  License:  {}", dataset.license);
    println!("  PII:      {}", if dataset.pii_checked { "checked" } else { "unchecked" });
    println!("  Checksum: {}", dataset.checksum);
    println!("  Parent:   {}", dataset.parent_dataset_id.as_deref().unwrap_or("-"));
    if !dataset.tags.is_empty() {
        println!("  Tags:     {}", dataset.tags.join(", "));
    }
    println!();
}

pub fn print_lineage(chain: &[DatasetRecord]) {
    for (depth, d) in chain.iter().enumerate() {
        let marker = if depth == 0 { "" } else { "└─ " };
        println!("{:indent$}{marker}{} {} ({})", "", d.name, d.version, d.id, indent = depth * 3);
    }
}

pub fn print_pii_scan(scan: &PiiScan) {
    if scan.pii_risk {
        println!(
            "✗ {} of {} field(s) look like personal data: {}",
            scan.flagged_fields.len(),
            scan.fields_checked,
            scan.flagged_fields.join(", ")
        );
    } else {
        println!("✓ No personal data in {} field(s)", scan.fields_checked);
    }
}

pub fn print_models(page: &Page<ModelRecord>) {
    println!("\n=== Models ({} total) ===\n", page.total);
    if page.items.is_empty() {
        println!("No models found.");
        return;
    }
    println!(
        "{:<38} {:<20} {:<10} {:<12} {:<10}",
        "Model ID", "Name", "Version", "Stage", "Recipe"
    );
    println!("{:-<95}", "");
    for m in &page.items {
        println!(
            "{:<38} {:<20} {:<10} {:<12} {:<10}",
            m.id,
            m.name,
            m.version,
            m.stage.as_str(),
            m.recipe
        );
    }
    println!();
}

pub fn print_model_detail(model: &ModelRecord) {
    println!("\n=== Model Detail ===\n");
    println!("  ID:       {}", model.id);
    println!("  Name:     {} {}", model.name, model.version);
    println!("  Stage:    {}", model.stage.as_str());
    println!("  Run:      {}", model.run_id);
    println!("  Base:     {} ({})", model.base_model, model.recipe);
    println!("  Artifact: {}", model.artifact_path);
    if !model.eval_scores.is_empty() {
        println!("\n  [Eval scores]");
        for (bench, score) in &model.eval_scores {
            println!("  {:<20} {:.3}", bench, score);
        }
    }
    println!();
}

pub fn print_evals(page: &Page<EvalRecord>) {
    println!("\n=== Evals ({} total) ===\n", page.total);
    if page.items.is_empty() {
        println!("No evals found.");
        return;
    }
    println!(
        "{:<38} {:<38} {:<12} {:<8} {:<8}",
        "Eval ID", "Model ID", "Suite", "Status", "Score"
    );
    for e in &page.items {
        println!(
            "{:<38} {:<38} {:<12} {:<8} {}",
            e.id,
            e.model_id,
            e.suite,
            e.status.as_str(),
            e.overall_score
                .map(|s| format!("{s:.3}"))
                .unwrap_or_else(|| "-".to_string())
        );
    }
    println!();
}

pub fn print_cost(estimate: &CostEstimate) {
    let b = &estimate.breakdown;
    println!("\n=== Cost Estimate ===\n");
    println!(
        "  {} GPUs x {} h @ ${:.2}/GPU-hour",
        b.gpu_count, b.hours, b.rate_per_gpu_hour
    );
    println!("  GPU cost:          ${:.2}", estimate.gpu_cost);
    println!("  Platform overhead: ${:.2}", estimate.platform_overhead);
    println!("  Total:             ${:.2}", estimate.total);
    println!();
}

pub fn print_event(ev: &Event) {
    println!("{:>6} {:<22} {}", ev.seq, ev.kind.name(), event_fields(ev));
}

/// Event payload without the `type` tag, as compact `key=value` pairs.
pub fn event_fields(ev: &Event) -> String {
    let Ok(Value::Object(map)) = serde_json::to_value(&ev.kind) else {
        return String::new();
    };
    map.iter()
        .filter(|(k, _)| k.as_str() != "type")
        .map(|(k, v)| match v {
            Value::String(s) => format!("{k}={s}"),
            other => format!("{k}={other}"),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use forge_common::EventKind;

    #[test]
    fn event_fields_drop_the_tag() {
        let ev = Event {
            seq: 3,
            at_ms: 0,
            kind: EventKind::RunAdmitted {
                run_id: "r1".into(),
                node_id: "node-01".into(),
                gpus: 4,
            },
        };
        let fields = event_fields(&ev);
        assert!(!fields.contains("type="));
        for pair in ["gpus=4", "node_id=node-01", "run_id=r1"] {
            assert!(fields.contains(pair), "{fields}");
        }
    }
}
