use clap::{Parser, Subcommand};

use forge_common::{EvalStatus, ModelStage, NodeHealth, Recipe, RunStatus};

#[derive(Debug, Parser)]
#[command(name = "forge")]
#[command(about = "Forge CLI for training runs and the GPU cluster", long_about = None)]
pub struct Args {
    /// Scheduler URL
    #[arg(long, env = "FORGE_URL", default_value = "http://127.0.0.1:8000")]
    pub url: String,

    /// API token (Authorization: Bearer)
    #[arg(long, env = "FORGE_TOKEN")]
    pub token: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Cluster overview and cost estimates
    Cluster {
        #[command(subcommand)]
        subcommand: ClusterCommand,
    },
    /// GPU node management
    Node {
        #[command(subcommand)]
        subcommand: NodeCommand,
    },
    /// Training runs
    Run {
        #[command(subcommand)]
        subcommand: RunCommand,
    },
    /// Dataset registry
    Dataset {
        #[command(subcommand)]
        subcommand: DatasetCommand,
    },
    /// Model registry
    Model {
        #[command(subcommand)]
        subcommand: ModelCommand,
    },
    /// Evaluation results
    Eval {
        #[command(subcommand)]
        subcommand: EvalCommand,
    },
    /// Print the observability feed
    Events {
        /// Only events with a sequence number above this one
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        limit: Option<usize>,
        /// Keep the connection open and print events as they happen
        #[arg(long, short)]
        follow: bool,
    },
    /// Show current auth identity
    Whoami,
}

#[derive(Debug, Subcommand)]
pub enum ClusterCommand {
    /// Show nodes, capacity and burn rate
    Status,
    /// Estimate the cost of a run
    Cost {
        #[arg(long)]
        gpus: u32,
        #[arg(long)]
        hours: f64,
        #[arg(long)]
        spot: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum NodeCommand {
    List {
        #[arg(long)]
        status: Option<NodeHealth>,
    },
    Get {
        node_id: String,
    },
    /// Register a node with the scheduler
    Register {
        node_id: String,
        #[arg(long)]
        gpus: u32,
        #[arg(long, default_value = "A100")]
        gpu_type: String,
        #[arg(long)]
        spot: bool,
    },
    /// Remove an idle node
    Decommission {
        node_id: String,
    },
    /// Send one heartbeat on behalf of a node
    Heartbeat {
        node_id: String,
        #[arg(long, default_value_t = 0.0)]
        gpu_util: f64,
        #[arg(long, default_value_t = 0.0)]
        mem_util: f64,
        /// Report a failed local health check
        #[arg(long)]
        unhealthy: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum RunCommand {
    List {
        #[arg(long)]
        status: Option<RunStatus>,
        #[arg(long)]
        recipe: Option<Recipe>,
    },
    Get {
        run_id: String,
    },
    /// Submit a training run to the queue
    Launch {
        #[arg(long)]
        name: String,
        #[arg(long)]
        base_model: String,
        #[arg(long)]
        dataset: String,
        #[arg(long, default_value = "lora_sft")]
        recipe: Recipe,
        #[arg(long, default_value_t = 1)]
        gpus: u32,
        /// Lower value runs first
        #[arg(long, default_value_t = 0)]
        priority: i32,
        #[arg(long)]
        max_retries: Option<u32>,
        /// Tags (comma separated)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        /// Recipe config override, `key=value` (repeatable)
        #[arg(long = "set", value_parser = parse_override)]
        overrides: Vec<(String, serde_json::Value)>,
    },
    Cancel {
        run_id: String,
    },
    /// Report a run as finished (node agent)
    Complete {
        run_id: String,
    },
    /// Report a run failure (node agent)
    Fail {
        run_id: String,
        #[arg(long, default_value = "")]
        reason: String,
    },
    /// Show the training metrics series
    Metrics {
        run_id: String,
        #[arg(long)]
        last_n: Option<usize>,
    },
}

#[derive(Debug, Subcommand)]
pub enum DatasetCommand {
    List {
        /// Name substring
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        version: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    Get {
        dataset_id: String,
    },
    /// Register a dataset; name and version must be unique
    Register {
        #[arg(long)]
        name: String,
        #[arg(long)]
        source: String,
        #[arg(long, default_value = "1.0.0")]
        version: String,
        #[arg(long, default_value = "jsonl")]
        format: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "unknown")]
        license: String,
        #[arg(long)]
        pii_checked: bool,
        /// Tags (comma separated)
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
        #[arg(long)]
        rows: Option<u64>,
        /// Dataset this one was derived from
        #[arg(long)]
        parent: Option<String>,
    },
    /// Show the dataset and its ancestors
    Lineage {
        dataset_id: String,
    },
    /// Flag field names that look like personal data
    ScanPii {
        dataset_id: String,
        #[arg(required = true)]
        fields: Vec<String>,
    },
    Delete {
        dataset_id: String,
    },
}

#[derive(Debug, Subcommand)]
pub enum ModelCommand {
    List {
        #[arg(long)]
        stage: Option<ModelStage>,
        /// Name substring
        #[arg(long)]
        name: Option<String>,
    },
    Get {
        model_id: String,
    },
    /// Register the output of a completed run
    Promote {
        run_id: String,
        #[arg(long)]
        name: String,
        #[arg(long)]
        version: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "staging")]
        stage: ModelStage,
        /// Refuse promotion unless the latest passed eval scores at least this
        #[arg(long)]
        min_eval_score: Option<f64>,
    },
    /// Move a model to another lifecycle stage
    Stage {
        model_id: String,
        stage: ModelStage,
    },
}

#[derive(Debug, Subcommand)]
pub enum EvalCommand {
    List {
        #[arg(long)]
        status: Option<EvalStatus>,
        #[arg(long)]
        model_id: Option<String>,
    },
}

/// `key=value`; the value is read as JSON when it parses, otherwise as a string.
pub fn parse_override(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{raw}'"));
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn override_values_are_typed() {
        assert_eq!(
            parse_override("lora_rank=32").unwrap(),
            ("lora_rank".to_string(), json!(32))
        );
        assert_eq!(
            parse_override("scheduler=cosine").unwrap(),
            ("scheduler".to_string(), json!("cosine"))
        );
        assert!(parse_override("nokey").is_err());
        assert!(parse_override("=3").is_err());
    }

    #[test]
    fn launch_parses_enums_and_overrides() {
        let args = Args::try_parse_from([
            "forge", "run", "launch", "--name", "sft", "--base-model", "llama-3-8b",
            "--dataset", "ds-1", "--recipe", "dpo", "--gpus", "4", "--set", "beta=0.2",
            "--tags", "a,b",
        ])
        .unwrap();
        let Command::Run {
            subcommand:
                RunCommand::Launch {
                    recipe,
                    gpus,
                    overrides,
                    tags,
                    ..
                },
        } = args.command
        else {
            panic!("expected run launch");
        };
        assert_eq!(recipe, Recipe::Dpo);
        assert_eq!(gpus, 4);
        assert_eq!(overrides, vec![("beta".to_string(), json!(0.2))]);
        assert_eq!(tags, vec!["a", "b"]);
    }

    #[test]
    fn dataset_scan_takes_field_list() {
        let args = Args::try_parse_from([
            "forge", "dataset", "scan-pii", "ds-1", "email", "prompt",
        ])
        .unwrap();
        let Command::Dataset {
            subcommand: DatasetCommand::ScanPii { dataset_id, fields },
        } = args.command
        else {
            panic!("expected dataset scan-pii");
        };
        assert_eq!(dataset_id, "ds-1");
        assert_eq!(fields, vec!["email", "prompt"]);
        assert!(Args::try_parse_from(["forge", "dataset", "scan-pii", "ds-1"]).is_err());
    }

    #[test]
    fn run_list_accepts_recipe() {
        let args = Args::try_parse_from(["forge", "run", "list", "--recipe", "dpo"]).unwrap();
        let Command::Run {
            subcommand: RunCommand::List { recipe, status },
        } = args.command
        else {
            panic!("expected run list");
        };
        assert_eq!(recipe, Some(Recipe::Dpo));
        assert!(status.is_none());
        assert!(Args::try_parse_from(["forge", "run", "list", "--recipe", "ppo"]).is_err());
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(Args::try_parse_from(["forge", "run", "list", "--status", "zombie"]).is_err());
    }
}
