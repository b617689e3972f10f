use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::ParseEnumError;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    /// Completed, failed (after the retry budget) and cancelled runs never change again.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RunStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(ParseEnumError::new("run status", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum Recipe {
    #[default]
    LoraSft,
    Dpo,
    Rlhf,
}

impl Recipe {
    pub fn as_str(self) -> &'static str {
        match self {
            Recipe::LoraSft => "lora_sft",
            Recipe::Dpo => "dpo",
            Recipe::Rlhf => "rlhf",
        }
    }

    /// Default hyper-parameters for the recipe.
    pub fn default_config(self) -> Map<String, Value> {
        let v = match self {
            Recipe::LoraSft => json!({
                "r": 16,
                "lora_alpha": 32,
                "lora_dropout": 0.05,
                "learning_rate": 2e-4,
                "batch_size": 4,
                "gradient_accumulation_steps": 8,
                "num_epochs": 1,
                "warmup_ratio": 0.03,
                "max_seq_length": 2048,
            }),
            Recipe::Dpo => json!({
                "beta": 0.1,
                "learning_rate": 5e-5,
                "batch_size": 2,
                "gradient_accumulation_steps": 4,
                "num_epochs": 1,
                "max_prompt_length": 512,
                "max_length": 1024,
            }),
            Recipe::Rlhf => json!({
                "reward_model": null,
                "ppo_epochs": 4,
                "learning_rate": 1.5e-5,
                "batch_size": 4,
                "kl_penalty": 0.2,
                "clip_range": 0.2,
            }),
        };
        match v {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    /// Recipe defaults with `overrides` applied on top (shallow merge).
    pub fn resolve_config(self, overrides: &Map<String, Value>) -> Map<String, Value> {
        let mut base = self.default_config();
        for (k, v) in overrides {
            base.insert(k.clone(), v.clone());
        }
        base
    }
}

impl std::fmt::Display for Recipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Recipe {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lora_sft" => Ok(Recipe::LoraSft),
            "dpo" => Ok(Recipe::Dpo),
            "rlhf" => Ok(Recipe::Rlhf),
            other => Err(ParseEnumError::new("recipe", other)),
        }
    }
}

/// Launch command issued by the dashboard or CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunLaunch {
    pub name: String,
    pub base_model: String,
    pub dataset_id: String,

    #[serde(default)]
    pub recipe: Recipe,

    #[serde(default)]
    pub config_overrides: Map<String, Value>,

    #[serde(default = "default_gpu_count", alias = "num_gpus")]
    pub gpu_count: u32,

    /// Lower value is scheduled first.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub tags: Vec<String>,

    /// Falls back to the scheduler's configured default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

fn default_gpu_count() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunRecord {
    pub id: String,
    pub name: String,
    pub base_model: String,
    pub dataset_id: String,
    pub recipe: Recipe,
    pub config: Map<String, Value>,
    pub tags: Vec<String>,
    pub gpu_count: u32,
    pub priority: i32,
    pub status: RunStatus,
    pub assigned_node: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,

    /// Set while the run cannot fit on any registered node.
    #[serde(default)]
    pub unschedulable: bool,

    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Failure report from the node agent executing a run.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunFailure {
    #[serde(default)]
    pub reason: String,
}

/// One training step as reported by the executing node.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMetricPoint {
    pub step: u64,
    pub loss: f64,
    pub learning_rate: f64,
    pub epoch: f64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gpu_memory_mb: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throughput_samples_sec: Option<f64>,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}
