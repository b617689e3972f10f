use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ParseEnumError;

/// Lifecycle stage of a registered model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModelStage {
    #[default]
    Staging,
    Candidate,
    Production,
    Archived,
}

impl ModelStage {
    pub fn as_str(self) -> &'static str {
        match self {
            ModelStage::Staging => "staging",
            ModelStage::Candidate => "candidate",
            ModelStage::Production => "production",
            ModelStage::Archived => "archived",
        }
    }
}

impl std::fmt::Display for ModelStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ModelStage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "staging" => Ok(ModelStage::Staging),
            "candidate" => Ok(ModelStage::Candidate),
            "production" => Ok(ModelStage::Production),
            "archived" => Ok(ModelStage::Archived),
            other => Err(ParseEnumError::new("model stage", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelPromote {
    pub run_id: String,
    pub name: String,
    pub version: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub target_stage: ModelStage,

    /// Reject the promotion when the latest passed eval of this run scores lower.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_eval_score: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageChange {
    pub stage: ModelStage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelRecord {
    pub id: String,
    pub run_id: String,
    pub name: String,
    pub version: String,
    pub description: String,
    pub stage: ModelStage,
    pub base_model: String,
    pub recipe: String,
    pub artifact_path: String,

    #[serde(default)]
    pub eval_scores: BTreeMap<String, f64>,

    pub promoted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EvalStatus {
    Passed,
    Failed,
}

impl EvalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EvalStatus::Passed => "passed",
            EvalStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EvalStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "passed" => Ok(EvalStatus::Passed),
            "failed" => Ok(EvalStatus::Failed),
            other => Err(ParseEnumError::new("eval status", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalResult {
    pub benchmark: String,
    pub score: f64,
    pub passed: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

/// Results pushed by the external evaluator once a suite finishes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalReport {
    pub model_id: String,

    #[serde(default = "default_suite")]
    pub suite: String,

    pub results: Vec<EvalResult>,
}

fn default_suite() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EvalRecord {
    pub id: String,
    pub model_id: String,
    pub suite: String,
    pub status: EvalStatus,
    pub results: Vec<EvalResult>,
    pub overall_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}
