use std::collections::HashMap;

use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use forge_common::{
    EvalRecord, EvalReport, EvalStatus, ModelPromote, ModelRecord, ModelStage, RunRecord,
    RunStatus,
};

use crate::error::{Result, SchedulerError};

/// Models promoted from completed runs and the eval results reported against them.
#[derive(Debug, Default)]
pub struct ModelRegistry {
    models: Vec<ModelRecord>,
    by_id: HashMap<String, usize>,
    evals: Vec<EvalRecord>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn promote(&mut self, run: &RunRecord, req: ModelPromote) -> Result<ModelRecord> {
        if req.name.trim().is_empty() || req.version.trim().is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "name and version must not be empty".into(),
            ));
        }
        if run.status != RunStatus::Completed {
            return Err(SchedulerError::Conflict(format!(
                "cannot promote from run '{}': status is '{}', expected 'completed'",
                run.id, run.status
            )));
        }
        if self
            .models
            .iter()
            .any(|m| m.name == req.name && m.version == req.version)
        {
            return Err(SchedulerError::Conflict(format!(
                "model '{}' version '{}' already exists",
                req.name, req.version
            )));
        }
        if let Some(required) = req.min_eval_score {
            if let Some(score) = self.latest_passed_score(&run.id) {
                if score < required {
                    return Err(SchedulerError::EvalGate {
                        run_id: run.id.clone(),
                        score,
                        required,
                    });
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let record = ModelRecord {
            artifact_path: format!("./model_registry/{id}"),
            id,
            run_id: run.id.clone(),
            name: req.name,
            version: req.version,
            description: req.description,
            stage: req.target_stage,
            base_model: run.base_model.clone(),
            recipe: run.recipe.to_string(),
            eval_scores: Default::default(),
            promoted_at: Some(now),
            created_at: now,
        };

        info!(model_id=%record.id, run_id=%run.id, name=%record.name, version=%record.version, stage=%record.stage, "model promoted");
        self.by_id.insert(record.id.clone(), self.models.len());
        self.models.push(record.clone());
        Ok(record)
    }

    /// Archived is terminal. Entering production stamps `promoted_at`.
    /// Returns the updated record and the stage it left.
    pub fn set_stage(
        &mut self,
        model_id: &str,
        stage: ModelStage,
    ) -> Result<(ModelRecord, ModelStage)> {
        let model = self.model_mut(model_id)?;
        let from = model.stage;
        if from == ModelStage::Archived && stage != ModelStage::Archived {
            return Err(SchedulerError::InvalidStageTransition {
                model_id: model_id.to_string(),
                from: from.to_string(),
                to: stage.to_string(),
            });
        }

        model.stage = stage;
        if stage == ModelStage::Production {
            model.promoted_at = Some(Utc::now());
        }

        info!(model_id, from=%from, to=%stage, "model stage changed");
        Ok((model.clone(), from))
    }

    /// Passed iff every benchmark passed; overall score is the mean.
    pub fn record_eval(&mut self, report: EvalReport) -> Result<EvalRecord> {
        if report.results.is_empty() {
            return Err(SchedulerError::InvalidRequest(
                "eval report has no results".into(),
            ));
        }
        if let Some(bad) = report.results.iter().find(|r| !r.score.is_finite()) {
            return Err(SchedulerError::InvalidRequest(format!(
                "benchmark '{}' has a non-finite score",
                bad.benchmark
            )));
        }

        let model = self.model_mut(&report.model_id)?;
        for r in &report.results {
            model.eval_scores.insert(r.benchmark.clone(), r.score);
        }

        let passed = report.results.iter().all(|r| r.passed);
        let overall =
            report.results.iter().map(|r| r.score).sum::<f64>() / report.results.len() as f64;

        let record = EvalRecord {
            id: Uuid::new_v4().to_string(),
            model_id: report.model_id,
            suite: report.suite,
            status: if passed {
                EvalStatus::Passed
            } else {
                EvalStatus::Failed
            },
            results: report.results,
            overall_score: Some(overall),
            created_at: Utc::now(),
        };

        info!(eval_id=%record.id, model_id=%record.model_id, suite=%record.suite, status=%record.status, overall, "eval recorded");
        self.evals.push(record.clone());
        Ok(record)
    }

    pub fn get(&self, model_id: &str) -> Result<&ModelRecord> {
        self.by_id
            .get(model_id)
            .and_then(|&i| self.models.get(i))
            .ok_or_else(|| SchedulerError::ModelNotFound(model_id.to_string()))
    }

    /// Newest first. `name` matches as a substring.
    pub fn list(&self, stage: Option<ModelStage>, name: Option<&str>) -> Vec<&ModelRecord> {
        self.models
            .iter()
            .rev()
            .filter(|m| stage.map_or(true, |s| m.stage == s))
            .filter(|m| name.map_or(true, |n| m.name.contains(n)))
            .collect()
    }

    /// Newest first.
    pub fn evals(&self, status: Option<EvalStatus>, model_id: Option<&str>) -> Vec<&EvalRecord> {
        self.evals
            .iter()
            .rev()
            .filter(|e| status.map_or(true, |s| e.status == s))
            .filter(|e| model_id.map_or(true, |id| e.model_id == id))
            .collect()
    }

    fn latest_passed_score(&self, run_id: &str) -> Option<f64> {
        self.evals
            .iter()
            .rev()
            .filter(|e| e.status == EvalStatus::Passed)
            .find(|e| {
                self.get(&e.model_id)
                    .map(|m| m.run_id == run_id)
                    .unwrap_or(false)
            })
            .and_then(|e| e.overall_score)
    }

    fn model_mut(&mut self, model_id: &str) -> Result<&mut ModelRecord> {
        self.by_id
            .get(model_id)
            .copied()
            .and_then(|i| self.models.get_mut(i))
            .ok_or_else(|| SchedulerError::ModelNotFound(model_id.to_string()))
    }
}
