use std::collections::HashSet;

use chrono::Utc;
use sha2::{Digest, Sha256};
use tracing::info;
use uuid::Uuid;

use forge_common::{DatasetRecord, DatasetRegister, PiiScan};

use crate::error::{Result, SchedulerError};

const PII_PATTERNS: [&str; 7] = [
    "social_security",
    "ssn",
    "credit_card",
    "passport",
    "phone_number",
    "email_address",
    "date_of_birth",
];

/// Optional listing filters; `name` matches as a substring, `version` and `tag` exactly.
#[derive(Debug, Default, Clone, Copy)]
pub struct DatasetFilter<'a> {
    pub name: Option<&'a str>,
    pub version: Option<&'a str>,
    pub tag: Option<&'a str>,
}

/// Registered training datasets, unique by name and version.
#[derive(Debug, Default)]
pub struct DatasetRegistry {
    datasets: Vec<DatasetRecord>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, req: DatasetRegister) -> Result<DatasetRecord> {
        for (field, value) in [
            ("name", &req.name),
            ("version", &req.version),
            ("source_path", &req.source_path),
        ] {
            if value.trim().is_empty() {
                return Err(SchedulerError::InvalidRequest(format!(
                    "{field} must not be empty"
                )));
            }
        }
        if self
            .datasets
            .iter()
            .any(|d| d.name == req.name && d.version == req.version)
        {
            return Err(SchedulerError::Conflict(format!(
                "dataset '{}' version '{}' already exists",
                req.name, req.version
            )));
        }
        if let Some(parent) = &req.parent_dataset_id {
            self.get(parent)?;
        }

        let created_at = Utc::now();
        let digest = Sha256::digest(format!("{}{}", req.source_path, created_at.to_rfc3339()));
        let mut checksum = format!("{digest:x}");
        checksum.truncate(16);

        let record = DatasetRecord {
            id: Uuid::new_v4().to_string(),
            name: req.name,
            version: req.version,
            source_path: req.source_path,
            format: req.format,
            description: req.description,
            license: req.license,
            pii_checked: req.pii_checked,
            tags: req.tags,
            row_count: req.row_count,
            parent_dataset_id: req.parent_dataset_id,
            checksum,
            created_at,
        };

        info!(dataset_id=%record.id, name=%record.name, version=%record.version, "dataset registered");
        self.datasets.push(record.clone());
        Ok(record)
    }

    pub fn get(&self, dataset_id: &str) -> Result<&DatasetRecord> {
        self.datasets
            .iter()
            .find(|d| d.id == dataset_id)
            .ok_or_else(|| SchedulerError::DatasetNotFound(dataset_id.to_string()))
    }

    /// Newest first.
    pub fn list(&self, filter: DatasetFilter<'_>) -> Vec<&DatasetRecord> {
        self.datasets
            .iter()
            .rev()
            .filter(|d| filter.name.map_or(true, |n| d.name.contains(n)))
            .filter(|d| filter.version.map_or(true, |v| d.version == v))
            .filter(|d| filter.tag.map_or(true, |t| d.tags.iter().any(|x| x == t)))
            .collect()
    }

    /// The dataset followed by its ancestors. Stops at a parent that was deleted.
    pub fn lineage(&self, dataset_id: &str) -> Result<Vec<DatasetRecord>> {
        let mut chain = vec![self.get(dataset_id)?.clone()];
        let mut seen = HashSet::from([dataset_id.to_string()]);

        while let Some(parent) = chain.last().and_then(|d| d.parent_dataset_id.clone()) {
            if !seen.insert(parent.clone()) {
                break;
            }
            match self.get(&parent) {
                Ok(d) => chain.push(d.clone()),
                Err(_) => break,
            }
        }
        Ok(chain)
    }

    pub fn scan_pii(&self, dataset_id: &str, fields: &[String]) -> Result<PiiScan> {
        self.get(dataset_id)?;
        let flagged_fields: Vec<String> = fields
            .iter()
            .filter(|f| is_pii_field(f))
            .cloned()
            .collect();

        Ok(PiiScan {
            dataset_id: dataset_id.to_string(),
            fields_checked: fields.len(),
            pii_risk: !flagged_fields.is_empty(),
            flagged_fields,
        })
    }

    /// Callers check that no run still references the dataset.
    pub fn remove(&mut self, dataset_id: &str) -> Result<DatasetRecord> {
        let pos = self
            .datasets
            .iter()
            .position(|d| d.id == dataset_id)
            .ok_or_else(|| SchedulerError::DatasetNotFound(dataset_id.to_string()))?;
        let record = self.datasets.remove(pos);
        info!(dataset_id, name=%record.name, version=%record.version, "dataset deleted");
        Ok(record)
    }
}

fn is_pii_field(field: &str) -> bool {
    let normalized = field.to_lowercase().replace(['-', ' '], "_");
    PII_PATTERNS.iter().any(|p| normalized.contains(p))
}
