use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn default_version() -> String {
    "1.0.0".to_string()
}

fn default_format() -> String {
    "jsonl".to_string()
}

fn default_license() -> String {
    "unknown".to_string()
}

/// Registration request for a training dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRegister {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub source_path: String,

    #[serde(default = "default_format")]
    pub format: String,

    #[serde(default)]
    pub description: String,

    #[serde(default = "default_license")]
    pub license: String,

    #[serde(default)]
    pub pii_checked: bool,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u64>,

    /// The dataset this one was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_dataset_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DatasetRecord {
    pub id: String,
    pub name: String,
    pub version: String,
    pub source_path: String,
    pub format: String,
    pub description: String,
    pub license: String,
    pub pii_checked: bool,
    pub tags: Vec<String>,
    pub row_count: Option<u64>,
    pub parent_dataset_id: Option<String>,
    /// Short sha256 fingerprint taken at registration.
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

/// Result of checking a dataset's field names for personal data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PiiScan {
    pub dataset_id: String,
    pub fields_checked: usize,
    pub flagged_fields: Vec<String>,
    pub pii_risk: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_fills_defaults() {
        let req: DatasetRegister = serde_json::from_value(serde_json::json!({
            "name": "alpaca",
            "source_path": "s3://data/alpaca.jsonl"
        }))
        .unwrap();
        assert_eq!(req.version, "1.0.0");
        assert_eq!(req.format, "jsonl");
        assert_eq!(req.license, "unknown");
        assert!(!req.pii_checked);
        assert!(req.parent_dataset_id.is_none());
    }
}
