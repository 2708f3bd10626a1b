//! Migration script loading
//!
//! A migration is described by a JSON script listing the objects to move,
//! their relationships, and runtime settings for the execution engines.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Record operation requested for an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationKind {
    Insert,
    Update,
    Upsert,
    Delete,
    Readonly,
}

impl OperationKind {
    /// Lowercase label used in log lines and target file names
    pub fn label(&self) -> &'static str {
        match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Upsert => "upsert",
            OperationKind::Delete => "delete",
            OperationKind::Readonly => "readonly",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// Bulk ingest protocol version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BulkApiVersion {
    V1,
    V2,
}

impl BulkApiVersion {
    /// Path segment used by the bulk endpoints
    pub fn label(&self) -> &'static str {
        match self {
            BulkApiVersion::V1 => "v1",
            BulkApiVersion::V2 => "v2",
        }
    }
}

/// One object block of the migration script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectConfig {
    pub name: String,
    pub operation: OperationKind,
    /// External-id field, or several fields separated by ';'
    pub external_id: String,
    pub query: String,
    /// Lookup-id column -> referenced object name
    #[serde(default)]
    pub lookups: HashMap<String, String>,
    /// Lookup-id columns whose relationship is master-detail
    #[serde(default)]
    pub master_detail_fields: Vec<String>,
    /// Treat every field as plain data: relationships on this object are
    /// neither resolved nor rewritten
    #[serde(default)]
    pub no_relationships: bool,
    #[serde(default)]
    pub process_all_source: bool,
    #[serde(default)]
    pub process_all_target: bool,
    /// The external-id field is an auto-number: useful for matching context
    /// only, never written and never used as a target filter
    #[serde(default)]
    pub auto_number_external_id: bool,
}

/// Runtime settings shared by the whole job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Record count above which the bulk engine takes over
    pub bulk_threshold: usize,
    pub bulk_api_version: BulkApiVersion,
    /// Force the row-level engine regardless of record counts
    pub always_use_rest: bool,
    pub poll_interval_ms: u64,
    /// Records per row-level API batch
    pub rest_batch_size: usize,
    /// Records per bulk upload chunk
    pub bulk_batch_size: usize,
    /// Filter values per composed query
    pub max_values_per_query: usize,
    /// Copy engine-generated identifiers back onto source records
    pub propagate_ids: bool,
    /// Keep a per-operation result file under the target directory
    pub persist_engine_output: bool,
    /// Read Account and Contact from the merged person file
    pub merge_person_files: bool,
    /// Ask before proceeding past detected issues
    pub prompt_on_issues: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bulk_threshold: 2000,
            bulk_api_version: BulkApiVersion::V2,
            always_use_rest: false,
            poll_interval_ms: 5000,
            rest_batch_size: 200,
            bulk_batch_size: 10_000,
            max_values_per_query: crate::migration::query::DEFAULT_MAX_FILTER_VALUES,
            propagate_ids: true,
            persist_engine_output: true,
            merge_person_files: false,
            prompt_on_issues: true,
        }
    }
}

/// The whole migration script
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationScript {
    pub objects: Vec<ObjectConfig>,
    #[serde(default)]
    pub settings: Settings,
}

impl MigrationScript {
    /// Load and validate a script file
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read migration script {}", path.display()))?;
        let script: MigrationScript = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse migration script {}", path.display()))?;
        script.validate()?;
        Ok(script)
    }

    fn validate(&self) -> Result<()> {
        if self.objects.is_empty() {
            bail!("Migration script declares no objects");
        }
        let mut seen = std::collections::HashSet::new();
        for object in &self.objects {
            if !seen.insert(object.name.as_str()) {
                bail!("Object '{}' is declared more than once", object.name);
            }
            if object.external_id.trim().is_empty() {
                bail!("Object '{}' has an empty external id", object.name);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_script() {
        let raw = r#"{
            "objects": [
                {
                    "name": "Account",
                    "operation": "Upsert",
                    "externalId": "Name",
                    "query": "select Id, Name from Account"
                }
            ]
        }"#;
        let script: MigrationScript = serde_json::from_str(raw).unwrap();
        script.validate().unwrap();

        assert_eq!(script.objects.len(), 1);
        assert_eq!(script.objects[0].operation, OperationKind::Upsert);
        assert_eq!(script.settings.bulk_threshold, 2000);
        assert_eq!(script.settings.bulk_api_version, BulkApiVersion::V2);
    }

    #[test]
    fn test_parse_lookups_and_settings() {
        let raw = r#"{
            "objects": [
                {
                    "name": "Contact",
                    "operation": "Insert",
                    "externalId": "Email",
                    "query": "select Id, Email, AccountId from Contact",
                    "lookups": { "AccountId": "Account" },
                    "masterDetailFields": ["AccountId"]
                }
            ],
            "settings": { "bulkThreshold": 10, "alwaysUseRest": true }
        }"#;
        let script: MigrationScript = serde_json::from_str(raw).unwrap();

        let object = &script.objects[0];
        assert_eq!(object.lookups.get("AccountId").unwrap(), "Account");
        assert_eq!(object.master_detail_fields, vec!["AccountId"]);
        assert_eq!(script.settings.bulk_threshold, 10);
        assert!(script.settings.always_use_rest);
        // Untouched settings keep their defaults
        assert_eq!(script.settings.rest_batch_size, 200);
    }

    #[test]
    fn test_duplicate_object_rejected() {
        let raw = r#"{
            "objects": [
                { "name": "Account", "operation": "Insert", "externalId": "Name", "query": "select Id from Account" },
                { "name": "Account", "operation": "Update", "externalId": "Name", "query": "select Id from Account" }
            ]
        }"#;
        let script: MigrationScript = serde_json::from_str(raw).unwrap();
        assert!(script.validate().is_err());
    }
}
