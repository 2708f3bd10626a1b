//! Accumulated migration issues and their report files
//!
//! Structural file defects, repair fallout and unresolved parent lookups are
//! collected here instead of being raised: they feed the confirm-or-abort
//! decision points and the two fixed-name report files.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// One structural or repair defect found in a source file
#[derive(Debug, Clone, Serialize)]
pub struct StructuralIssue {
    #[serde(rename = "Date")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ChildObject")]
    pub child_entity: String,
    #[serde(rename = "ChildField")]
    pub child_field: String,
    #[serde(rename = "ChildValue")]
    pub child_value: String,
    #[serde(rename = "ParentObject")]
    pub parent_entity: String,
    #[serde(rename = "ParentField")]
    pub parent_field: String,
    #[serde(rename = "ParentValue")]
    pub parent_value: String,
    #[serde(rename = "Error")]
    pub error: String,
}

impl StructuralIssue {
    /// Issue local to one entity/field, with no parent side
    pub fn for_field(entity: &str, field: &str, error: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            child_entity: entity.to_string(),
            child_field: field.to_string(),
            child_value: String::new(),
            parent_entity: String::new(),
            parent_field: String::new(),
            parent_value: String::new(),
            error: error.into(),
        }
    }

    /// Issue relating a child row to a parent it could not resolve
    pub fn for_relation(
        child_entity: &str,
        child_field: &str,
        child_value: &str,
        parent_entity: &str,
        parent_field: &str,
        parent_value: &str,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            child_entity: child_entity.to_string(),
            child_field: child_field.to_string(),
            child_value: child_value.to_string(),
            parent_entity: parent_entity.to_string(),
            parent_field: parent_field.to_string(),
            parent_value: parent_value.to_string(),
            error: error.into(),
        }
    }
}

/// One unresolved parent lookup observed during the write phase
#[derive(Debug, Clone, Serialize)]
pub struct MissingParentIssue {
    #[serde(rename = "Object")]
    pub entity: String,
    #[serde(rename = "Field")]
    pub field: String,
    #[serde(rename = "MissingValue")]
    pub value: String,
    #[serde(rename = "Count")]
    pub count: usize,
}

/// Job-wide issue accumulator
#[derive(Debug, Default)]
pub struct IssueLog {
    csv_issues: Vec<StructuralIssue>,
    missing_parents: HashMap<(String, String, String), usize>,
}

impl IssueLog {
    pub fn record(&mut self, issue: StructuralIssue) {
        log::debug!(
            "csv issue on {}.{}: {}",
            issue.child_entity,
            issue.child_field,
            issue.error
        );
        self.csv_issues.push(issue);
    }

    /// Count one unresolved parent lookup, aggregated per (entity, field,
    /// missing value)
    pub fn record_missing_parent(&mut self, entity: &str, field: &str, value: &str) {
        *self
            .missing_parents
            .entry((entity.to_string(), field.to_string(), value.to_string()))
            .or_insert(0) += 1;
    }

    pub fn csv_issue_count(&self) -> usize {
        self.csv_issues.len()
    }

    pub fn csv_issues(&self) -> &[StructuralIssue] {
        &self.csv_issues
    }

    pub fn missing_parent_count(&self) -> usize {
        self.missing_parents.values().sum()
    }

    pub fn missing_parents(&self) -> Vec<MissingParentIssue> {
        let mut issues: Vec<MissingParentIssue> = self
            .missing_parents
            .iter()
            .map(|((entity, field, value), count)| MissingParentIssue {
                entity: entity.clone(),
                field: field.clone(),
                value: value.clone(),
                count: *count,
            })
            .collect();
        issues.sort_by(|a, b| {
            (&a.entity, &a.field, &a.value).cmp(&(&b.entity, &b.field, &b.value))
        });
        issues
    }

    /// Write the structural-issue report, replacing any previous file
    pub fn write_csv_issues_report(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create issue report {}", path.display()))?;
        for issue in &self.csv_issues {
            writer.serialize(issue)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Write the missing-parent report, replacing any previous file
    pub fn write_missing_parents_report(&self, path: &Path) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)
            .with_context(|| format!("Failed to create missing-parent report {}", path.display()))?;
        for issue in self.missing_parents() {
            writer.serialize(&issue)?;
        }
        writer.flush()?;
        Ok(())
    }
}
