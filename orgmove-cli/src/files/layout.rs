//! File and directory naming conventions for a migration root
//!
//! Source-prepared files live under `source/`, generated target files under
//! `target/` with the operation suffixed, and the mapping inputs and issue
//! reports sit at the root under fixed names.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::config::OperationKind;

pub const SOURCE_DIR: &str = "source";
pub const TARGET_DIR: &str = "target";
pub const VALUE_MAPPING_FILE: &str = "ValueMapping.csv";
pub const FIELD_MAPPING_FILE: &str = "FieldMapping.csv";
pub const CSV_ISSUES_REPORT: &str = "CsvIssuesReport.csv";
pub const MISSING_PARENTS_REPORT: &str = "MissingParentRecordsReport.csv";

/// Merged input carrying both person entities when enabled
pub const MERGED_PERSON_FILE: &str = "Accounts_Contacts.csv";
const PERSON_ENTITIES: [&str; 2] = ["Account", "Contact"];

/// Resolves every path the job reads or writes
#[derive(Debug, Clone)]
pub struct FileLayout {
    root: PathBuf,
    merge_person_files: bool,
}

impl FileLayout {
    pub fn new(root: impl Into<PathBuf>, merge_person_files: bool) -> Self {
        Self {
            root: root.into(),
            merge_person_files,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join(SOURCE_DIR)
    }

    pub fn target_dir(&self) -> PathBuf {
        self.root.join(TARGET_DIR)
    }

    /// Source file for an entity. The two person entities share one merged
    /// file when that mode is on.
    pub fn source_file(&self, entity: &str) -> PathBuf {
        if self.merge_person_files && PERSON_ENTITIES.contains(&entity) {
            return self.source_dir().join(MERGED_PERSON_FILE);
        }
        self.source_dir().join(format!("{}.csv", entity))
    }

    /// Target output file, suffixed by the lowercase operation name
    pub fn target_file(&self, entity: &str, operation: OperationKind) -> PathBuf {
        self.target_dir()
            .join(format!("{}_{}.csv", entity, operation.label()))
    }

    /// Per-operation engine result file
    pub fn engine_result_file(&self, entity: &str, operation: OperationKind) -> PathBuf {
        self.target_dir()
            .join(format!("{}_{}_result.csv", entity, operation.label()))
    }

    pub fn value_mapping_file(&self) -> PathBuf {
        self.root.join(VALUE_MAPPING_FILE)
    }

    pub fn field_mapping_file(&self) -> PathBuf {
        self.root.join(FIELD_MAPPING_FILE)
    }

    pub fn csv_issues_report(&self) -> PathBuf {
        self.root.join(CSV_ISSUES_REPORT)
    }

    pub fn missing_parents_report(&self) -> PathBuf {
        self.root.join(MISSING_PARENTS_REPORT)
    }

    /// Create the source and target directories if absent
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [self.source_dir(), self.target_dir()] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create directory {}", dir.display()))?;
        }
        Ok(())
    }
}
