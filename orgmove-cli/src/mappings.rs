//! Value-mapping and field-mapping input files
//!
//! Both are optional fixed-name CSV files at the migration root. Value
//! mappings rewrite stale cell encodings per (object, column); field
//! mappings rename whole objects or single columns.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct ValueMappingRow {
    #[serde(rename = "ObjectName")]
    object: String,
    #[serde(rename = "FieldName")]
    field: String,
    #[serde(rename = "RawValue")]
    raw: String,
    #[serde(rename = "Value")]
    value: String,
}

/// Rewrite rules keyed by (object, column) then raw value
#[derive(Debug, Default)]
pub struct ValueMappings {
    rules: HashMap<(String, String), HashMap<String, String>>,
}

impl ValueMappings {
    /// Load the mapping file; an absent file yields no rules
    pub fn load(path: &Path) -> Result<Self> {
        let mut mappings = Self::default();
        if !path.exists() {
            return Ok(mappings);
        }
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to read value mappings {}", path.display()))?;
        for row in reader.deserialize() {
            let row: ValueMappingRow = row
                .with_context(|| format!("Malformed value-mapping row in {}", path.display()))?;
            mappings
                .rules
                .entry((row.object, row.field))
                .or_default()
                .insert(row.raw, row.value);
        }
        Ok(mappings)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn has_entity(&self, entity: &str) -> bool {
        self.rules.keys().any(|(object, _)| object == entity)
    }

    pub fn columns_for(&self, entity: &str) -> impl Iterator<Item = &str> {
        self.rules
            .keys()
            .filter(move |(object, _)| object == entity)
            .map(|(_, column)| column.as_str())
    }

    /// Look up the mapped value for a cell. The cell is trimmed before the
    /// comparison; matching is case-sensitive. None means pass through.
    pub fn map_value(&self, entity: &str, column: &str, cell: &str) -> Option<&str> {
        self.rules
            .get(&(entity.to_string(), column.to_string()))
            .and_then(|by_raw| by_raw.get(cell.trim()))
            .map(String::as_str)
    }
}

#[derive(Debug, Deserialize)]
struct FieldMappingRow {
    #[serde(rename = "ObjectName")]
    object: String,
    #[serde(rename = "FieldName")]
    field: String,
    #[serde(rename = "Target")]
    target: String,
}

/// Object and column renames. A row with an empty FieldName renames the
/// whole object.
#[derive(Debug, Default)]
pub struct FieldMappings {
    entities: HashMap<String, String>,
    fields: HashMap<(String, String), String>,
}

impl FieldMappings {
    /// Load the mapping file; an absent file yields no renames
    pub fn load(path: &Path) -> Result<Self> {
        let mut mappings = Self::default();
        if !path.exists() {
            return Ok(mappings);
        }
        let mut reader = csv::Reader::from_path(path)
            .with_context(|| format!("Failed to read field mappings {}", path.display()))?;
        for row in reader.deserialize() {
            let row: FieldMappingRow = row
                .with_context(|| format!("Malformed field-mapping row in {}", path.display()))?;
            if row.field.trim().is_empty() {
                mappings.entities.insert(row.object, row.target);
            } else {
                mappings.fields.insert((row.object, row.field), row.target);
            }
        }
        Ok(mappings)
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.fields.is_empty()
    }

    /// Target name for an object, when renamed
    pub fn target_entity<'a>(&'a self, entity: &'a str) -> &'a str {
        self.entities
            .get(entity)
            .map(String::as_str)
            .unwrap_or(entity)
    }

    /// Target name for one column of an object, when renamed
    pub fn target_field(&self, entity: &str, field: &str) -> Option<&str> {
        self.fields
            .get(&(entity.to_string(), field.to_string()))
            .map(String::as_str)
    }
}
