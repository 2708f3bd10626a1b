//! Migration tasks and their per-endpoint record indexes

use std::collections::HashMap;

use crate::data::Row;

use super::descriptor::{EXTERNAL_ID_SEPARATOR, EntityDescriptor};

/// Which endpoint a task bucket belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Source,
    Target,
}

/// Identifier indexes accumulated for one task on one endpoint.
///
/// Identifier -> record is first-write-wins: rediscovering a known id never
/// replaces its record and never recounts it. External-id value -> identifier
/// is last-write-wins.
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    by_id: HashMap<String, Row>,
    id_by_external: HashMap<String, String>,
    new_records: usize,
}

impl RecordIndex {
    /// Apply the uniform index-update rule for one fetched record.
    /// Returns true when the identifier was new.
    pub fn absorb(&mut self, id: String, external_value: Option<String>, record: Row) -> bool {
        if let Some(external) = external_value {
            if !external.is_empty() {
                self.id_by_external.insert(external, id.clone());
            }
        }
        if self.by_id.contains_key(&id) {
            return false;
        }
        self.by_id.insert(id, record);
        self.new_records += 1;
        true
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn new_records(&self) -> usize {
        self.new_records
    }

    pub fn contains_id(&self, id: &str) -> bool {
        self.by_id.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Row> {
        self.by_id.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Row> {
        self.by_id.get_mut(id)
    }

    pub fn id_for_external(&self, external: &str) -> Option<&str> {
        self.id_by_external.get(external).map(String::as_str)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.by_id.keys().map(String::as_str)
    }

    pub fn external_values(&self) -> impl Iterator<Item = &str> {
        self.id_by_external.keys().map(String::as_str)
    }

    pub fn records(&self) -> impl Iterator<Item = (&str, &Row)> {
        self.by_id.iter().map(|(id, row)| (id.as_str(), row))
    }
}

/// One entity bound to the running job, with its two endpoint buckets
#[derive(Debug, Clone)]
pub struct MigrationTask {
    pub descriptor: EntityDescriptor,
    pub source: RecordIndex,
    pub target: RecordIndex,
}

impl MigrationTask {
    pub fn new(descriptor: EntityDescriptor) -> Self {
        Self {
            descriptor,
            source: RecordIndex::default(),
            target: RecordIndex::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn index_mut(&mut self, side: Side) -> &mut RecordIndex {
        match side {
            Side::Source => &mut self.source,
            Side::Target => &mut self.target,
        }
    }

    /// Compute a record's external-id value: the external-id field's text, or
    /// the component values joined with ';' for a composite external id.
    /// Returns None when every component is empty.
    pub fn external_value(&self, record: &Row) -> Option<String> {
        let components = self.descriptor.external_id_components();
        let values: Vec<String> = components
            .iter()
            .map(|field| record.text(field).unwrap_or_default())
            .collect();
        if values.iter().all(String::is_empty) {
            return None;
        }
        Some(values.join(&EXTERNAL_ID_SEPARATOR.to_string()))
    }

    /// Absorb fetched records into one endpoint bucket, in fetch order.
    /// Records without an identifier are skipped. Returns the count of newly
    /// discovered records.
    pub fn absorb_records(&mut self, side: Side, records: Vec<Row>) -> usize {
        let mut added = 0;
        for record in records {
            let Some(id) = record.text("Id") else {
                continue;
            };
            let external = self.external_value(&record);
            if self.index_mut(side).absorb(id, external, record) {
                added += 1;
            }
        }
        added
    }
}
