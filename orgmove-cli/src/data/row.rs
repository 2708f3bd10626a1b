//! Order-preserving record rows
//!
//! Column sets differ per entity and evolve during file repair, so a row is
//! an ordered column -> value mapping rather than a fixed struct.

use indexmap::IndexMap;

use super::Value;

/// One record, as an ordered mapping of column name to value
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    columns: IndexMap<String, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self {
            columns: IndexMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.columns.get(name)
    }

    /// Text form of a cell; None when the column is absent or null
    pub fn text(&self, name: &str) -> Option<String> {
        match self.columns.get(name) {
            None | Some(Value::Null) => None,
            Some(v) => Some(v.to_text()),
        }
    }

    /// Set a cell, appending the column at the end if it is new
    pub fn set(&mut self, name: impl Into<String>, value: Value) {
        self.columns.insert(name.into(), value);
    }

    /// Rename a column in place, preserving its position
    pub fn rename_column(&mut self, old: &str, new: &str) {
        if old == new {
            return;
        }
        if let Some(index) = self.columns.get_index_of(old) {
            let (_, value) = self.columns.shift_remove_index(index).unwrap();
            self.columns.shift_insert(index, new.to_string(), value);
        }
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.keys().map(|k| k.as_str())
    }

    /// Build a row from a flat JSON object, flattening one level of nested
    /// relationship sub-objects into dotted columns ("Account.Name")
    pub fn from_json_object(object: &serde_json::Map<String, serde_json::Value>) -> Self {
        let mut row = Row::new();
        for (key, value) in object {
            match value {
                serde_json::Value::Object(nested) => {
                    for (nested_key, nested_value) in nested {
                        row.set(
                            format!("{}.{}", key, nested_key),
                            Value::from_json(nested_value),
                        );
                    }
                }
                other => row.set(key.clone(), Value::from_json(other)),
            }
        }
        row
    }

    /// Serialize the row as a JSON object for an API payload, columns in
    /// row order
    pub fn to_json_object(&self) -> serde_json::Map<String, serde_json::Value> {
        self.columns
            .iter()
            .map(|(name, value)| (name.clone(), value.to_json()))
            .collect()
    }
}

impl FromIterator<(String, Value)> for Row {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self {
            columns: iter.into_iter().collect(),
        }
    }
}
