//! Scalar value representation for migrated records

use serde::{Deserialize, Serialize};

/// A single cell value, as read from a CSV file or the org Web API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// Null/empty value
    Null,
    /// String value
    String(String),
    /// Whole number
    Int(i64),
    /// Floating point
    Float(f64),
    /// Boolean
    Bool(bool),
}

impl Value {
    /// Parse a CSV cell. Cells stay textual so identifiers like "00123"
    /// survive a round trip unchanged; only the empty string maps to Null.
    pub fn from_csv(cell: &str) -> Self {
        if cell.is_empty() {
            Value::Null
        } else {
            Value::String(cell.to_string())
        }
    }

    /// Parse from a JSON value returned by the org Web API
    pub fn from_json(json: &serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(f) = n.as_f64() {
                    Value::Float(f)
                } else {
                    Value::Null
                }
            }
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(_) | serde_json::Value::Object(_) => {
                // Nested results (relationship sub-objects) are flattened
                // elsewhere; anything left is carried as raw text
                Value::String(json.to_string())
            }
        }
    }

    /// Convert to JSON value for API payloads
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Int(i) => serde_json::json!(*i),
            Value::Float(f) => serde_json::json!(*f),
            Value::Bool(b) => serde_json::Value::Bool(*b),
        }
    }

    /// Canonical text form used for identifier matching and CSV output.
    /// Null renders as the empty string.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::String(s) => s.clone(),
            Value::Int(i) => i.to_string(),
            Value::Float(f) => f.to_string(),
            Value::Bool(b) => b.to_string(),
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "(null)"),
            Value::String(s) => write!(f, "{}", s),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(fl) => write!(f, "{}", fl),
            Value::Bool(b) => write!(f, "{}", b),
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::Null
    }
}
