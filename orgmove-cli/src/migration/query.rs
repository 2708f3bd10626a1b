//! Query template parsing and filtered query composition
//!
//! A descriptor's query template is parsed once into its parts; the composer
//! then renders either the broad template or a batch of self-contained
//! "field IN (values)" queries against it.

use regex::RegexBuilder;

/// Default ceiling on filter values per composed query
pub const DEFAULT_MAX_FILTER_VALUES: usize = 1000;

/// A parsed query template
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedQuery {
    pub fields: Vec<String>,
    pub entity: String,
    pub where_clause: Option<String>,
    pub limit: Option<u64>,
}

/// Error parsing a query template
#[derive(Debug, Clone)]
pub struct QueryParseError {
    pub template: String,
}

impl std::fmt::Display for QueryParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Malformed query template '{}'. Expected: select <fields> from <entity> [where ...] [limit n]",
            self.template
        )
    }
}

impl std::error::Error for QueryParseError {}

/// Parse a query template into fields, entity, where clause and limit
pub fn parse_query(template: &str) -> Result<ParsedQuery, QueryParseError> {
    let pattern = RegexBuilder::new(
        r"^\s*select\s+(?<fields>.+?)\s+from\s+(?<entity>\w+)(?:\s+where\s+(?<where>.+?))?(?:\s+limit\s+(?<limit>\d+))?\s*$",
    )
    .case_insensitive(true)
    .dot_matches_new_line(true)
    .build()
    .expect("query template pattern is valid");

    let captures = pattern.captures(template).ok_or_else(|| QueryParseError {
        template: template.to_string(),
    })?;

    let fields: Vec<String> = captures["fields"]
        .split(',')
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect();
    if fields.is_empty() {
        return Err(QueryParseError {
            template: template.to_string(),
        });
    }

    Ok(ParsedQuery {
        fields,
        entity: captures["entity"].to_string(),
        where_clause: captures.name("where").map(|m| m.as_str().to_string()),
        limit: captures.name("limit").and_then(|m| m.as_str().parse().ok()),
    })
}

impl ParsedQuery {
    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    /// Render the unfiltered template back into one query string
    pub fn compose_broad(&self) -> String {
        let mut query = format!("SELECT {} FROM {}", self.fields.join(", "), self.entity);
        if let Some(clause) = &self.where_clause {
            query.push_str(&format!(" WHERE {}", clause));
        }
        if let Some(limit) = self.limit {
            query.push_str(&format!(" LIMIT {}", limit));
        }
        query
    }

    /// Render a COUNT() probe matching the template's filter
    pub fn compose_count(&self) -> String {
        let mut query = format!("SELECT COUNT() FROM {}", self.entity);
        if let Some(clause) = &self.where_clause {
            query.push_str(&format!(" WHERE {}", clause));
        }
        query
    }

    /// Render filtered "field IN (values)" queries, batching the value set at
    /// `max_values`. Each query is self-contained: it carries every field the
    /// task needs plus the template's own where clause. An empty value set
    /// composes no queries.
    pub fn compose_filtered(&self, field: &str, values: &[String], max_values: usize) -> Vec<String> {
        if values.is_empty() {
            return Vec::new();
        }
        let chunk_size = max_values.max(1);
        values
            .chunks(chunk_size)
            .map(|chunk| {
                let value_list = chunk
                    .iter()
                    .map(|v| format!("'{}'", escape_value(v)))
                    .collect::<Vec<_>>()
                    .join(", ");
                let filter = format!("{} IN ({})", field, value_list);
                let combined = match &self.where_clause {
                    Some(clause) => format!("({}) AND {}", clause, filter),
                    None => filter,
                };
                format!(
                    "SELECT {} FROM {} WHERE {}",
                    self.fields.join(", "),
                    self.entity,
                    combined
                )
            })
            .collect()
    }
}

/// Escape quotes and backslashes inside a filter literal
fn escape_value(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}
