//! Execution engines for the write phase
//!
//! The actual create/update/delete traffic against a target org is
//! delegated to one of two engines: a bulk engine driving the org's
//! asynchronous ingest jobs, or a row engine submitting synchronous
//! batches. The selector picks one per operation from the configured
//! thresholds. Neither engine retries; a failed job surfaces as
//! [`EngineError`] and is fatal to the migration.

mod bulk;
mod progress;
mod rest;

pub use progress::{MessageKind, ProgressEvent};

use std::path::PathBuf;
use std::time::Duration;

use crate::api::OrgClient;
use crate::config::{OperationKind, Settings};
use crate::data::Row;
use crate::files::cache::write_records;

/// Progress callback handed to [`ExecutionEngine::execute`]
pub type ProgressSink<'a> = &'a mut dyn FnMut(ProgressEvent);

/// Fatal failure signal from an execution engine
#[derive(Debug)]
pub enum EngineError {
    JobFailed {
        entity: String,
        operation: OperationKind,
        message: String,
    },
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::JobFailed {
                entity,
                operation,
                message,
            } => write!(f, "{} of {} failed: {}", operation, entity, message),
        }
    }
}

impl std::error::Error for EngineError {}

/// Construction parameters shared by both engines
#[derive(Debug)]
pub struct EngineParams<'a> {
    pub client: &'a OrgClient,
    pub entity: String,
    pub operation: OperationKind,
    pub poll_interval: Duration,
    /// Copy generated identifiers back onto the returned records
    pub propagate_ids: bool,
    pub output_path: PathBuf,
    pub persist_output: bool,
}

impl EngineParams<'_> {
    fn failure(&self, message: impl Into<String>) -> EngineError {
        EngineError::JobFailed {
            entity: self.entity.clone(),
            operation: self.operation,
            message: message.into(),
        }
    }

    /// Keep a copy of the engine's result records when configured
    fn persist(&self, records: &[Row]) {
        if !self.persist_output {
            return;
        }
        if let Err(err) = write_records(&self.output_path, records) {
            log::warn!(
                "Failed to persist engine output {}: {}",
                self.output_path.display(),
                err
            );
        }
    }
}

/// The engine chosen for one write operation
pub enum ExecutionEngine<'a> {
    Bulk(bulk::BulkEngine<'a>),
    Rest(rest::RestEngine<'a>),
}

/// Pick an engine from the record count and job settings: bulk above the
/// threshold unless the job forces the row engine, with the bulk protocol
/// version taken from configuration
pub fn select_engine<'a>(
    record_count: usize,
    settings: &Settings,
    params: EngineParams<'a>,
) -> ExecutionEngine<'a> {
    if record_count > settings.bulk_threshold && !settings.always_use_rest {
        ExecutionEngine::Bulk(bulk::BulkEngine::new(
            params,
            settings.bulk_api_version,
            settings.bulk_batch_size,
        ))
    } else {
        ExecutionEngine::Rest(rest::RestEngine::new(params, settings.rest_batch_size))
    }
}

impl ExecutionEngine<'_> {
    /// Engine name for log lines
    pub fn describe_engine(&self) -> String {
        match self {
            ExecutionEngine::Bulk(engine) => format!("bulk api {}", engine.version().label()),
            ExecutionEngine::Rest(_) => "rest api".to_string(),
        }
    }

    /// Operation summary for log lines
    pub fn describe_operation(&self) -> String {
        let params = match self {
            ExecutionEngine::Bulk(engine) => engine.params(),
            ExecutionEngine::Rest(engine) => engine.params(),
        };
        format!("{} of {}", params.operation, params.entity)
    }

    /// Run the operation, reporting progress through `on_progress`. Returns
    /// the records as the org accepted them, generated identifiers included.
    pub async fn execute(
        self,
        records: Vec<Row>,
        on_progress: ProgressSink<'_>,
    ) -> Result<Vec<Row>, EngineError> {
        match self {
            ExecutionEngine::Bulk(engine) => engine.execute(records, on_progress).await,
            ExecutionEngine::Rest(engine) => engine.execute(records, on_progress).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BulkApiVersion;

    fn make_params(client: &OrgClient) -> EngineParams<'_> {
        EngineParams {
            client,
            entity: "Account".to_string(),
            operation: OperationKind::Insert,
            poll_interval: Duration::from_millis(10),
            propagate_ids: true,
            output_path: PathBuf::from("/tmp/out.csv"),
            persist_output: false,
        }
    }

    #[test]
    fn test_bulk_selected_above_threshold() {
        let client = OrgClient::new("https://org.example", "token");
        let mut settings = Settings::default();
        settings.bulk_threshold = 100;
        settings.bulk_api_version = BulkApiVersion::V1;

        let engine = select_engine(101, &settings, make_params(&client));
        assert_eq!(engine.describe_engine(), "bulk api v1");
        assert_eq!(engine.describe_operation(), "insert of Account");
    }

    #[test]
    fn test_rest_selected_at_or_below_threshold() {
        let client = OrgClient::new("https://org.example", "token");
        let mut settings = Settings::default();
        settings.bulk_threshold = 100;

        let engine = select_engine(100, &settings, make_params(&client));
        assert_eq!(engine.describe_engine(), "rest api");
    }

    #[test]
    fn test_always_use_rest_overrides_count() {
        let client = OrgClient::new("https://org.example", "token");
        let mut settings = Settings::default();
        settings.bulk_threshold = 100;
        settings.always_use_rest = true;

        let engine = select_engine(10_000, &settings, make_params(&client));
        assert_eq!(engine.describe_engine(), "rest api");
    }
}
