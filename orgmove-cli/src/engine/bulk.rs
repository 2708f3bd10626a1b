//! Bulk execution engine
//!
//! Drives the org's asynchronous ingest lifecycle: open a job, upload CSV
//! batches, close, poll until done, then collect per-record results. The
//! poll loop has no timeout; a stalled org job stalls the migration.

use crate::config::BulkApiVersion;
use crate::data::Row;
use crate::files::cache::ID_COLUMN;

use super::{EngineError, EngineParams, ProgressEvent, ProgressSink};

/// Column carrying the error text in a failed-results row
const RESULT_ERROR_COLUMN: &str = "Error";

pub struct BulkEngine<'a> {
    params: EngineParams<'a>,
    version: BulkApiVersion,
    batch_size: usize,
}

impl<'a> BulkEngine<'a> {
    pub(super) fn new(
        params: EngineParams<'a>,
        version: BulkApiVersion,
        batch_size: usize,
    ) -> Self {
        Self {
            params,
            version,
            batch_size: batch_size.max(1),
        }
    }

    pub(super) fn params(&self) -> &EngineParams<'a> {
        &self.params
    }

    pub(super) fn version(&self) -> BulkApiVersion {
        self.version
    }

    pub(super) async fn execute(
        self,
        records: Vec<Row>,
        on_progress: ProgressSink<'_>,
    ) -> Result<Vec<Row>, EngineError> {
        let client = self.params.client;
        let total = records.len();

        let job_id = client
            .create_ingest_job(self.version, &self.params.entity, self.params.operation)
            .await
            .map_err(|err| self.params.failure(err.to_string()))?;
        on_progress(ProgressEvent::JobCreated {
            job_id: job_id.clone(),
        });

        let mut submitted = 0;
        for chunk in records.chunks(self.batch_size) {
            let batch = rows_to_csv(chunk).map_err(|err| self.params.failure(err.to_string()))?;
            client
                .upload_ingest_batch(self.version, &job_id, batch)
                .await
                .map_err(|err| self.params.failure(err.to_string()))?;
            submitted += chunk.len();
            on_progress(ProgressEvent::BatchSubmitted { submitted, total });
        }
        client
            .close_ingest_job(self.version, &job_id)
            .await
            .map_err(|err| self.params.failure(err.to_string()))?;

        loop {
            let state = client
                .ingest_job_state(self.version, &job_id)
                .await
                .map_err(|err| self.params.failure(err.to_string()))?;
            on_progress(ProgressEvent::JobState {
                state: state.clone(),
            });
            match state.as_str() {
                "JobComplete" => break,
                "Failed" | "Aborted" => {
                    return Err(self
                        .params
                        .failure(format!("bulk job {} ended in state {}", job_id, state)));
                }
                _ => tokio::time::sleep(self.params.poll_interval).await,
            }
        }

        let succeeded = client
            .ingest_results(self.version, &job_id, true)
            .await
            .map_err(|err| self.params.failure(err.to_string()))?;
        let failures = client
            .ingest_results(self.version, &job_id, false)
            .await
            .map_err(|err| self.params.failure(err.to_string()))?;
        for failure in &failures {
            on_progress(ProgressEvent::RecordFailed {
                id: failure.text(ID_COLUMN).unwrap_or_default(),
                message: failure
                    .text(RESULT_ERROR_COLUMN)
                    .unwrap_or_else(|| "unknown error".to_string()),
            });
        }
        on_progress(ProgressEvent::Finished {
            succeeded: succeeded.len(),
            failed: failures.len(),
        });

        self.params.persist(&succeeded);
        Ok(succeeded)
    }
}

/// Serialize rows into one CSV batch, the header being the union of row
/// columns in first-seen order
fn rows_to_csv(rows: &[Row]) -> Result<String, csv::Error> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        for name in row.column_names() {
            if !columns.iter().any(|c| c == name) {
                columns.push(name.to_string());
            }
        }
    }
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| row.text(column).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    let bytes = writer.into_inner().map_err(|err| err.into_error())?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Value;

    #[test]
    fn test_rows_to_csv_unions_columns() {
        let first: Row = [("Id".to_string(), Value::String("001".into()))]
            .into_iter()
            .collect();
        let second: Row = [
            ("Id".to_string(), Value::String("002".into())),
            ("Name".to_string(), Value::String("Acme".into())),
        ]
        .into_iter()
        .collect();

        let csv = rows_to_csv(&[first, second]).unwrap();
        assert_eq!(csv, "Id,Name\n001,\n002,Acme\n");
    }
}
