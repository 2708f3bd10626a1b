//! Row-level execution engine
//!
//! Submits synchronous batches and reports per-record failures as progress
//! events. Record failures are not fatal; a failed submission is.

use crate::data::{Row, Value};
use crate::files::cache::ID_COLUMN;

use super::{EngineError, EngineParams, ProgressEvent, ProgressSink};

pub struct RestEngine<'a> {
    params: EngineParams<'a>,
    batch_size: usize,
}

impl<'a> RestEngine<'a> {
    pub(super) fn new(params: EngineParams<'a>, batch_size: usize) -> Self {
        Self {
            params,
            batch_size: batch_size.max(1),
        }
    }

    pub(super) fn params(&self) -> &EngineParams<'a> {
        &self.params
    }

    pub(super) async fn execute(
        self,
        records: Vec<Row>,
        on_progress: ProgressSink<'_>,
    ) -> Result<Vec<Row>, EngineError> {
        let total = records.len();
        let mut updated = Vec::with_capacity(total);
        let mut submitted = 0;
        let mut failed = 0;

        for chunk in records.chunks(self.batch_size) {
            let results = self
                .params
                .client
                .submit_batch(&self.params.entity, self.params.operation, chunk)
                .await
                .map_err(|err| self.params.failure(err.to_string()))?;
            submitted += chunk.len();
            on_progress(ProgressEvent::BatchSubmitted { submitted, total });

            for (record, result) in chunk.iter().zip(results) {
                match result.error_message() {
                    None => {
                        let mut record = record.clone();
                        if self.params.propagate_ids {
                            if let Some(id) = result.id {
                                record.set(ID_COLUMN, Value::String(id));
                            }
                        }
                        updated.push(record);
                    }
                    Some(message) => {
                        failed += 1;
                        on_progress(ProgressEvent::RecordFailed {
                            id: record.text(ID_COLUMN).unwrap_or_default(),
                            message,
                        });
                    }
                }
            }
        }

        on_progress(ProgressEvent::Finished {
            succeeded: updated.len(),
            failed,
        });
        self.params.persist(&updated);
        Ok(updated)
    }
}
