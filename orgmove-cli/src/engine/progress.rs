//! Progress events emitted by the execution engines

use log::Level;

/// What kind of console message an event should produce
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    Status,
    Detail,
    Problem,
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            MessageKind::Status => "status",
            MessageKind::Detail => "detail",
            MessageKind::Problem => "problem",
        };
        write!(f, "{}", label)
    }
}

/// One event from an engine run
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    JobCreated { job_id: String },
    BatchSubmitted { submitted: usize, total: usize },
    JobState { state: String },
    RecordFailed { id: String, message: String },
    Finished { succeeded: usize, failed: usize },
}

impl ProgressEvent {
    /// Classify the event's importance into a log verbosity and message kind
    pub fn importance(&self) -> (Level, MessageKind) {
        match self {
            ProgressEvent::JobCreated { .. } => (Level::Info, MessageKind::Status),
            ProgressEvent::BatchSubmitted { .. } => (Level::Debug, MessageKind::Detail),
            ProgressEvent::JobState { .. } => (Level::Debug, MessageKind::Detail),
            ProgressEvent::RecordFailed { .. } => (Level::Warn, MessageKind::Problem),
            ProgressEvent::Finished { .. } => (Level::Info, MessageKind::Status),
        }
    }
}

impl std::fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressEvent::JobCreated { job_id } => write!(f, "job {} created", job_id),
            ProgressEvent::BatchSubmitted { submitted, total } => {
                write!(f, "{}/{} records submitted", submitted, total)
            }
            ProgressEvent::JobState { state } => write!(f, "job state: {}", state),
            ProgressEvent::RecordFailed { id, message } => {
                write!(f, "record '{}' failed: {}", id, message)
            }
            ProgressEvent::Finished { succeeded, failed } => {
                write!(f, "{} succeeded, {} failed", succeeded, failed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_importance_classification() {
        let failed = ProgressEvent::RecordFailed {
            id: "001".into(),
            message: "boom".into(),
        };
        assert_eq!(failed.importance(), (Level::Warn, MessageKind::Problem));

        let finished = ProgressEvent::Finished { succeeded: 3, failed: 0 };
        assert_eq!(finished.importance(), (Level::Info, MessageKind::Status));

        let tick = ProgressEvent::JobState { state: "InProgress".into() };
        assert_eq!(tick.importance(), (Level::Debug, MessageKind::Detail));
    }
}
