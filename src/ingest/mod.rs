//! Metric sample ingest
//!
//! Samples arrive as newline-delimited JSON and are fanned out to the engine
//! through a dispatcher that keeps per-metric-key ordering.

pub mod dispatcher;
pub mod reader;
pub mod sample;

pub use dispatcher::{DispatchSummary, PartitionedDispatcher};
pub use reader::SampleReader;
pub use sample::MetricSample;

/// Ingest errors
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("Failed to read input: {0}")]
    Io(String),

    #[error("Malformed sample on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error("Dispatch worker {0} has stopped")]
    WorkerStopped(usize),
}

impl IngestError {
    /// Whether reading can go on past this error. Only a malformed line is
    /// skippable; a broken input or a dead worker ends ingest.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IngestError::Parse { .. })
    }
}
