use thiserror::Error;
use uuid::Uuid;

use crate::schema::EpochRange;

/// Typed failures raised by the pipelines and aggregators.
///
/// Transient infrastructure failures (I/O, network, store errors) are not
/// represented here; they travel as plain `anyhow` errors. The variants below
/// split into consistency preconditions that clear up on their own once
/// earlier work lands, and invariant violations that indicate a bug or
/// corrupted state.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("{level} data has gaps in {range}: missing {}", summarize(.missing))]
    Gap {
        level: &'static str,
        range: EpochRange,
        missing: Vec<u64>,
    },

    #[error("batch {batch_id} is not contiguous: {}", summarize(.epochs))]
    NonContiguousBatch { batch_id: Uuid, epochs: Vec<u64> },

    #[error("source returned no rows for epochs {} of batch {batch_id}", summarize(.missing))]
    IncompleteFetch { batch_id: Uuid, missing: Vec<u64> },

    #[error("{what} is not ready: {reason}")]
    SourceNotReady { what: String, reason: String },

    #[error("fetched row for epoch {epoch} belongs to no scheduled batch")]
    UnscheduledEpoch { epoch: u64 },

    #[error("epoch {epoch} is pending in batch {existing}, refusing to reassign it to {attempted}")]
    BatchReassigned {
        epoch: u64,
        existing: Uuid,
        attempted: Uuid,
    },

    #[error("hot store holds no rows for epochs {} of batch {batch_id}", summarize(.missing))]
    MissingBatchRows { batch_id: Uuid, missing: Vec<u64> },
}

impl PipelineError {
    /// Whether the failure is a precondition that a later cycle can satisfy.
    pub fn is_not_ready(&self) -> bool {
        matches!(
            self,
            Self::Gap { .. }
                | Self::NonContiguousBatch { .. }
                | Self::IncompleteFetch { .. }
                | Self::SourceNotReady { .. }
        )
    }
}

/// Classifies an error chain for logging and metrics.
pub fn classify(err: &anyhow::Error) -> &'static str {
    match err.downcast_ref::<PipelineError>() {
        Some(e) if e.is_not_ready() => "not_ready",
        Some(_) => "invariant",
        None => "error",
    }
}

/// Renders long epoch lists as their bounds plus a count.
fn summarize(epochs: &[u64]) -> String {
    match epochs {
        [] => "none".to_string(),
        [one] => one.to_string(),
        _ if epochs.len() <= 8 => format!("{epochs:?}"),
        [first, .., last] => format!("{} epochs between {first} and {last}", epochs.len()),
    }
}
