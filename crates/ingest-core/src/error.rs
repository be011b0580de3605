use model::task::TaskState;
use thiserror::Error;

/// Errors surfaced by the durable state layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage error: {0}")]
    Sled(#[from] sled::Error),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("invalid task state transition: {from} -> {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("task {0} not found")]
    TaskNotFound(i64),

    #[error("notification sequence exhausted for task {0}")]
    SequenceExhausted(i64),

    #[error("unknown topology: {0}")]
    UnknownTopology(String),

    #[error("invalid task definition: {0}")]
    InvalidDefinition(String),
}

impl StoreError {
    /// Transient infrastructure failures are retried; logical errors are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Sled(_))
    }
}
