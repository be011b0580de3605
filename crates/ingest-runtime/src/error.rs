use ingest_core::error::StoreError;
use ingest_processing::error::ProcessingError;
use thiserror::Error;

/// Top-level errors for the ingestion runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    /// Usually means the task was cancelled or panicked.
    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Actor error: {0}")]
    Actor(#[from] ActorError),

    #[error("Harvest source error: {0}")]
    Source(String),
}

/// Common error type for all actors in the runtime.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Mailbox closed")]
    MailboxClosed,

    #[error("Actor internal error: {0}")]
    Internal(String),
}
