use ingest_core::error::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("record rejected: {0}")]
    Rejected(String),

    #[error("stage failure: {0}")]
    Stage(String),
}
