use crate::error::ProcessingError;
use async_trait::async_trait;
use model::record::RecordEnvelope;

/// What a stage did with one record.
///
/// A returned outcome is final for the attempt; transient trouble (a flaky
/// backend, a timeout) surfaces as `Err(ProcessingError)` instead so the
/// runtime's retry policy can decide whether to run the stage again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// The record was transformed or stored; the optional resource points at
    /// the produced representation.
    Success { result_resource: Option<String> },
    /// The record failed in a way a retry will not fix.
    Error { message: String },
    /// The stage decided the record needs no work (deleted upstream,
    /// filtered by schema selection, and so on).
    Filtered,
}

/// One unit of pipeline work.
///
/// Implementations must be idempotent per record: the runtime retries
/// transient failures and may deliver a record twice after a crash.
#[async_trait]
pub trait ProcessingStage: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, record: &RecordEnvelope) -> Result<StageOutcome, ProcessingError>;
}
