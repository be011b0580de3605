use async_trait::async_trait;
use model::events::PipelineEvent;
use tracing::info;

/// Outbound seam towards the messaging transport.
///
/// Publishing is best-effort and must never block or fail the pipeline;
/// implementations swallow their own delivery errors.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: PipelineEvent);
}

/// Sink for deployments without a broker: events go to the log.
pub struct LogEventSink;

#[async_trait]
impl EventSink for LogEventSink {
    async fn publish(&self, event: PipelineEvent) {
        info!(task_id = event.task_id(), event = event.event_type(), "{event}");
    }
}
