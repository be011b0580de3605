use crate::error::ProcessingError;
use crate::events::{EventSink, LogEventSink};
use chrono::Utc;
use ingest_core::metrics::Metrics;
use ingest_core::store::{NotificationStore, TaskInfoStore};
use model::events::PipelineEvent;
use model::record::{Notification, OutcomeState, RecordEnvelope};
use model::task::TaskCounters;
use std::sync::Arc;

/// Writes the per-record outcome trail: one notification row, the matching
/// task counter bump, and (for failures) the aggregated error class.
///
/// All writes are fire-in-order but individually durable; a crash between
/// them leaves the notification without its counter, which the approximate
/// counter contract allows.
pub struct Notifier {
    notifications: Arc<dyn NotificationStore>,
    task_info: Arc<dyn TaskInfoStore>,
    metrics: Arc<Metrics>,
    events: Arc<dyn EventSink>,
    topology_name: String,
}

impl Notifier {
    pub fn new(
        notifications: Arc<dyn NotificationStore>,
        task_info: Arc<dyn TaskInfoStore>,
        metrics: Arc<Metrics>,
        topology_name: impl Into<String>,
    ) -> Self {
        Self {
            notifications,
            task_info,
            metrics,
            events: Arc::new(LogEventSink),
            topology_name: topology_name.into(),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    async fn publish_outcome(&self, record: &RecordEnvelope, state: OutcomeState) {
        self.events
            .publish(PipelineEvent::RecordOutcome {
                task_id: record.task_id,
                record_id: record.record_id.clone(),
                state,
                timestamp: Utc::now(),
            })
            .await;
    }

    pub async fn notify_success(
        &self,
        record: &RecordEnvelope,
        result_resource: Option<String>,
    ) -> Result<(), ProcessingError> {
        let mut notification = Notification::new(
            record.task_id,
            &record.record_id,
            OutcomeState::Success,
            &self.topology_name,
        );
        if let Some(resource) = result_resource {
            notification = notification.with_result(resource);
        }
        self.notifications.append(notification).await?;

        let deltas = if record.marked_as_deleted {
            self.metrics.increment_deleted(1);
            TaskCounters {
                deleted: 1,
                ..TaskCounters::default()
            }
        } else {
            self.metrics.increment_processed(1);
            TaskCounters {
                processed: 1,
                ..TaskCounters::default()
            }
        };
        self.task_info
            .increment_counters(record.task_id, deltas)
            .await?;
        self.publish_outcome(record, OutcomeState::Success).await;
        Ok(())
    }

    pub async fn notify_error(
        &self,
        record: &RecordEnvelope,
        message: &str,
    ) -> Result<(), ProcessingError> {
        self.notifications
            .record_error(record.task_id, message, &record.record_id)
            .await?;
        self.notifications
            .append(
                Notification::new(
                    record.task_id,
                    &record.record_id,
                    OutcomeState::Error,
                    &self.topology_name,
                )
                .with_info(message),
            )
            .await?;

        let deltas = if record.marked_as_deleted {
            TaskCounters {
                deleted_errors: 1,
                ..TaskCounters::default()
            }
        } else {
            TaskCounters {
                processed_errors: 1,
                ..TaskCounters::default()
            }
        };
        self.metrics.increment_failures(1);
        self.task_info
            .increment_counters(record.task_id, deltas)
            .await?;
        self.publish_outcome(record, OutcomeState::Error).await;
        Ok(())
    }

    /// Records that the pipeline deliberately skipped the record (task kill,
    /// already-processed categorization). Skips count as ignored, not as
    /// failures.
    pub async fn notify_dropped(
        &self,
        record: &RecordEnvelope,
        reason: &str,
    ) -> Result<(), ProcessingError> {
        self.notifications
            .append(
                Notification::new(
                    record.task_id,
                    &record.record_id,
                    OutcomeState::Dropped,
                    &self.topology_name,
                )
                .with_info(reason),
            )
            .await?;
        self.metrics.increment_dropped(1);
        self.task_info
            .increment_counters(
                record.task_id,
                TaskCounters {
                    ignored: 1,
                    ..TaskCounters::default()
                },
            )
            .await?;
        self.publish_outcome(record, OutcomeState::Dropped).await;
        Ok(())
    }
}
