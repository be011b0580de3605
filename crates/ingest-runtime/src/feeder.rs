use crate::actor::ActorRef;
use crate::error::RuntimeError;
use crate::worker::WorkerMsg;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ingest_processing::categorization::{CategorizationEngine, CategorizationParameters};
use ingest_processing::events::{EventSink, LogEventSink};
use ingest_processing::notifier::Notifier;
use ingest_processing::throttle::lane_key_for;
use model::events::PipelineEvent;
use model::record::RecordEnvelope;
use model::task::HarvestMode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// One record as the harvesting endpoint reports it, before the pipeline
/// has touched it.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub record_id: String,
    pub payload_ref: String,
    pub fingerprint: Option<String>,
    pub date_stamp: DateTime<Utc>,
    pub marked_as_deleted: bool,
}

/// Pull interface over a harvesting endpoint. Yields records until the
/// endpoint is exhausted.
#[async_trait]
pub trait HarvestSource: Send {
    async fn next_record(&mut self) -> Result<Option<SourceRecord>, RuntimeError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FeedSummary {
    /// Records handed to a worker.
    pub emitted: u64,
    /// Records skipped by categorization before any worker saw them.
    pub skipped: u64,
}

/// Pulls records from a source, runs categorization, tags each eligible
/// record with its throttling lane and pushes it into the worker mailbox.
pub struct RecordFeeder {
    task_id: i64,
    dataset_id: String,
    harvest_mode: HarvestMode,
    max_lanes: u32,
    harvest_date: DateTime<Utc>,
    categorization: Arc<CategorizationEngine>,
    notifier: Arc<Notifier>,
    events: Arc<dyn EventSink>,
}

impl RecordFeeder {
    pub fn new(
        task_id: i64,
        dataset_id: impl Into<String>,
        harvest_mode: HarvestMode,
        max_lanes: u32,
        harvest_date: DateTime<Utc>,
        categorization: Arc<CategorizationEngine>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            task_id,
            dataset_id: dataset_id.into(),
            harvest_mode,
            max_lanes,
            harvest_date,
            categorization,
            notifier,
            events: Arc::new(LogEventSink),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Drains the source into the worker mailbox.
    ///
    /// Stops pulling as soon as `cancel` fires; records never read from the
    /// source get no notification, a record already read when the kill
    /// lands is recorded as dropped.
    pub async fn feed(
        &self,
        source: &mut dyn HarvestSource,
        worker: &ActorRef<WorkerMsg>,
        cancel: &CancellationToken,
    ) -> Result<FeedSummary, RuntimeError> {
        let mut summary = FeedSummary::default();

        while !cancel.is_cancelled() {
            let Some(record) = source.next_record().await? else {
                break;
            };

            let mut envelope =
                RecordEnvelope::new(self.task_id, &record.record_id, &record.payload_ref);
            envelope.marked_as_deleted = record.marked_as_deleted;
            envelope.lane_key = Some(lane_key_for(self.task_id, self.max_lanes));

            // Deleted records carry no content to compare; they always go
            // through so the deletion is applied downstream.
            if !record.marked_as_deleted {
                let result = self
                    .categorization
                    .categorize(&CategorizationParameters {
                        harvest_mode: self.harvest_mode,
                        dataset_id: self.dataset_id.clone(),
                        record_id: record.record_id.clone(),
                        record_fingerprint: record.fingerprint.clone(),
                        record_date_stamp: record.date_stamp,
                        current_harvest_date: self.harvest_date,
                    })
                    .await;
                if result.should_be_dropped() {
                    debug!(task_id = self.task_id, record_id = %record.record_id, "record unchanged since last harvest");
                    self.notifier
                        .notify_dropped(&envelope, "Record already processed")
                        .await?;
                    summary.skipped += 1;
                    continue;
                }
            }

            tokio::select! {
                sent = worker.send(WorkerMsg::Process(envelope.clone())) => {
                    sent?;
                    summary.emitted += 1;
                    self.events
                        .publish(PipelineEvent::RecordReady {
                            task_id: self.task_id,
                            record_id: record.record_id.clone(),
                            timestamp: Utc::now(),
                        })
                        .await;
                }
                _ = cancel.cancelled() => {
                    self.notifier
                        .notify_dropped(&envelope, "Task was dropped")
                        .await?;
                    break;
                }
            }
        }

        info!(
            task_id = self.task_id,
            emitted = summary.emitted,
            skipped = summary.skipped,
            "feeding finished"
        );
        Ok(summary)
    }
}
