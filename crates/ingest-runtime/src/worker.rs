use crate::actor::{Actor, ActorContext};
use crate::error::ActorError;
use async_trait::async_trait;
use ingest_core::metrics::Metrics;
use ingest_core::retry::{RetryDisposition, RetryError, RetryPolicy};
use ingest_core::store::ProcessedRecordStore;
use ingest_processing::error::ProcessingError;
use ingest_processing::notifier::Notifier;
use ingest_processing::stage::{ProcessingStage, StageOutcome};
use model::record::RecordEnvelope;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug)]
pub enum WorkerMsg {
    Process(RecordEnvelope),
}

/// Runs the stage over each record from its mailbox and writes the outcome
/// trail. One worker actor serializes its lane; parallelism comes from
/// running several workers.
pub struct RecordWorker {
    stage: Arc<dyn ProcessingStage>,
    processed_records: Arc<dyn ProcessedRecordStore>,
    notifier: Arc<Notifier>,
    metrics: Arc<Metrics>,
    retry: RetryPolicy,
    cancel: CancellationToken,
}

impl RecordWorker {
    pub fn new(
        stage: Arc<dyn ProcessingStage>,
        processed_records: Arc<dyn ProcessedRecordStore>,
        notifier: Arc<Notifier>,
        metrics: Arc<Metrics>,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stage,
            processed_records,
            notifier,
            metrics,
            retry,
            cancel,
        }
    }

    fn classify(err: &ProcessingError) -> RetryDisposition {
        match err {
            ProcessingError::Store(e) if e.is_transient() => RetryDisposition::Retry,
            ProcessingError::Store(_) => RetryDisposition::Stop,
            ProcessingError::Stage(_) => RetryDisposition::Retry,
            ProcessingError::Rejected(_) => RetryDisposition::Stop,
        }
    }

    async fn process(&self, record: RecordEnvelope) -> Result<(), ProcessingError> {
        if self.cancel.is_cancelled() {
            return self.notifier.notify_dropped(&record, "Task was dropped").await;
        }

        self.processed_records
            .mark_started(record.task_id, &record.record_id, 1)
            .await?;

        let attempt = AtomicU32::new(0);
        let outcome = self
            .retry
            .run_cancellable(
                || {
                    let n = attempt.fetch_add(1, Ordering::SeqCst) + 1;
                    let record = &record;
                    async move {
                        if n > 1 {
                            self.metrics.increment_retries(1);
                            self.processed_records
                                .update_attempt_number(record.task_id, &record.record_id, n)
                                .await?;
                        }
                        self.stage.process(record).await
                    }
                },
                Self::classify,
                &self.cancel,
            )
            .await;

        match outcome {
            Ok(StageOutcome::Success { result_resource }) => {
                self.notifier.notify_success(&record, result_resource).await?;
            }
            Ok(StageOutcome::Error { message }) => {
                self.notifier.notify_error(&record, &message).await?;
            }
            Ok(StageOutcome::Filtered) => {
                self.notifier
                    .notify_dropped(&record, "Filtered out by the stage")
                    .await?;
            }
            Err(RetryError::Fatal(e)) | Err(RetryError::AttemptsExceeded(e)) => {
                self.notifier.notify_error(&record, &e.to_string()).await?;
            }
            Err(RetryError::Interrupted) => {
                self.notifier.notify_dropped(&record, "Task was dropped").await?;
            }
        }

        self.processed_records
            .clear(record.task_id, &record.record_id)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl Actor<WorkerMsg> for RecordWorker {
    async fn handle(&mut self, msg: WorkerMsg, ctx: &ActorContext) -> Result<(), ActorError> {
        let WorkerMsg::Process(record) = msg;
        debug!(actor = %ctx.name(), task_id = record.task_id, record_id = %record.record_id, "processing record");
        self.process(record)
            .await
            .map_err(|e| ActorError::Internal(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::spawn_actor;
    use ingest_core::registry::{TopologyConfig, TopologyRegistry};
    use ingest_core::retry::Backoff;
    use ingest_core::store::{
        NotificationStore, ProcessedRecordStore, SledNotificationStore,
        SledProcessedRecordStore, SledTaskInfoStore, TaskInfoStore,
    };
    use model::record::OutcomeState;
    use model::task::{HarvestMode, SchemaSelection, TaskDefinition};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FlakyStage {
        calls: Arc<AtomicUsize>,
        succeed_on: usize,
    }

    #[async_trait]
    impl ProcessingStage for FlakyStage {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn process(
            &self,
            record: &RecordEnvelope,
        ) -> Result<StageOutcome, ProcessingError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < self.succeed_on {
                Err(ProcessingError::Stage("backend unavailable".into()))
            } else {
                Ok(StageOutcome::Success {
                    result_resource: Some(format!("mcs://rep/{}", record.record_id)),
                })
            }
        }
    }

    struct Harness {
        notifications: Arc<SledNotificationStore>,
        task_info: Arc<SledTaskInfoStore>,
        processed: Arc<SledProcessedRecordStore>,
        notifier: Arc<Notifier>,
        task_id: i64,
    }

    async fn harness(db: &sled::Db) -> Harness {
        let notifications = Arc::new(SledNotificationStore::new(db).unwrap());
        let task_info = Arc::new(SledTaskInfoStore::new(db).unwrap());
        let processed = Arc::new(SledProcessedRecordStore::new(db).unwrap());
        let registry =
            TopologyRegistry::new().with_topology("oai_harvest", TopologyConfig::default());
        let task_id = task_info
            .register_task(
                &TaskDefinition {
                    topology_name: "oai_harvest".into(),
                    dataset_id: "ds-1".into(),
                    harvest_mode: HarvestMode::Full,
                    schema_selection: SchemaSelection::AllSchemas,
                    max_parallelization: 2,
                    parameters: HashMap::new(),
                },
                &registry,
            )
            .await
            .unwrap();
        let notifier = Arc::new(Notifier::new(
            notifications.clone(),
            task_info.clone(),
            Arc::new(Metrics::new()),
            "oai_harvest",
        ));
        Harness {
            notifications,
            task_info,
            processed,
            notifier,
            task_id,
        }
    }

    fn fast_retry(attempts: usize) -> RetryPolicy {
        RetryPolicy::new(attempts, Duration::ZERO, Backoff::Fixed)
    }

    #[tokio::test]
    async fn transient_failures_are_retried_to_success() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let h = harness(&db).await;
        let calls = Arc::new(AtomicUsize::new(0));

        let worker = RecordWorker::new(
            Arc::new(FlakyStage {
                calls: calls.clone(),
                succeed_on: 3,
            }),
            h.processed.clone(),
            h.notifier.clone(),
            Arc::new(Metrics::new()),
            fast_retry(5),
            CancellationToken::new(),
        );
        let (worker_ref, handle) = spawn_actor("worker", 4, worker);

        let record = RecordEnvelope::new(h.task_id, "rec-a", "mcs://records/rec-a");
        worker_ref.send(WorkerMsg::Process(record)).await.unwrap();
        drop(worker_ref);
        handle.await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let report = h.notifications.read_report(h.task_id).await.unwrap();
        assert_eq!(report.len(), 1);
        assert_eq!(report[0].notification.state, OutcomeState::Success);
        assert!(!h.processed.is_in_flight(h.task_id, "rec-a").await.unwrap());
    }

    #[tokio::test]
    async fn exhausted_retries_become_an_error_outcome() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let h = harness(&db).await;

        let worker = RecordWorker::new(
            Arc::new(FlakyStage {
                calls: Arc::new(AtomicUsize::new(0)),
                succeed_on: usize::MAX,
            }),
            h.processed.clone(),
            h.notifier.clone(),
            Arc::new(Metrics::new()),
            fast_retry(3),
            CancellationToken::new(),
        );
        let (worker_ref, handle) = spawn_actor("worker", 4, worker);

        let record = RecordEnvelope::new(h.task_id, "rec-a", "mcs://records/rec-a");
        worker_ref.send(WorkerMsg::Process(record)).await.unwrap();
        drop(worker_ref);
        handle.await.unwrap();

        let counters = h.task_info.get_status(h.task_id).await.unwrap().counters;
        assert_eq!(counters.processed_errors, 1);
        let errors = h.notifications.error_report(h.task_id).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert!(!h.processed.is_in_flight(h.task_id, "rec-a").await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_worker_drops_queued_records() {
        let dir = tempfile::tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let h = harness(&db).await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let worker = RecordWorker::new(
            Arc::new(FlakyStage {
                calls: Arc::new(AtomicUsize::new(0)),
                succeed_on: 1,
            }),
            h.processed.clone(),
            h.notifier.clone(),
            Arc::new(Metrics::new()),
            fast_retry(3),
            cancel,
        );
        let (worker_ref, handle) = spawn_actor("worker", 4, worker);

        let record = RecordEnvelope::new(h.task_id, "rec-a", "mcs://records/rec-a");
        worker_ref.send(WorkerMsg::Process(record)).await.unwrap();
        drop(worker_ref);
        handle.await.unwrap();

        let report = h.notifications.read_report(h.task_id).await.unwrap();
        assert_eq!(report[0].notification.state, OutcomeState::Dropped);
        let counters = h.task_info.get_status(h.task_id).await.unwrap().counters;
        assert_eq!(counters.ignored, 1);
        assert_eq!(counters.processed, 0);
    }
}
