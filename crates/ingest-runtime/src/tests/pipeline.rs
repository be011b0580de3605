use crate::coordinator::{CoordinatorConfig, TaskCoordinator};
use crate::error::RuntimeError;
use crate::feeder::{HarvestSource, SourceRecord};
use crate::status_checker::TaskStatusChecker;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use ingest_core::metrics::Metrics;
use ingest_core::registry::{TopologyConfig, TopologyRegistry};
use ingest_core::retry::{Backoff, RetryPolicy};
use ingest_core::store::{
    HarvestedRecordStore, KillFlagStore, NotificationStore, ProcessedRecordStore,
    SledHarvestedRecordStore, SledKillFlagStore, SledNotificationStore, SledProcessedRecordStore,
    SledTaskInfoStore, TaskInfoStore,
};
use ingest_processing::error::ProcessingError;
use ingest_processing::events::{EventSink, LogEventSink};
use ingest_processing::stage::{ProcessingStage, StageOutcome};
use model::events::PipelineEvent;
use model::record::{OutcomeState, RecordEnvelope};
use model::task::{HarvestMode, SchemaSelection, TaskDefinition, TaskState};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

struct Stores {
    task_info: Arc<SledTaskInfoStore>,
    notifications: Arc<SledNotificationStore>,
    processed: Arc<SledProcessedRecordStore>,
    harvested: Arc<SledHarvestedRecordStore>,
    kill_flags: Arc<SledKillFlagStore>,
}

fn stores(db: &sled::Db) -> Stores {
    Stores {
        task_info: Arc::new(SledTaskInfoStore::new(db).unwrap()),
        notifications: Arc::new(SledNotificationStore::new(db).unwrap()),
        processed: Arc::new(SledProcessedRecordStore::new(db).unwrap()),
        harvested: Arc::new(SledHarvestedRecordStore::new(db).unwrap()),
        kill_flags: Arc::new(SledKillFlagStore::new(db).unwrap()),
    }
}

fn coordinator(s: &Stores, queue_capacity: usize) -> TaskCoordinator {
    coordinator_with_events(s, queue_capacity, Arc::new(LogEventSink))
}

fn coordinator_with_events(
    s: &Stores,
    queue_capacity: usize,
    events: Arc<dyn EventSink>,
) -> TaskCoordinator {
    let registry = TopologyRegistry::new().with_topology(
        "oai_harvest",
        TopologyConfig {
            heavy_stage_fraction: 0.4,
            queue_capacity,
        },
    );
    let status_checker = Arc::new(TaskStatusChecker::with_timings(
        s.kill_flags.clone(),
        Duration::ZERO,
        Duration::from_millis(10),
    ));
    TaskCoordinator::new(
        s.task_info.clone(),
        s.notifications.clone(),
        s.processed.clone(),
        s.harvested.clone(),
        s.kill_flags.clone(),
        status_checker,
        Arc::new(Metrics::new()),
        CoordinatorConfig {
            registry,
            stage_retry: RetryPolicy::new(3, Duration::ZERO, Backoff::Fixed),
            events,
        },
    )
}

struct CapturingSink {
    events: Arc<Mutex<Vec<PipelineEvent>>>,
}

#[async_trait]
impl EventSink for CapturingSink {
    async fn publish(&self, event: PipelineEvent) {
        self.events.lock().await.push(event);
    }
}

fn definition(mode: HarvestMode) -> TaskDefinition {
    TaskDefinition {
        topology_name: "oai_harvest".into(),
        dataset_id: "ds-1".into(),
        harvest_mode: mode,
        schema_selection: SchemaSelection::AllSchemas,
        max_parallelization: 4,
        parameters: HashMap::new(),
    }
}

struct VecSource {
    records: Vec<SourceRecord>,
}

impl VecSource {
    fn of(ids: &[&str]) -> Self {
        Self {
            records: ids
                .iter()
                .map(|id| SourceRecord {
                    record_id: id.to_string(),
                    payload_ref: format!("mcs://records/{id}"),
                    fingerprint: Some(format!("fp-{id}")),
                    date_stamp: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
                    marked_as_deleted: false,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl HarvestSource for VecSource {
    async fn next_record(&mut self) -> Result<Option<SourceRecord>, RuntimeError> {
        if self.records.is_empty() {
            Ok(None)
        } else {
            Ok(Some(self.records.remove(0)))
        }
    }
}

/// Succeeds except for record ids listed as failing.
struct SelectiveStage {
    failing: Vec<String>,
}

#[async_trait]
impl ProcessingStage for SelectiveStage {
    fn name(&self) -> &str {
        "selective"
    }

    async fn process(&self, record: &RecordEnvelope) -> Result<StageOutcome, ProcessingError> {
        if self.failing.iter().any(|id| id == &record.record_id) {
            Ok(StageOutcome::Error {
                message: "representation could not be created".into(),
            })
        } else {
            Ok(StageOutcome::Success {
                result_resource: Some(format!("mcs://rep/{}", record.record_id)),
            })
        }
    }
}

/// Sets the task's kill flag while handling its first record, then stalls
/// on every later record so the cancellation has time to propagate.
struct SelfKillingStage {
    kill_flags: Arc<dyn KillFlagStore>,
}

#[async_trait]
impl ProcessingStage for SelfKillingStage {
    fn name(&self) -> &str {
        "self_killing"
    }

    async fn process(&self, record: &RecordEnvelope) -> Result<StageOutcome, ProcessingError> {
        self.kill_flags
            .set_kill_flag(record.task_id, "Dropped by the user")
            .await?;
        tokio::time::sleep(Duration::from_millis(30)).await;
        Ok(StageOutcome::Success {
            result_resource: None,
        })
    }
}

#[tokio::test]
async fn mixed_outcomes_finish_the_task_with_error_counts() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let s = stores(&db);
    let coordinator = coordinator(&s, 8);

    let mut source = VecSource::of(&["rec-1", "rec-2", "rec-3"]);
    let info = coordinator
        .run_task(
            &definition(HarvestMode::Full),
            Some(3),
            &mut source,
            Arc::new(SelectiveStage {
                failing: vec!["rec-2".into()],
            }),
        )
        .await
        .unwrap();

    assert_eq!(info.state, TaskState::Processed);
    assert_eq!(info.expected_records, Some(3));
    assert_eq!(info.counters.processed, 2);
    assert_eq!(info.counters.processed_errors, 1);
    assert!(info.counters.total() <= 3);
    assert!(info.state_description.contains("1 with errors"));
    assert!(info.started_at.is_some());
    assert!(info.finished_at.is_some());

    let report = s.notifications.read_report(info.task_id).await.unwrap();
    assert_eq!(report.len(), 3);
    // Newest outcome first, strictly decreasing sequence.
    assert!(report.windows(2).all(|w| w[0].sequence > w[1].sequence));

    let errors = s.notifications.error_report(info.task_id).await.unwrap();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].count, 1);
    assert_eq!(errors[0].message, "representation could not be created");

    // No in-flight markers survive a clean finish.
    for id in ["rec-1", "rec-2", "rec-3"] {
        assert!(!s.processed.is_in_flight(info.task_id, id).await.unwrap());
    }
}

#[tokio::test]
async fn killed_task_ends_dropped_with_the_kill_reason() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let s = stores(&db);
    // Small mailbox so the feeder blocks while the kill propagates.
    let coordinator = coordinator(&s, 2);

    let ids: Vec<String> = (0..50).map(|n| format!("rec-{n}")).collect();
    let id_refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    let mut source = VecSource::of(&id_refs);

    let info = coordinator
        .run_task(
            &definition(HarvestMode::Full),
            Some(50),
            &mut source,
            Arc::new(SelfKillingStage {
                kill_flags: s.kill_flags.clone(),
            }),
        )
        .await
        .unwrap();

    assert_eq!(info.state, TaskState::Dropped);
    assert_eq!(info.state_description, "Dropped by the user");
    assert!(info.finished_at.is_some());
    // The kill landed before the source was drained.
    assert!(info.counters.processed < 50);

    let report = s.notifications.read_report(info.task_id).await.unwrap();
    assert!(report.len() < 50);
    // Records read after the kill are recorded as dropped, not failed.
    assert!(
        report
            .iter()
            .all(|e| e.notification.state != OutcomeState::Error)
    );
    assert_eq!(info.counters.processed_errors, 0);
}

#[tokio::test]
async fn pipeline_events_trace_the_task_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let s = stores(&db);
    let events = Arc::new(Mutex::new(Vec::new()));
    let coordinator = coordinator_with_events(
        &s,
        8,
        Arc::new(CapturingSink {
            events: events.clone(),
        }),
    );

    let mut source = VecSource::of(&["rec-1", "rec-2"]);
    let info = coordinator
        .run_task(
            &definition(HarvestMode::Full),
            Some(2),
            &mut source,
            Arc::new(SelectiveStage { failing: vec![] }),
        )
        .await
        .unwrap();

    let events = events.lock().await;
    let types: Vec<_> = events.iter().map(|e| e.event_type()).collect();
    assert_eq!(types.first(), Some(&"task.registered"));
    assert_eq!(types.get(1), Some(&"task.state_changed"));
    assert_eq!(types.last(), Some(&"task.finished"));
    assert_eq!(types.iter().filter(|t| **t == "record.ready").count(), 2);
    assert_eq!(types.iter().filter(|t| **t == "record.outcome").count(), 2);
    assert!(events.iter().all(|e| e.task_id() == info.task_id));
    assert!(matches!(
        events.last(),
        Some(PipelineEvent::TaskFinished {
            state: TaskState::Processed,
            processed: 2,
            errors: 0,
            ..
        })
    ));
}

#[tokio::test]
async fn incremental_re_harvest_only_processes_changed_records() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let s = stores(&db);
    let coordinator = coordinator(&s, 8);

    let stage = Arc::new(SelectiveStage { failing: vec![] });
    let mut first = VecSource::of(&["rec-a", "rec-b"]);
    let info = coordinator
        .run_task(
            &definition(HarvestMode::Incremental),
            Some(2),
            &mut first,
            stage.clone(),
        )
        .await
        .unwrap();
    assert_eq!(info.counters.processed, 2);

    // Replay with rec-a unchanged and rec-b re-fingerprinted.
    let mut second = VecSource::of(&["rec-a", "rec-b"]);
    second.records[1].fingerprint = Some("fp-changed".into());
    let info = coordinator
        .run_task(
            &definition(HarvestMode::Incremental),
            Some(2),
            &mut second,
            stage,
        )
        .await
        .unwrap();

    // Incremental harvests park one state short: post-processing still has
    // to reconcile records absent from the re-harvest.
    assert_eq!(info.state, TaskState::ReadyForPostProcessing);
    assert_eq!(info.counters.processed, 1);
    assert_eq!(info.counters.ignored, 1);

    let report = s.notifications.read_report(info.task_id).await.unwrap();
    let dropped: Vec<_> = report
        .iter()
        .filter(|e| e.notification.state == OutcomeState::Dropped)
        .collect();
    assert_eq!(dropped.len(), 1);
    assert_eq!(dropped[0].notification.resource, "rec-a");

    let row = s.harvested.find("ds-1", "rec-b").await.unwrap().unwrap();
    assert_eq!(row.latest_harvest_fingerprint.as_deref(), Some("fp-changed"));
}

#[tokio::test]
async fn interrupted_tasks_are_prepared_for_resumption() {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path()).unwrap();
    let s = stores(&db);
    let coordinator = coordinator(&s, 8);

    // Simulate a task that died mid-processing: running state, some
    // outcomes durably recorded, stale in-flight markers left behind.
    let registry =
        TopologyRegistry::new().with_topology("oai_harvest", TopologyConfig::default());
    let task_id = s
        .task_info
        .register_task(&definition(HarvestMode::Full), &registry)
        .await
        .unwrap();
    s.task_info
        .update_state(task_id, TaskState::CurrentlyProcessing, "Processing started")
        .await
        .unwrap();
    s.notifications.seed_sequence(task_id, 10).await.unwrap();
    for n in 0..4 {
        s.notifications
            .append(
                model::record::Notification::new(
                    task_id,
                    format!("rec-{n}"),
                    OutcomeState::Success,
                    "oai_harvest",
                ),
            )
            .await
            .unwrap();
    }
    s.processed.mark_started(task_id, "rec-4", 1).await.unwrap();
    s.processed.mark_started(task_id, "rec-5", 1).await.unwrap();

    let reports = coordinator.resume_interrupted_tasks().await.unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].task_id, task_id);
    assert_eq!(reports[0].already_recorded, 4);
    assert!(!s.processed.is_in_flight(task_id, "rec-4").await.unwrap());
    assert!(!s.processed.is_in_flight(task_id, "rec-5").await.unwrap());
}
