use crate::actor::spawn_actor;
use crate::error::RuntimeError;
use crate::feeder::{FeedSummary, HarvestSource, RecordFeeder};
use crate::status_checker::TaskStatusChecker;
use crate::worker::RecordWorker;
use chrono::Utc;
use ingest_core::metrics::Metrics;
use ingest_core::registry::TopologyRegistry;
use ingest_core::retry::RetryPolicy;
use ingest_core::store::{
    HarvestedRecordStore, KillFlagStore, NotificationStore, ProcessedRecordStore, TaskInfoStore,
};
use ingest_processing::categorization::CategorizationEngine;
use ingest_processing::events::{EventSink, LogEventSink};
use ingest_processing::notifier::Notifier;
use ingest_processing::stage::ProcessingStage;
use ingest_processing::throttle::ThrottlingFractionEvaluator;
use model::events::PipelineEvent;
use model::task::{HarvestMode, TaskDefinition, TaskInfo, TaskState};
use std::sync::Arc;
use tracing::{info, warn};

/// Everything a coordinator needs to run tasks against one deployment.
pub struct CoordinatorConfig {
    pub registry: TopologyRegistry,
    pub stage_retry: RetryPolicy,
    pub events: Arc<dyn EventSink>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            registry: TopologyRegistry::new(),
            stage_retry: RetryPolicy::default(),
            events: Arc::new(LogEventSink),
        }
    }
}

/// Report produced when an interrupted task is prepared for resumption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeReport {
    pub task_id: i64,
    /// Outcomes already durably recorded before the interruption; the
    /// re-submitted harvest may skip this many records.
    pub already_recorded: u64,
}

/// Drives one task end to end: registration, state transitions, feeding,
/// workers and finalization.
pub struct TaskCoordinator {
    task_info: Arc<dyn TaskInfoStore>,
    notifications: Arc<dyn NotificationStore>,
    processed_records: Arc<dyn ProcessedRecordStore>,
    harvested_records: Arc<dyn HarvestedRecordStore>,
    kill_flags: Arc<dyn KillFlagStore>,
    status_checker: Arc<TaskStatusChecker>,
    metrics: Arc<Metrics>,
    config: CoordinatorConfig,
}

impl TaskCoordinator {
    pub fn new(
        task_info: Arc<dyn TaskInfoStore>,
        notifications: Arc<dyn NotificationStore>,
        processed_records: Arc<dyn ProcessedRecordStore>,
        harvested_records: Arc<dyn HarvestedRecordStore>,
        kill_flags: Arc<dyn KillFlagStore>,
        status_checker: Arc<TaskStatusChecker>,
        metrics: Arc<Metrics>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            task_info,
            notifications,
            processed_records,
            harvested_records,
            kill_flags,
            status_checker,
            metrics,
            config,
        }
    }

    /// Registers and immediately runs a task over the given source and
    /// stage, returning its final status row.
    pub async fn run_task(
        &self,
        definition: &TaskDefinition,
        expected_records: Option<u64>,
        source: &mut dyn HarvestSource,
        stage: Arc<dyn ProcessingStage>,
    ) -> Result<TaskInfo, RuntimeError> {
        let task_id = self
            .task_info
            .register_task(definition, &self.config.registry)
            .await?;
        let topology = self
            .config
            .registry
            .resolve(&definition.topology_name)?
            .clone();
        self.config
            .events
            .publish(PipelineEvent::TaskRegistered {
                task_id,
                topology_name: definition.topology_name.clone(),
                timestamp: Utc::now(),
            })
            .await;

        if let Some(expected) = expected_records {
            self.task_info.set_expected_records(task_id, expected).await?;
            self.notifications.seed_sequence(task_id, expected).await?;
        }
        self.task_info
            .update_state(task_id, TaskState::CurrentlyProcessing, "Processing started")
            .await?;
        self.config
            .events
            .publish(PipelineEvent::TaskStateChanged {
                task_id,
                state: TaskState::CurrentlyProcessing,
                description: "Processing started".into(),
                timestamp: Utc::now(),
            })
            .await;
        info!(task_id, topology = %definition.topology_name, "task started");

        let (cancel, poll_handle) = self.status_checker.cancellation_for(task_id);

        let notifier = Arc::new(
            Notifier::new(
                self.notifications.clone(),
                self.task_info.clone(),
                self.metrics.clone(),
                definition.topology_name.clone(),
            )
            .with_events(self.config.events.clone()),
        );

        let worker = RecordWorker::new(
            stage,
            self.processed_records.clone(),
            notifier.clone(),
            self.metrics.clone(),
            self.config.stage_retry.clone(),
            cancel.clone(),
        );
        let (worker_ref, worker_handle) = spawn_actor(
            format!("worker-{task_id}"),
            topology.queue_capacity,
            worker,
        );

        let lanes = ThrottlingFractionEvaluator::new(topology.heavy_stage_fraction)
            .heavy_lanes(definition.max_parallelization);
        let feeder = RecordFeeder::new(
            task_id,
            definition.dataset_id.clone(),
            definition.harvest_mode,
            lanes,
            Utc::now(),
            Arc::new(CategorizationEngine::new(self.harvested_records.clone())),
            notifier,
        )
        .with_events(self.config.events.clone());

        let summary = feeder.feed(source, &worker_ref, &cancel).await;
        drop(worker_ref);
        worker_handle.await?;
        cancel.cancel();
        poll_handle.await?;

        let summary = match summary {
            Ok(summary) => summary,
            Err(err) => {
                self.task_info
                    .set_task_dropped(task_id, &format!("Harvest failed: {err}"))
                    .await?;
                return Err(err);
            }
        };
        self.finalize(task_id, summary).await?;
        Ok(self.task_info.get_status(task_id).await?)
    }

    async fn finalize(&self, task_id: i64, summary: FeedSummary) -> Result<(), RuntimeError> {
        if let Some(reason) = self.kill_flags.kill_reason(task_id).await? {
            warn!(task_id, reason = %reason, "task finished dropped");
            self.task_info.set_task_dropped(task_id, &reason).await?;
            let counters = self.task_info.get_status(task_id).await?.counters;
            self.config
                .events
                .publish(PipelineEvent::TaskFinished {
                    task_id,
                    state: TaskState::Dropped,
                    processed: counters.processed,
                    errors: counters.processed_errors + counters.deleted_errors,
                    timestamp: Utc::now(),
                })
                .await;
            return Ok(());
        }

        let info = self.task_info.get_status(task_id).await?;
        let counters = info.counters;
        let errors = counters.processed_errors + counters.deleted_errors;
        let description = if errors > 0 {
            format!(
                "Processed {} records, {} with errors",
                summary.emitted, errors
            )
        } else {
            format!("Processed {} records", summary.emitted)
        };

        // Incremental harvests still owe a post-processing leg (removing
        // records absent from the re-harvest), so they park one state short
        // of fully processed.
        let incremental = info
            .definition()
            .map(|def| def.harvest_mode == HarvestMode::Incremental)
            .unwrap_or(false);
        let final_state = if incremental {
            TaskState::ReadyForPostProcessing
        } else {
            TaskState::Processed
        };
        info!(task_id, emitted = summary.emitted, errors, state = %final_state, "task finished");
        self.task_info
            .update_state(task_id, final_state, &description)
            .await?;
        self.config
            .events
            .publish(PipelineEvent::TaskFinished {
                task_id,
                state: final_state,
                processed: summary.emitted,
                errors,
                timestamp: Utc::now(),
            })
            .await;
        Ok(())
    }

    /// Prepares every task interrupted mid-processing for resumption:
    /// stale in-flight markers are cleared and the durable progress count
    /// is reported so the caller can re-submit from the right offset.
    pub async fn resume_interrupted_tasks(&self) -> Result<Vec<ResumeReport>, RuntimeError> {
        let mut reports = Vec::new();
        for task_id in self
            .task_info
            .tasks_in_state(TaskState::CurrentlyProcessing)
            .await?
        {
            self.processed_records.clear_task(task_id).await?;
            let already_recorded = self.notifications.appended_count(task_id).await?;
            info!(task_id, already_recorded, "task prepared for resumption");
            reports.push(ResumeReport {
                task_id,
                already_recorded,
            });
        }
        Ok(reports)
    }
}
