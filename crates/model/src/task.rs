use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;

/// Lifecycle state of a task.
///
/// Transitions are one-directional:
/// `Pending -> CurrentlyProcessing -> {Processed, ReadyForPostProcessing}`.
/// `Dropped` is reachable from any non-terminal state and covers both
/// operator kills and fatal submission errors; the distinction lives in the
/// state description, not in the enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    CurrentlyProcessing,
    Processed,
    ReadyForPostProcessing,
    Dropped,
}

impl TaskState {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::CurrentlyProcessing => "CURRENTLY_PROCESSING",
            TaskState::Processed => "PROCESSED",
            TaskState::ReadyForPostProcessing => "READY_FOR_POST_PROCESSING",
            TaskState::Dropped => "DROPPED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Processed | TaskState::ReadyForPostProcessing | TaskState::Dropped
        )
    }

    /// Whether moving from `self` to `next` respects the state machine.
    ///
    /// Re-applying the current state is allowed so that racing finalizers
    /// stay idempotent instead of erroring.
    pub fn can_transition_to(&self, next: TaskState) -> bool {
        if *self == next {
            return true;
        }
        match self {
            TaskState::Pending => true,
            TaskState::CurrentlyProcessing => next.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which metadata schemas a harvest covers.
///
/// Resolved once when the task definition is parsed; there is no runtime
/// type dispatch on the harvesting behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaSelection {
    AllSchemas,
    SpecificSchemas { schemas: BTreeSet<String> },
}

impl SchemaSelection {
    pub fn includes(&self, schema: &str) -> bool {
        match self {
            SchemaSelection::AllSchemas => true,
            SchemaSelection::SpecificSchemas { schemas } => schemas.contains(schema),
        }
    }
}

/// How records are admitted into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    /// Reprocess every record regardless of previous harvests.
    Full,
    /// Drop records whose content has not changed since the last harvest.
    Incremental,
}

impl HarvestMode {
    pub fn is_full(&self) -> bool {
        matches!(self, HarvestMode::Full)
    }
}

/// Serialized with the task so a restart can rebuild the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub topology_name: String,
    pub dataset_id: String,
    pub harvest_mode: HarvestMode,
    pub schema_selection: SchemaSelection,
    /// Task-declared upper bound on concurrent downstream slots, split per
    /// stage by the throttling evaluator.
    pub max_parallelization: u32,
    pub parameters: HashMap<String, String>,
}

/// Progress counters for a task. All deltas are commutative increments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounters {
    pub processed: u64,
    pub ignored: u64,
    pub deleted: u64,
    pub processed_errors: u64,
    pub deleted_errors: u64,
}

impl TaskCounters {
    /// Records accounted for so far, errors included.
    pub fn total(&self) -> u64 {
        self.processed + self.ignored + self.deleted
    }
}

/// Durable record of one task's lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: i64,
    pub topology_name: String,
    pub state: TaskState,
    pub state_description: String,
    pub sent_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// Unknown until the harvest has enumerated the source.
    pub expected_records: Option<u64>,
    pub counters: TaskCounters,
    /// Serialized [`TaskDefinition`], kept verbatim for restart.
    pub definition: String,
}

impl TaskInfo {
    pub fn definition(&self) -> Result<TaskDefinition, serde_json::Error> {
        serde_json::from_str(&self.definition)
    }
}
