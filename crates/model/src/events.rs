use crate::record::OutcomeState;
use crate::task::TaskState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Events published towards the messaging transport.
///
/// The transport framing is out of scope; consumers only rely on the
/// serialized shape below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A task was accepted and persisted as PENDING.
    TaskRegistered {
        task_id: i64,
        topology_name: String,
        timestamp: DateTime<Utc>,
    },

    /// A task moved to a new lifecycle state.
    TaskStateChanged {
        task_id: i64,
        state: TaskState,
        description: String,
        timestamp: DateTime<Utc>,
    },

    /// A record passed admission and was queued for processing.
    RecordReady {
        task_id: i64,
        record_id: String,
        timestamp: DateTime<Utc>,
    },

    /// A record reached a terminal outcome.
    RecordOutcome {
        task_id: i64,
        record_id: String,
        state: OutcomeState,
        timestamp: DateTime<Utc>,
    },

    /// Final task summary after the coordinator closed the run.
    TaskFinished {
        task_id: i64,
        state: TaskState,
        processed: u64,
        errors: u64,
        timestamp: DateTime<Utc>,
    },
}

impl PipelineEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::TaskRegistered { .. } => "task.registered",
            PipelineEvent::TaskStateChanged { .. } => "task.state_changed",
            PipelineEvent::RecordReady { .. } => "record.ready",
            PipelineEvent::RecordOutcome { .. } => "record.outcome",
            PipelineEvent::TaskFinished { .. } => "task.finished",
        }
    }

    pub fn task_id(&self) -> i64 {
        match self {
            PipelineEvent::TaskRegistered { task_id, .. }
            | PipelineEvent::TaskStateChanged { task_id, .. }
            | PipelineEvent::RecordReady { task_id, .. }
            | PipelineEvent::RecordOutcome { task_id, .. }
            | PipelineEvent::TaskFinished { task_id, .. } => *task_id,
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::TaskRegistered {
                task_id,
                topology_name,
                ..
            } => write!(f, "Task {task_id} registered on {topology_name}"),
            PipelineEvent::TaskStateChanged {
                task_id,
                state,
                description,
                ..
            } => write!(f, "Task {task_id} -> {state}: {description}"),
            PipelineEvent::RecordReady {
                task_id, record_id, ..
            } => write!(f, "Record {record_id} ready (task={task_id})"),
            PipelineEvent::RecordOutcome {
                task_id,
                record_id,
                state,
                ..
            } => write!(f, "Record {record_id} finished {state} (task={task_id})"),
            PipelineEvent::TaskFinished {
                task_id,
                state,
                processed,
                errors,
                ..
            } => write!(
                f,
                "Task {task_id} finished {state}: {processed} processed, {errors} errors"
            ),
        }
    }
}
