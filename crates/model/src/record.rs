use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// A record travelling through the pipeline.
///
/// The payload itself lives in the external file store; this core only ever
/// carries the reference.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEnvelope {
    pub task_id: i64,
    pub record_id: String,
    /// Opaque reference into the file/content store.
    pub payload_ref: String,
    /// Destination identifier assigned by the identifier-minting service.
    pub destination_id: Option<String>,
    /// Throttling lane key; set by the feeder before the record is emitted.
    pub lane_key: Option<String>,
    /// Source marked the record as deleted; such records bypass the
    /// transform stages and only update counters.
    pub marked_as_deleted: bool,
}

impl RecordEnvelope {
    pub fn new(task_id: i64, record_id: impl Into<String>, payload_ref: impl Into<String>) -> Self {
        Self {
            task_id,
            record_id: record_id.into(),
            payload_ref: payload_ref.into(),
            destination_id: None,
            lane_key: None,
            marked_as_deleted: false,
        }
    }
}

/// Terminal outcome of one record, as written into the notifications log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeState {
    Success,
    Error,
    /// Not processed: filtered out by categorization or killed before start.
    /// A drop is not an error.
    Dropped,
}

impl OutcomeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutcomeState::Success => "SUCCESS",
            OutcomeState::Error => "ERROR",
            OutcomeState::Dropped => "DROPPED",
        }
    }
}

impl fmt::Display for OutcomeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only row describing one record's outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub task_id: i64,
    pub resource: String,
    pub state: OutcomeState,
    pub info_text: String,
    pub result_resource: Option<String>,
    pub additional_info: BTreeMap<String, String>,
    pub topology_name: String,
}

impl Notification {
    pub fn new(
        task_id: i64,
        resource: impl Into<String>,
        state: OutcomeState,
        topology_name: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            resource: resource.into(),
            state,
            info_text: String::new(),
            result_resource: None,
            additional_info: BTreeMap::new(),
            topology_name: topology_name.into(),
        }
    }

    pub fn with_info(mut self, text: impl Into<String>) -> Self {
        self.info_text = text.into();
        self
    }

    pub fn with_result(mut self, resource: impl Into<String>) -> Self {
        self.result_resource = Some(resource.into());
        self
    }
}

/// A [`Notification`] as it sits in storage: tagged with the bucket it was
/// routed to and its per-task sequence number. Within one (task, bucket)
/// partition rows are ordered by descending sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEntry {
    pub bucket: u64,
    pub sequence: u64,
    pub notification: Notification,
}

/// Sample detail row stored once per (task, error type, resource).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorNotification {
    pub task_id: i64,
    pub error_type: Uuid,
    pub error_message: String,
    pub resource: String,
    pub created_at: DateTime<Utc>,
}

/// Aggregated error class for a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorCounter {
    pub task_id: i64,
    pub error_type: Uuid,
    pub message: String,
    pub count: u64,
}

/// Advisory in-flight marker for a record inside a slow or retryable stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedRecord {
    pub task_id: i64,
    pub record_id: String,
    pub attempt_number: u32,
    pub started_at: DateTime<Utc>,
}

/// Last known harvest state of a record, used by incremental harvests to
/// skip unchanged content. Never deleted by normal pipeline operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub dataset_id: String,
    pub record_local_id: String,
    pub latest_harvest_date: DateTime<Utc>,
    /// Content fingerprint from the latest harvest. Absent for records
    /// written before fingerprinting was introduced.
    pub latest_harvest_fingerprint: Option<String>,
    /// When the record was last pushed to indexing; owned by a later
    /// pipeline phase and preserved untouched on re-harvest.
    pub indexing_date: Option<DateTime<Utc>>,
}
