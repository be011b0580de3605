use crate::error::StoreError;
use crate::registry::TopologyRegistry;
use crate::store::{decode, decode_u64, encode, task_key};
use async_trait::async_trait;
use chrono::Utc;
use model::task::{TaskCounters, TaskDefinition, TaskInfo, TaskState};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use tracing::{debug, info};

/// Durable record of each task's lifecycle.
#[async_trait]
pub trait TaskInfoStore: Send + Sync {
    /// Validates and persists a new PENDING task, returning its id.
    /// Duplicate detection across submissions is a caller responsibility.
    async fn register_task(
        &self,
        definition: &TaskDefinition,
        registry: &TopologyRegistry,
    ) -> Result<i64, StoreError>;

    /// Moves the task to `state`. Fails with
    /// [`StoreError::InvalidTransition`] if the task is terminal and `state`
    /// would move it backward; otherwise last-writer-wins.
    async fn update_state(
        &self,
        task_id: i64,
        state: TaskState,
        description: &str,
    ) -> Result<(), StoreError>;

    /// Commutative counter increments, safe under concurrent writers.
    ///
    /// Increments are not deduplicated: a retried record outcome that was
    /// already counted counts again. Exact-once counting would require a
    /// per-record terminal marker before the increment.
    async fn increment_counters(&self, task_id: i64, deltas: TaskCounters)
    -> Result<(), StoreError>;

    async fn set_expected_records(&self, task_id: i64, expected: u64) -> Result<(), StoreError>;

    /// Point read; never fails for a task that was registered.
    async fn get_status(&self, task_id: i64) -> Result<TaskInfo, StoreError>;

    async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<i64>, StoreError>;

    /// Administrative purge; the only way a task row is physically deleted.
    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError>;

    async fn set_task_dropped(&self, task_id: i64, reason: &str) -> Result<(), StoreError> {
        self.update_state(task_id, TaskState::Dropped, reason).await
    }

    async fn set_task_completely_processed(
        &self,
        task_id: i64,
        description: &str,
    ) -> Result<(), StoreError> {
        self.update_state(task_id, TaskState::Processed, description)
            .await
    }
}

const COUNTER_TAGS: [u8; 5] = [0, 1, 2, 3, 4];

pub struct SledTaskInfoStore {
    db: sled::Db,
    tasks: sled::Tree,
    counters: sled::Tree,
    by_state: sled::Tree,
}

impl SledTaskInfoStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            db: db.clone(),
            tasks: db.open_tree("task_info")?,
            counters: db.open_tree("task_counters")?,
            by_state: db.open_tree("tasks_by_state")?,
        })
    }

    fn counter_key(task_id: i64, tag: u8) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[..8].copy_from_slice(&task_key(task_id));
        key[8] = tag;
        key
    }

    fn by_state_key(state: TaskState, task_id: i64) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = state as u8;
        key[1..].copy_from_slice(&task_key(task_id));
        key
    }

    fn add_counter(&self, task_id: i64, tag: u8, delta: u64) -> Result<(), StoreError> {
        if delta == 0 {
            return Ok(());
        }
        self.counters
            .update_and_fetch(Self::counter_key(task_id, tag), |old| {
                let current = old.map(decode_u64).unwrap_or(0);
                Some((current + delta).to_be_bytes().to_vec())
            })?;
        Ok(())
    }

    fn read_counter(&self, task_id: i64, tag: u8) -> Result<u64, StoreError> {
        Ok(self
            .counters
            .get(Self::counter_key(task_id, tag))?
            .map(|v| decode_u64(&v))
            .unwrap_or(0))
    }
}

#[async_trait]
impl TaskInfoStore for SledTaskInfoStore {
    async fn register_task(
        &self,
        definition: &TaskDefinition,
        registry: &TopologyRegistry,
    ) -> Result<i64, StoreError> {
        if definition.topology_name.trim().is_empty() {
            return Err(StoreError::InvalidDefinition(
                "topology name must not be empty".into(),
            ));
        }
        registry.resolve(&definition.topology_name)?;

        let serialized = serde_json::to_string(definition)
            .map_err(|e| StoreError::InvalidDefinition(e.to_string()))?;
        let task_id = self.db.generate_id()? as i64;

        let info = TaskInfo {
            task_id,
            topology_name: definition.topology_name.clone(),
            state: TaskState::Pending,
            state_description: String::new(),
            sent_at: Utc::now(),
            started_at: None,
            finished_at: None,
            expected_records: None,
            counters: TaskCounters::default(),
            definition: serialized,
        };

        self.tasks.insert(task_key(task_id), encode(&info)?)?;
        self.by_state
            .insert(Self::by_state_key(TaskState::Pending, task_id), vec![])?;
        info!(task_id, topology = %definition.topology_name, "task registered");
        Ok(task_id)
    }

    async fn update_state(
        &self,
        task_id: i64,
        state: TaskState,
        description: &str,
    ) -> Result<(), StoreError> {
        let key = task_key(task_id);

        // Check-then-set inside a transaction so two racing finalizers
        // cannot move a terminal task backward.
        let result = self
            .tasks
            .transaction::<_, _, StoreError>(|tx| {
                let Some(bytes) = tx.get(key)? else {
                    return Err(ConflictableTransactionError::Abort(StoreError::TaskNotFound(
                        task_id,
                    )));
                };
                let mut info: TaskInfo =
                    decode(&bytes).map_err(ConflictableTransactionError::Abort)?;

                if !info.state.can_transition_to(state) {
                    return Err(ConflictableTransactionError::Abort(
                        StoreError::InvalidTransition {
                            from: info.state,
                            to: state,
                        },
                    ));
                }

                let previous = info.state;
                info.state = state;
                info.state_description = description.to_string();
                let now = Utc::now();
                if state == TaskState::CurrentlyProcessing && info.started_at.is_none() {
                    info.started_at = Some(now);
                }
                if state.is_terminal() && info.finished_at.is_none() {
                    info.finished_at = Some(now);
                }

                let encoded = encode(&info).map_err(ConflictableTransactionError::Abort)?;
                tx.insert(&key[..], encoded)?;
                Ok(previous)
            });

        let previous = match result {
            Ok(previous) => previous,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        };

        debug!(task_id, from = %previous, to = %state, "task state updated");

        // Secondary listing is advisory; maintained outside the transaction.
        if previous != state {
            self.by_state
                .remove(Self::by_state_key(previous, task_id))?;
            self.by_state
                .insert(Self::by_state_key(state, task_id), vec![])?;
        }
        Ok(())
    }

    async fn increment_counters(
        &self,
        task_id: i64,
        deltas: TaskCounters,
    ) -> Result<(), StoreError> {
        self.add_counter(task_id, 0, deltas.processed)?;
        self.add_counter(task_id, 1, deltas.ignored)?;
        self.add_counter(task_id, 2, deltas.deleted)?;
        self.add_counter(task_id, 3, deltas.processed_errors)?;
        self.add_counter(task_id, 4, deltas.deleted_errors)?;
        Ok(())
    }

    async fn set_expected_records(&self, task_id: i64, expected: u64) -> Result<(), StoreError> {
        let key = task_key(task_id);
        let result = self.tasks.transaction::<_, _, StoreError>(|tx| {
            let Some(bytes) = tx.get(key)? else {
                return Err(ConflictableTransactionError::Abort(StoreError::TaskNotFound(
                    task_id,
                )));
            };
            let mut info: TaskInfo = decode(&bytes).map_err(ConflictableTransactionError::Abort)?;
            info.expected_records = Some(expected);
            let encoded = encode(&info).map_err(ConflictableTransactionError::Abort)?;
            tx.insert(&key[..], encoded)?;
            Ok(())
        });
        match result {
            Ok(()) => Ok(()),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(e.into()),
        }
    }

    async fn get_status(&self, task_id: i64) -> Result<TaskInfo, StoreError> {
        let bytes = self
            .tasks
            .get(task_key(task_id))?
            .ok_or(StoreError::TaskNotFound(task_id))?;
        let mut info: TaskInfo = decode(&bytes)?;
        info.counters = TaskCounters {
            processed: self.read_counter(task_id, 0)?,
            ignored: self.read_counter(task_id, 1)?,
            deleted: self.read_counter(task_id, 2)?,
            processed_errors: self.read_counter(task_id, 3)?,
            deleted_errors: self.read_counter(task_id, 4)?,
        };
        Ok(info)
    }

    async fn tasks_in_state(&self, state: TaskState) -> Result<Vec<i64>, StoreError> {
        let mut ids = Vec::new();
        for item in self.by_state.scan_prefix([state as u8]) {
            let (key, _) = item?;
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&key[1..9]);
            ids.push(i64::from_be_bytes(buf));
        }
        Ok(ids)
    }

    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError> {
        if let Some(bytes) = self.tasks.remove(task_key(task_id))? {
            let info: TaskInfo = decode(&bytes)?;
            self.by_state
                .remove(Self::by_state_key(info.state, task_id))?;
        }
        for tag in COUNTER_TAGS {
            self.counters.remove(Self::counter_key(task_id, tag))?;
        }
        Ok(())
    }
}
