use crate::error::StoreError;
use crate::store::task_key;
use async_trait::async_trait;

/// Cancellation requests, written by operators or by the system when a task
/// must stop. Readers poll; a flag only ever appears or disappears whole.
#[async_trait]
pub trait KillFlagStore: Send + Sync {
    async fn set_kill_flag(&self, task_id: i64, reason: &str) -> Result<(), StoreError>;

    async fn has_kill_flag(&self, task_id: i64) -> Result<bool, StoreError>;

    async fn kill_reason(&self, task_id: i64) -> Result<Option<String>, StoreError>;

    async fn clear_kill_flag(&self, task_id: i64) -> Result<(), StoreError>;
}

pub struct SledKillFlagStore {
    flags: sled::Tree,
}

impl SledKillFlagStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            flags: db.open_tree("kill_flags")?,
        })
    }
}

#[async_trait]
impl KillFlagStore for SledKillFlagStore {
    async fn set_kill_flag(&self, task_id: i64, reason: &str) -> Result<(), StoreError> {
        self.flags
            .insert(task_key(task_id), reason.as_bytes().to_vec())?;
        Ok(())
    }

    async fn has_kill_flag(&self, task_id: i64) -> Result<bool, StoreError> {
        Ok(self.flags.contains_key(task_key(task_id))?)
    }

    async fn kill_reason(&self, task_id: i64) -> Result<Option<String>, StoreError> {
        Ok(self
            .flags
            .get(task_key(task_id))?
            .map(|v| String::from_utf8_lossy(&v).into_owned()))
    }

    async fn clear_kill_flag(&self, task_id: i64) -> Result<(), StoreError> {
        self.flags.remove(task_key(task_id))?;
        Ok(())
    }
}
