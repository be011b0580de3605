use crate::error::StoreError;
use crate::store::{decode_u64, task_key};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// One aggregated occurrence counter for a node path within a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatistic {
    pub task_id: i64,
    pub node_path: String,
    pub node_value: Option<String>,
    pub occurrences: u64,
}

/// Per-task structural statistics gathered while records flow through the
/// pipeline. Counters are approximate under replays, like the task counters.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    async fn increment_occurrence(
        &self,
        task_id: i64,
        node_path: &str,
        node_value: Option<&str>,
        delta: u64,
    ) -> Result<(), StoreError>;

    async fn occurrences(&self, task_id: i64) -> Result<Vec<NodeStatistic>, StoreError>;

    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError>;
}

pub struct SledStatisticsStore {
    counters: sled::Tree,
}

impl SledStatisticsStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            counters: db.open_tree("node_statistics")?,
        })
    }

    // Node paths never contain NUL; the byte after the path separator tags
    // whether a value component follows.
    fn counter_key(task_id: i64, node_path: &str, node_value: Option<&str>) -> Vec<u8> {
        let mut key = Vec::with_capacity(10 + node_path.len());
        key.extend_from_slice(&task_key(task_id));
        key.extend_from_slice(node_path.as_bytes());
        key.push(0);
        match node_value {
            Some(value) => {
                key.push(1);
                key.extend_from_slice(value.as_bytes());
            }
            None => key.push(0),
        }
        key
    }

    fn parse_key(key: &[u8]) -> Result<(i64, String, Option<String>), StoreError> {
        let bad = || StoreError::Codec("malformed statistics key".to_string());
        if key.len() < 10 {
            return Err(bad());
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(&key[..8]);
        let task_id = i64::from_be_bytes(id);
        let rest = &key[8..];
        let sep = rest.iter().position(|b| *b == 0).ok_or_else(bad)?;
        let node_path = String::from_utf8_lossy(&rest[..sep]).into_owned();
        let tail = &rest[sep + 1..];
        let node_value = match tail.first().copied() {
            Some(1) => Some(String::from_utf8_lossy(&tail[1..]).into_owned()),
            Some(0) => None,
            _ => return Err(bad()),
        };
        Ok((task_id, node_path, node_value))
    }
}

#[async_trait]
impl StatisticsStore for SledStatisticsStore {
    async fn increment_occurrence(
        &self,
        task_id: i64,
        node_path: &str,
        node_value: Option<&str>,
        delta: u64,
    ) -> Result<(), StoreError> {
        let key = Self::counter_key(task_id, node_path, node_value);
        self.counters.update_and_fetch(key, |current| {
            let next = current.map(decode_u64).unwrap_or(0).saturating_add(delta);
            Some(next.to_be_bytes().to_vec())
        })?;
        Ok(())
    }

    async fn occurrences(&self, task_id: i64) -> Result<Vec<NodeStatistic>, StoreError> {
        let mut stats = Vec::new();
        for entry in self.counters.scan_prefix(task_key(task_id)) {
            let (key, value) = entry?;
            let (task_id, node_path, node_value) = Self::parse_key(&key)?;
            stats.push(NodeStatistic {
                task_id,
                node_path,
                node_value,
                occurrences: decode_u64(&value),
            });
        }
        Ok(stats)
    }

    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError> {
        let keys: Vec<_> = self
            .counters
            .scan_prefix(task_key(task_id))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.counters.remove(key)?;
        }
        Ok(())
    }
}
