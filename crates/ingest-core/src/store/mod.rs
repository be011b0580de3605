//! Durable state layer.
//!
//! One store per conceptual column family, each behind an async trait so
//! services can be exercised against fakes. The sled implementations keep
//! all coordination in the database: no store holds an in-process lock
//! across a call.

pub mod harvested_records;
pub mod kill_flags;
pub mod notifications;
pub mod processed_records;
pub mod statistics;
pub mod task_info;

pub use harvested_records::{HarvestedRecordStore, SledHarvestedRecordStore};
pub use kill_flags::{KillFlagStore, SledKillFlagStore};
pub use notifications::{NotificationStore, SledNotificationStore};
pub use processed_records::{ProcessedRecordStore, SledProcessedRecordStore};
pub use statistics::{NodeStatistic, SledStatisticsStore, StatisticsStore};
pub use task_info::{SledTaskInfoStore, TaskInfoStore};

use crate::error::StoreError;
use serde::Serialize;
use serde::de::DeserializeOwned;

pub(crate) fn task_key(task_id: i64) -> [u8; 8] {
    task_id.to_be_bytes()
}

pub(crate) fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    bincode::serialize(value).map_err(|e| StoreError::Codec(e.to_string()))
}

pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    bincode::deserialize(bytes).map_err(|e| StoreError::Codec(e.to_string()))
}

pub(crate) fn decode_u64(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    let len = bytes.len().min(8);
    buf[..len].copy_from_slice(&bytes[..len]);
    u64::from_be_bytes(buf)
}
