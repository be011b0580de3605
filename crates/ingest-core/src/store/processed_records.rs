use crate::bucket::{PROCESSED_RECORDS_BUCKETS, bucket_for};
use crate::error::StoreError;
use crate::store::{decode, encode, task_key};
use async_trait::async_trait;
use chrono::Utc;
use model::record::ProcessedRecord;

/// Advisory per-record attempt tracking.
///
/// Not a distributed lock: duplicate in-flight execution of a record is
/// possible and must be tolerated downstream. The store exists for stuck-
/// record dashboards and for the optional reprocessing guard.
#[async_trait]
pub trait ProcessedRecordStore: Send + Sync {
    async fn mark_started(
        &self,
        task_id: i64,
        record_id: &str,
        attempt_number: u32,
    ) -> Result<(), StoreError>;

    async fn clear(&self, task_id: i64, record_id: &str) -> Result<(), StoreError>;

    async fn is_in_flight(&self, task_id: i64, record_id: &str) -> Result<bool, StoreError>;

    async fn get(
        &self,
        task_id: i64,
        record_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError>;

    async fn update_attempt_number(
        &self,
        task_id: i64,
        record_id: &str,
        attempt_number: u32,
    ) -> Result<(), StoreError>;

    /// Drops every in-flight marker of the task; used by restart before
    /// progress is revalidated.
    async fn clear_task(&self, task_id: i64) -> Result<(), StoreError>;
}

pub struct SledProcessedRecordStore {
    records: sled::Tree,
    bucket_count: u32,
}

impl SledProcessedRecordStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Self::with_bucket_count(db, PROCESSED_RECORDS_BUCKETS)
    }

    pub fn with_bucket_count(db: &sled::Db, bucket_count: u32) -> Result<Self, StoreError> {
        Ok(Self {
            records: db.open_tree("processed_records")?,
            bucket_count: bucket_count.max(1),
        })
    }

    fn record_key(&self, task_id: i64, record_id: &str) -> Vec<u8> {
        let bucket = bucket_for(record_id, self.bucket_count);
        let mut key = Vec::with_capacity(12 + record_id.len());
        key.extend_from_slice(&task_key(task_id));
        key.extend_from_slice(&bucket.to_be_bytes());
        key.extend_from_slice(record_id.as_bytes());
        key
    }
}

#[async_trait]
impl ProcessedRecordStore for SledProcessedRecordStore {
    async fn mark_started(
        &self,
        task_id: i64,
        record_id: &str,
        attempt_number: u32,
    ) -> Result<(), StoreError> {
        let record = ProcessedRecord {
            task_id,
            record_id: record_id.to_string(),
            attempt_number,
            started_at: Utc::now(),
        };
        self.records
            .insert(self.record_key(task_id, record_id), encode(&record)?)?;
        Ok(())
    }

    async fn clear(&self, task_id: i64, record_id: &str) -> Result<(), StoreError> {
        self.records.remove(self.record_key(task_id, record_id))?;
        Ok(())
    }

    async fn is_in_flight(&self, task_id: i64, record_id: &str) -> Result<bool, StoreError> {
        Ok(self
            .records
            .contains_key(self.record_key(task_id, record_id))?)
    }

    async fn get(
        &self,
        task_id: i64,
        record_id: &str,
    ) -> Result<Option<ProcessedRecord>, StoreError> {
        match self.records.get(self.record_key(task_id, record_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn update_attempt_number(
        &self,
        task_id: i64,
        record_id: &str,
        attempt_number: u32,
    ) -> Result<(), StoreError> {
        let key = self.record_key(task_id, record_id);
        if let Some(bytes) = self.records.get(&key)? {
            let mut record: ProcessedRecord = decode(&bytes)?;
            record.attempt_number = attempt_number;
            self.records.insert(key, encode(&record)?)?;
        }
        Ok(())
    }

    async fn clear_task(&self, task_id: i64) -> Result<(), StoreError> {
        let keys: Vec<_> = self
            .records
            .scan_prefix(task_key(task_id))
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            self.records.remove(key)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn marks_and_clears_in_flight_records() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledProcessedRecordStore::new(&db).unwrap();

        assert!(!store.is_in_flight(1, "rec-a").await.unwrap());
        store.mark_started(1, "rec-a", 1).await.unwrap();
        assert!(store.is_in_flight(1, "rec-a").await.unwrap());

        let record = store.get(1, "rec-a").await.unwrap().unwrap();
        assert_eq!(record.attempt_number, 1);

        store.clear(1, "rec-a").await.unwrap();
        assert!(!store.is_in_flight(1, "rec-a").await.unwrap());
    }

    #[tokio::test]
    async fn attempt_number_updates_in_place() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledProcessedRecordStore::new(&db).unwrap();

        store.mark_started(1, "rec-a", 1).await.unwrap();
        store.update_attempt_number(1, "rec-a", 3).await.unwrap();
        let record = store.get(1, "rec-a").await.unwrap().unwrap();
        assert_eq!(record.attempt_number, 3);
    }

    #[tokio::test]
    async fn records_of_one_task_do_not_leak_into_another() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledProcessedRecordStore::new(&db).unwrap();

        store.mark_started(1, "rec-a", 1).await.unwrap();
        store.mark_started(2, "rec-a", 1).await.unwrap();
        store.clear_task(1).await.unwrap();

        assert!(!store.is_in_flight(1, "rec-a").await.unwrap());
        assert!(store.is_in_flight(2, "rec-a").await.unwrap());
    }

    #[tokio::test]
    async fn single_bucket_deployments_are_supported() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledProcessedRecordStore::with_bucket_count(&db, 1).unwrap();

        store.mark_started(1, "rec-a", 1).await.unwrap();
        store.mark_started(1, "rec-b", 1).await.unwrap();
        assert!(store.is_in_flight(1, "rec-a").await.unwrap());
        assert!(store.is_in_flight(1, "rec-b").await.unwrap());
    }
}
