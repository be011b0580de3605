use crate::bucket::{HARVESTED_RECORDS_BUCKETS, bucket_for};
use crate::error::StoreError;
use crate::store::{decode, encode};
use async_trait::async_trait;
use model::record::HarvestedRecord;

/// Long-lived per-dataset harvest history, consulted by incremental
/// categorization. Rows outlive any single task.
#[async_trait]
pub trait HarvestedRecordStore: Send + Sync {
    /// Inserts or replaces the row for (dataset, record). The caller decides
    /// which fields carry over from a previous version.
    async fn upsert(&self, record: &HarvestedRecord) -> Result<(), StoreError>;

    async fn find(
        &self,
        dataset_id: &str,
        record_local_id: &str,
    ) -> Result<Option<HarvestedRecord>, StoreError>;

    async fn list_dataset(&self, dataset_id: &str) -> Result<Vec<HarvestedRecord>, StoreError>;

    async fn delete(&self, dataset_id: &str, record_local_id: &str) -> Result<(), StoreError>;
}

pub struct SledHarvestedRecordStore {
    records: sled::Tree,
    bucket_count: u32,
}

impl SledHarvestedRecordStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Self::with_bucket_count(db, HARVESTED_RECORDS_BUCKETS)
    }

    pub fn with_bucket_count(db: &sled::Db, bucket_count: u32) -> Result<Self, StoreError> {
        Ok(Self {
            records: db.open_tree("harvested_records")?,
            bucket_count: bucket_count.max(1),
        })
    }

    // Dataset ids never contain NUL, so the separator keeps prefixes
    // unambiguous ("ds1" never shadows "ds10").
    fn dataset_prefix(dataset_id: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(dataset_id.len() + 1);
        prefix.extend_from_slice(dataset_id.as_bytes());
        prefix.push(0);
        prefix
    }

    fn record_key(&self, dataset_id: &str, record_local_id: &str) -> Vec<u8> {
        let bucket = bucket_for(record_local_id, self.bucket_count);
        let mut key = Self::dataset_prefix(dataset_id);
        key.extend_from_slice(&bucket.to_be_bytes());
        key.extend_from_slice(record_local_id.as_bytes());
        key
    }
}

#[async_trait]
impl HarvestedRecordStore for SledHarvestedRecordStore {
    async fn upsert(&self, record: &HarvestedRecord) -> Result<(), StoreError> {
        let key = self.record_key(&record.dataset_id, &record.record_local_id);
        self.records.insert(key, encode(record)?)?;
        Ok(())
    }

    async fn find(
        &self,
        dataset_id: &str,
        record_local_id: &str,
    ) -> Result<Option<HarvestedRecord>, StoreError> {
        match self.records.get(self.record_key(dataset_id, record_local_id))? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_dataset(&self, dataset_id: &str) -> Result<Vec<HarvestedRecord>, StoreError> {
        let mut records = Vec::new();
        for entry in self.records.scan_prefix(Self::dataset_prefix(dataset_id)) {
            let (_, bytes) = entry?;
            records.push(decode(&bytes)?);
        }
        Ok(records)
    }

    async fn delete(&self, dataset_id: &str, record_local_id: &str) -> Result<(), StoreError> {
        self.records
            .remove(self.record_key(dataset_id, record_local_id))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::tempdir;

    fn record(dataset: &str, id: &str, fingerprint: &str) -> HarvestedRecord {
        HarvestedRecord {
            dataset_id: dataset.to_string(),
            record_local_id: id.to_string(),
            latest_harvest_date: Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap(),
            latest_harvest_fingerprint: Some(fingerprint.to_string()),
            indexing_date: None,
        }
    }

    #[tokio::test]
    async fn upsert_replaces_previous_version() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledHarvestedRecordStore::new(&db).unwrap();

        store.upsert(&record("ds1", "rec-a", "abc")).await.unwrap();
        store.upsert(&record("ds1", "rec-a", "xyz")).await.unwrap();

        let found = store.find("ds1", "rec-a").await.unwrap().unwrap();
        assert_eq!(found.latest_harvest_fingerprint.as_deref(), Some("xyz"));
    }

    #[tokio::test]
    async fn dataset_listing_does_not_cross_prefix_boundaries() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledHarvestedRecordStore::new(&db).unwrap();

        store.upsert(&record("ds1", "rec-a", "abc")).await.unwrap();
        store.upsert(&record("ds1", "rec-b", "abc")).await.unwrap();
        store.upsert(&record("ds10", "rec-c", "abc")).await.unwrap();

        let listed = store.list_dataset("ds1").await.unwrap();
        assert_eq!(listed.len(), 2);
        assert!(listed.iter().all(|r| r.dataset_id == "ds1"));
    }

    #[tokio::test]
    async fn delete_removes_only_the_named_record() {
        let dir = tempdir().unwrap();
        let db = sled::open(dir.path()).unwrap();
        let store = SledHarvestedRecordStore::new(&db).unwrap();

        store.upsert(&record("ds1", "rec-a", "abc")).await.unwrap();
        store.upsert(&record("ds1", "rec-b", "abc")).await.unwrap();
        store.delete("ds1", "rec-a").await.unwrap();

        assert!(store.find("ds1", "rec-a").await.unwrap().is_none());
        assert!(store.find("ds1", "rec-b").await.unwrap().is_some());
    }
}
