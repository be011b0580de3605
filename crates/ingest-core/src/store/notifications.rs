use crate::bucket::{NOTIFICATION_BUCKET_SIZE, sequence_bucket};
use crate::error::StoreError;
use crate::store::{decode, decode_u64, encode, task_key};
use async_trait::async_trait;
use chrono::Utc;
use model::record::{ErrorCounter, ErrorNotification, Notification, NotificationEntry};
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

/// Sequence seed used when a task appends notifications before its expected
/// record count is known. Large enough that sequences keep strictly
/// decreasing for any realistic task.
const UNSEEDED_SEQUENCE: u64 = u64::MAX >> 1;

/// Bucketed, append-only log of per-record outcomes plus the error-class
/// aggregation for each task.
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Seeds the task's sequence counter from its expected record count, so
    /// sequences carry "remaining records at time of write". A no-op when
    /// the counter already exists.
    async fn seed_sequence(&self, task_id: i64, expected: u64) -> Result<(), StoreError>;

    /// Allocates the next (strictly decreasing) sequence, routes the row to
    /// its bucket, and writes it. Rows are never overwritten; once the
    /// sequence range seeded for the task is used up, further appends fail
    /// with [`StoreError::SequenceExhausted`].
    async fn append(&self, notification: Notification) -> Result<NotificationEntry, StoreError>;

    /// Scatter-gather read across all buckets of the task, merged by
    /// descending sequence. Best-effort chronological across buckets.
    async fn read_report(&self, task_id: i64) -> Result<Vec<NotificationEntry>, StoreError>;

    /// Number of notifications appended so far, derived from the sequence
    /// counter rather than a scan.
    async fn appended_count(&self, task_id: i64) -> Result<u64, StoreError>;

    /// Counts the error against its class, minting a time-ordered error
    /// type on the first sighting of `message` for this task, and keeps at
    /// most one sample detail row per (error type, resource).
    async fn record_error(
        &self,
        task_id: i64,
        message: &str,
        resource: &str,
    ) -> Result<Uuid, StoreError>;

    /// Aggregated error classes for the task, largest first.
    async fn error_report(&self, task_id: i64) -> Result<Vec<ErrorCounter>, StoreError>;

    async fn error_samples(
        &self,
        task_id: i64,
        error_type: Uuid,
    ) -> Result<Vec<ErrorNotification>, StoreError>;

    /// Administrative purge of every row the task owns.
    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError>;
}

pub struct SledNotificationStore {
    notifications: sled::Tree,
    sequences: sled::Tree,
    seeds: sled::Tree,
    error_types: sled::Tree,
    error_counters: sled::Tree,
    error_notifications: sled::Tree,
}

impl SledNotificationStore {
    pub fn new(db: &sled::Db) -> Result<Self, StoreError> {
        Ok(Self {
            notifications: db.open_tree("notifications")?,
            sequences: db.open_tree("notification_sequences")?,
            seeds: db.open_tree("notification_seeds")?,
            error_types: db.open_tree("error_types")?,
            error_counters: db.open_tree("error_counters")?,
            error_notifications: db.open_tree("error_notifications")?,
        })
    }

    /// Key layout: task id, bucket, then the bitwise-inverted sequence so a
    /// forward scan of one bucket yields descending sequence order.
    fn notification_key(task_id: i64, bucket: u64, sequence: u64) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&task_key(task_id));
        key[8..16].copy_from_slice(&bucket.to_be_bytes());
        key[16..].copy_from_slice(&(u64::MAX - sequence).to_be_bytes());
        key
    }

    fn bucket_prefix(task_id: i64, bucket: u64) -> [u8; 16] {
        let mut prefix = [0u8; 16];
        prefix[..8].copy_from_slice(&task_key(task_id));
        prefix[8..].copy_from_slice(&bucket.to_be_bytes());
        prefix
    }

    fn error_type_key(task_id: i64, message: &str) -> [u8; 16] {
        let mut key = [0u8; 16];
        key[..8].copy_from_slice(&task_key(task_id));
        key[8..].copy_from_slice(&xxh3_64(message.as_bytes()).to_be_bytes());
        key
    }

    fn error_counter_key(task_id: i64, error_type: Uuid) -> [u8; 24] {
        let mut key = [0u8; 24];
        key[..8].copy_from_slice(&task_key(task_id));
        key[8..].copy_from_slice(error_type.as_bytes());
        key
    }

    fn error_sample_key(task_id: i64, error_type: Uuid, resource: &str) -> Vec<u8> {
        let mut key = Vec::with_capacity(24 + resource.len());
        key.extend_from_slice(&task_key(task_id));
        key.extend_from_slice(error_type.as_bytes());
        key.extend_from_slice(resource.as_bytes());
        key
    }

    /// Decrements the task's sequence counter and returns the new value.
    ///
    /// A counter that already reached 0 has handed out its whole range;
    /// allocating past it would re-issue sequence 0 and overwrite the row
    /// written under it, so exhaustion is an error instead.
    fn allocate_sequence(&self, task_id: i64) -> Result<u64, StoreError> {
        let previous = self.sequences.fetch_and_update(task_key(task_id), |old| {
            let next = match old {
                Some(bytes) => decode_u64(bytes).saturating_sub(1),
                None => UNSEEDED_SEQUENCE - 1,
            };
            Some(next.to_be_bytes().to_vec())
        })?;
        match previous.map(|v| decode_u64(&v)) {
            None => Ok(UNSEEDED_SEQUENCE - 1),
            Some(0) => Err(StoreError::SequenceExhausted(task_id)),
            Some(counter) => Ok(counter - 1),
        }
    }

    fn seed_of(&self, task_id: i64) -> Result<Option<u64>, StoreError> {
        Ok(self.seeds.get(task_key(task_id))?.map(|v| decode_u64(&v)))
    }

    /// Mints (or re-reads) the stable error type for a message. The durable
    /// row makes the mapping survive worker restarts; racing writers settle
    /// via compare-and-swap.
    fn error_type_for(&self, task_id: i64, message: &str) -> Result<Uuid, StoreError> {
        let key = Self::error_type_key(task_id, message);
        if let Some(bytes) = self.error_types.get(key)? {
            let (uuid, _msg): (Uuid, String) = decode(&bytes)?;
            return Ok(uuid);
        }

        let minted = Uuid::now_v7();
        let encoded = encode(&(minted, message.to_string()))?;
        match self
            .error_types
            .compare_and_swap(key, None as Option<&[u8]>, Some(encoded))?
        {
            Ok(()) => Ok(minted),
            Err(race) => {
                let bytes = race.current.ok_or_else(|| {
                    StoreError::Codec("error type row vanished during mint".into())
                })?;
                let (uuid, _msg): (Uuid, String) = decode(&bytes)?;
                Ok(uuid)
            }
        }
    }

    fn remove_prefix(tree: &sled::Tree, prefix: &[u8]) -> Result<(), StoreError> {
        let keys: Vec<_> = tree
            .scan_prefix(prefix)
            .keys()
            .collect::<Result<_, _>>()?;
        for key in keys {
            tree.remove(key)?;
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationStore for SledNotificationStore {
    async fn seed_sequence(&self, task_id: i64, expected: u64) -> Result<(), StoreError> {
        let key = task_key(task_id);
        let value = expected.to_be_bytes().to_vec();
        let _ = self
            .seeds
            .compare_and_swap(key, None as Option<&[u8]>, Some(value.clone()))?;
        let _ = self
            .sequences
            .compare_and_swap(key, None as Option<&[u8]>, Some(value))?;
        Ok(())
    }

    async fn append(&self, notification: Notification) -> Result<NotificationEntry, StoreError> {
        let task_id = notification.task_id;
        let sequence = self.allocate_sequence(task_id)?;
        let bucket = sequence_bucket(sequence, NOTIFICATION_BUCKET_SIZE);

        let entry = NotificationEntry {
            bucket,
            sequence,
            notification,
        };
        self.notifications.insert(
            Self::notification_key(task_id, bucket, sequence),
            encode(&entry)?,
        )?;
        Ok(entry)
    }

    async fn read_report(&self, task_id: i64) -> Result<Vec<NotificationEntry>, StoreError> {
        // Sequences are allocated consecutively downward, so the occupied
        // buckets form a contiguous range between the newest allocation and
        // the first one below the seed.
        let Some(current) = self.sequences.get(task_key(task_id))?.map(|v| decode_u64(&v)) else {
            return Ok(Vec::new());
        };
        let seed = self.seed_of(task_id)?.unwrap_or(UNSEEDED_SEQUENCE);
        let low = sequence_bucket(current, NOTIFICATION_BUCKET_SIZE);
        let high = sequence_bucket(seed.saturating_sub(1), NOTIFICATION_BUCKET_SIZE);

        let mut entries = Vec::new();
        for bucket in low..=high {
            for item in self
                .notifications
                .scan_prefix(Self::bucket_prefix(task_id, bucket))
            {
                let (_, value) = item?;
                entries.push(decode::<NotificationEntry>(&value)?);
            }
        }
        entries.sort_unstable_by(|a, b| b.sequence.cmp(&a.sequence));
        Ok(entries)
    }

    async fn appended_count(&self, task_id: i64) -> Result<u64, StoreError> {
        let Some(current) = self.sequences.get(task_key(task_id))?.map(|v| decode_u64(&v)) else {
            return Ok(0);
        };
        let seed = self.seed_of(task_id)?.unwrap_or(UNSEEDED_SEQUENCE);
        Ok(seed.saturating_sub(current))
    }

    async fn record_error(
        &self,
        task_id: i64,
        message: &str,
        resource: &str,
    ) -> Result<Uuid, StoreError> {
        let error_type = self.error_type_for(task_id, message)?;

        self.error_counters
            .update_and_fetch(Self::error_counter_key(task_id, error_type), |old| {
                let current = old.map(decode_u64).unwrap_or(0);
                Some((current + 1).to_be_bytes().to_vec())
            })?;

        let sample = ErrorNotification {
            task_id,
            error_type,
            error_message: message.to_string(),
            resource: resource.to_string(),
            created_at: Utc::now(),
        };
        // One sample per (error type, resource); later hits keep the first.
        let _ = self.error_notifications.compare_and_swap(
            Self::error_sample_key(task_id, error_type, resource),
            None as Option<&[u8]>,
            Some(encode(&sample)?),
        )?;

        Ok(error_type)
    }

    async fn error_report(&self, task_id: i64) -> Result<Vec<ErrorCounter>, StoreError> {
        let mut report = Vec::new();
        for item in self.error_types.scan_prefix(task_key(task_id)) {
            let (_, value) = item?;
            let (error_type, message): (Uuid, String) = decode(&value)?;
            let count = self
                .error_counters
                .get(Self::error_counter_key(task_id, error_type))?
                .map(|v| decode_u64(&v))
                .unwrap_or(0);
            report.push(ErrorCounter {
                task_id,
                error_type,
                message,
                count,
            });
        }
        report.sort_unstable_by(|a, b| b.count.cmp(&a.count));
        Ok(report)
    }

    async fn error_samples(
        &self,
        task_id: i64,
        error_type: Uuid,
    ) -> Result<Vec<ErrorNotification>, StoreError> {
        let mut prefix = Vec::with_capacity(24);
        prefix.extend_from_slice(&task_key(task_id));
        prefix.extend_from_slice(error_type.as_bytes());

        let mut samples = Vec::new();
        for item in self.error_notifications.scan_prefix(prefix) {
            let (_, value) = item?;
            samples.push(decode::<ErrorNotification>(&value)?);
        }
        Ok(samples)
    }

    async fn purge_task(&self, task_id: i64) -> Result<(), StoreError> {
        let prefix = task_key(task_id);
        Self::remove_prefix(&self.notifications, &prefix)?;
        Self::remove_prefix(&self.error_types, &prefix)?;
        Self::remove_prefix(&self.error_counters, &prefix)?;
        Self::remove_prefix(&self.error_notifications, &prefix)?;
        self.sequences.remove(prefix)?;
        self.seeds.remove(prefix)?;
        Ok(())
    }
}
