//! Bucketed key scheme.
//!
//! Every high-cardinality per-record write under a single task is spread
//! across a bounded number of physical partitions, so partition size stays
//! bounded regardless of task size. All stateful stores parameterize their
//! keys through the functions below.

use xxhash_rust::xxh3::xxh3_64;

/// Bucket count for the processed-records store.
pub const PROCESSED_RECORDS_BUCKETS: u32 = 128;

/// Bucket count for the harvested-records store.
pub const HARVESTED_RECORDS_BUCKETS: u32 = 64;

/// Notifications are bucketed by sequence ranges of this size.
pub const NOTIFICATION_BUCKET_SIZE: u64 = 10_000;

/// Stable hash bucket for a record identifier.
///
/// Deterministic and uniform; a `bucket_count` of 1 degrades to the
/// unbucketed behaviour and is supported for small deployments.
pub fn bucket_for(key: &str, bucket_count: u32) -> u32 {
    let count = bucket_count.max(1) as u64;
    (xxh3_64(key.as_bytes()) % count) as u32
}

/// Bucket for a sequence-assigned partition: consecutive sequence numbers
/// land in the same bucket until `bucket_size` of them accumulate.
///
/// Stays `u64` because unseeded tasks allocate sequences near `u64::MAX >> 1`
/// and their bucket indices do not fit in 32 bits.
pub fn sequence_bucket(sequence: u64, bucket_size: u64) -> u64 {
    sequence / bucket_size.max(1)
}
