use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct InnerMetrics {
    records_processed: AtomicU64,
    records_deleted: AtomicU64,
    records_dropped: AtomicU64,
    failure_count: AtomicU64,
    retry_count: AtomicU64,
}

/// Cheap in-process counters shared by all workers of one pipeline run.
/// These mirror the durable task counters but are safe to read at any
/// frequency without touching the store.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSnapshot {
    pub records_processed: u64,
    pub records_deleted: u64,
    pub records_dropped: u64,
    pub failure_count: u64,
    pub retry_count: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment_processed(&self, count: u64) {
        self.inner
            .records_processed
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_deleted(&self, count: u64) {
        self.inner
            .records_deleted
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_dropped(&self, count: u64) {
        self.inner
            .records_dropped
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_failures(&self, count: u64) {
        self.inner.failure_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self, count: u64) {
        self.inner.retry_count.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_processed: self.inner.records_processed.load(Ordering::Relaxed),
            records_deleted: self.inner.records_deleted.load(Ordering::Relaxed),
            records_dropped: self.inner.records_dropped.load(Ordering::Relaxed),
            failure_count: self.inner.failure_count.load(Ordering::Relaxed),
            retry_count: self.inner.retry_count.load(Ordering::Relaxed),
        }
    }
}
