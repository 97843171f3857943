use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

#[derive(Debug, Default)]
struct InnerMetrics {
    docs_written: AtomicU64,
    docs_failed: AtomicU64,
    bytes_sent: AtomicU64,
    batches_written: AtomicU64,
    bulk_requests: AtomicU64,
    bulk_retries: AtomicU64,
    lease_renewals: AtomicU64,
}

/// Process-wide counters, cheap to clone into writer tasks.
#[derive(Debug, Clone)]
pub struct Metrics {
    inner: Arc<InnerMetrics>,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct MetricsSnapshot {
    pub docs_written: u64,
    pub docs_failed: u64,
    pub bytes_sent: u64,
    pub batches_written: u64,
    pub bulk_requests: u64,
    pub bulk_retries: u64,
    pub lease_renewals: u64,
}

impl Metrics {
    pub fn new() -> Self {
        Metrics {
            inner: Arc::new(InnerMetrics::default()),
        }
    }

    pub fn increment_docs_written(&self, count: u64) {
        self.inner.docs_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_docs_failed(&self, count: u64) {
        self.inner.docs_failed.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_bytes(&self, count: u64) {
        self.inner.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_batches(&self, count: u64) {
        self.inner.batches_written.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_requests(&self, count: u64) {
        self.inner.bulk_requests.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_retries(&self, count: u64) {
        self.inner.bulk_retries.fetch_add(count, Ordering::Relaxed);
    }

    pub fn increment_renewals(&self, count: u64) {
        self.inner.lease_renewals.fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            docs_written: self.inner.docs_written.load(Ordering::Relaxed),
            docs_failed: self.inner.docs_failed.load(Ordering::Relaxed),
            bytes_sent: self.inner.bytes_sent.load(Ordering::Relaxed),
            batches_written: self.inner.batches_written.load(Ordering::Relaxed),
            bulk_requests: self.inner.bulk_requests.load(Ordering::Relaxed),
            bulk_retries: self.inner.bulk_retries.load(Ordering::Relaxed),
            lease_renewals: self.inner.lease_renewals.load(Ordering::Relaxed),
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
