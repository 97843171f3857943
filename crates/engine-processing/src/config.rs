use engine_core::retry::RetryPolicy;
use serde::{Deserialize, Serialize};

/// Whether request bodies may be gzip-compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// Compress when the transport says the target accepts it.
    #[default]
    Auto,
    Disabled,
}

/// What happens to submitted bulk requests once the pipeline is told to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InFlightPolicy {
    /// Let submitted requests run to completion.
    #[default]
    Finish,
    /// Drop submitted requests at their next await point.
    Abort,
}

/// Configuration for the shard pipeline.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_docs_per_batch: usize,
    pub max_bytes_per_batch: usize,

    /// Writer tasks, and therefore the most bulk requests in flight at once.
    pub max_concurrent_requests: usize,

    /// Batches buffered between the batcher and the writers before the
    /// batcher has to wait.
    pub queue_depth: usize,

    /// `None` disables rate limiting.
    pub max_requests_per_second: Option<f64>,
    pub burst: u32,

    pub retry: RetryPolicy,
    pub compression: CompressionMode,
    pub in_flight_policy: InFlightPolicy,

    /// Byte budget for cached serialized bulk sections. Zero disables the cache.
    pub serialization_cache_bytes: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_docs_per_batch: 1_000,
            max_bytes_per_batch: 10 * 1024 * 1024,
            max_concurrent_requests: 4,
            queue_depth: 8,
            max_requests_per_second: None,
            burst: 1,
            retry: RetryPolicy::for_bulk(),
            compression: CompressionMode::Auto,
            in_flight_policy: InFlightPolicy::Finish,
            serialization_cache_bytes: 32 * 1024 * 1024,
        }
    }
}

impl PipelineConfig {
    pub fn with_batch_limits(mut self, max_docs: usize, max_bytes: usize) -> Self {
        self.max_docs_per_batch = max_docs;
        self.max_bytes_per_batch = max_bytes;
        self
    }

    pub fn with_concurrency(mut self, max_concurrent_requests: usize) -> Self {
        self.max_concurrent_requests = max_concurrent_requests.max(1);
        self
    }

    pub fn with_rate_limit(mut self, per_second: f64, burst: u32) -> Self {
        self.max_requests_per_second = (per_second > 0.0).then_some(per_second);
        self.burst = burst.max(1);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_in_flight_policy(mut self, policy: InFlightPolicy) -> Self {
        self.in_flight_policy = policy;
        self
    }

    pub fn with_serialization_cache_bytes(mut self, bytes: u64) -> Self {
        self.serialization_cache_bytes = bytes;
        self
    }
}
