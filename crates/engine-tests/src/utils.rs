use crate::{INDEX, SNAPSHOT};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use connectors::{
    error::ConnectorError,
    source::synthetic::SyntheticSource,
    transport::{BulkHeaders, BulkTransport, TransportResponse},
};
use engine_core::{
    clock::Clock,
    error::LeaseStoreError,
    lease::{LeaseRequest, LeaseStore, UpdateResult},
    metrics::Metrics,
    retry::RetryPolicy,
};
use engine_processing::{config::PipelineConfig, failed_writer::FailedDocumentWriter, pipeline::ShardPipeline};
use engine_runtime::coordinator::{CoordinatorConfig, LeaseCoordinator};
use model::work::{item::WorkItem, lease::LeaseRecord};
use serde_json::{Value, json};
use std::{collections::VecDeque, sync::Arc, sync::Mutex, time::Duration};
use tokio::time::Instant;

/// Wall clock driven by tokio time, so paused-time tests can move leases
/// forward with `tokio::time::sleep`.
#[derive(Debug)]
pub struct TokioClock {
    start: DateTime<Utc>,
    origin: Instant,
}

impl TokioClock {
    /// Must be created inside the runtime whose time it follows.
    pub fn new() -> Self {
        Self {
            start: Utc::now(),
            origin: Instant::now(),
        }
    }
}

impl Clock for TokioClock {
    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::MAX);
        self.start.checked_add_signed(elapsed).unwrap_or(self.start)
    }
}

/// Bulk endpoint that replays scripted responses, then acknowledges
/// everything. Records the document ids of every request.
pub struct MockTransport {
    script: Mutex<VecDeque<TransportResponse>>,
    requests: Mutex<Vec<Vec<String>>>,
    sent_at: Mutex<Vec<Instant>>,
    delay: Duration,
}

impl MockTransport {
    pub fn acking() -> Arc<Self> {
        Self::scripted(Vec::new())
    }

    pub fn scripted(responses: Vec<TransportResponse>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        })
    }

    pub fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            sent_at: Mutex::new(Vec::new()),
            delay,
        })
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }

    /// When each request was started.
    pub fn sent_at(&self) -> Vec<Instant> {
        self.sent_at.lock().unwrap().clone()
    }

    /// Every position sent, in request order.
    pub fn positions_sent(&self) -> Vec<u64> {
        self.requests()
            .iter()
            .flatten()
            .map(|id| position_of(id))
            .collect()
    }
}

#[async_trait]
impl BulkTransport for MockTransport {
    async fn bulk_write(
        &self,
        _index: &str,
        body: Vec<u8>,
        _headers: &BulkHeaders,
    ) -> Result<TransportResponse, ConnectorError> {
        let text = String::from_utf8_lossy(&body);
        let ids: Vec<String> = text
            .lines()
            .step_by(2)
            .map(|line| {
                let action: Value = serde_json::from_str(line).unwrap();
                action["index"]["_id"].as_str().unwrap().to_string()
            })
            .collect();
        self.requests.lock().unwrap().push(ids.clone());
        self.sent_at.lock().unwrap().push(Instant::now());

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if let Some(response) = self.script.lock().unwrap().pop_front() {
            return Ok(response);
        }
        let statuses: Vec<(&str, u16)> = ids.iter().map(|id| (id.as_str(), 201)).collect();
        Ok(bulk_response(&statuses))
    }

    fn supports_compression(&self) -> bool {
        false
    }
}

/// Lease store that one holder cannot write to for a window of tokio time,
/// as if the network between them were down. Other holders and reads pass.
pub struct PartitionedStore {
    inner: Arc<dyn LeaseStore>,
    holder: String,
    from: Instant,
    until: Instant,
    first_rejection: Mutex<Option<Instant>>,
}

impl PartitionedStore {
    /// Offsets are measured from now.
    pub fn new(inner: Arc<dyn LeaseStore>, holder: &str, from: Duration, until: Duration) -> Arc<Self> {
        let now = Instant::now();
        Arc::new(Self {
            inner,
            holder: holder.to_string(),
            from: now + from,
            until: now + until,
            first_rejection: Mutex::new(None),
        })
    }

    /// When the store first refused a write from the partitioned holder.
    pub fn first_rejection(&self) -> Option<Instant> {
        *self.first_rejection.lock().unwrap()
    }
}

#[async_trait]
impl LeaseStore for PartitionedStore {
    async fn create_work_items(&self, items: &[WorkItem]) -> Result<usize, LeaseStoreError> {
        self.inner.create_work_items(items).await
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, LeaseStoreError> {
        self.inner.list_claimable(limit).await
    }

    async fn conditional_update(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError> {
        if request.holder_id != self.holder {
            return self.inner.conditional_update(item, request).await;
        }

        let now = Instant::now();
        if now >= self.from && now < self.until {
            return Err(LeaseStoreError::Unavailable("connection refused".to_string()));
        }

        let result = self.inner.conditional_update(item, request).await?;
        if matches!(result, UpdateResult::Rejected(_)) {
            self.first_rejection.lock().unwrap().get_or_insert(now);
        }
        Ok(result)
    }

    async fn get(&self, item: &WorkItem) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        self.inner.get(item).await
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseStoreError> {
        self.inner.list_all().await
    }
}

/// A `200` bulk response with one item per `(id, status)`.
pub fn bulk_response(statuses: &[(&str, u16)]) -> TransportResponse {
    let items: Vec<Value> = statuses
        .iter()
        .map(|(id, status)| {
            if *status < 300 {
                json!({"index": {"_id": id, "status": status}})
            } else {
                json!({"index": {"_id": id, "status": status,
                    "error": {"type": "es_rejected_execution_exception", "reason": "queue full"}}})
            }
        })
        .collect();
    let errors = statuses.iter().any(|(_, s)| *s >= 300);
    TransportResponse::new(200, json!({"errors": errors, "items": items}).to_string())
}

/// Synthetic ids end with the document's shard position.
pub fn position_of(id: &str) -> u64 {
    id.rsplit('-').next().unwrap().parse().unwrap()
}

pub fn synthetic_source(docs_per_shard: u64) -> Arc<SyntheticSource> {
    Arc::new(SyntheticSource::new(SNAPSHOT, vec![INDEX.to_string()], 1, docs_per_shard))
}

pub fn no_delay_retry(attempts: usize) -> RetryPolicy {
    RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO)
}

pub fn shard_pipeline(
    source: Arc<SyntheticSource>,
    transport: Arc<MockTransport>,
    config: PipelineConfig,
    metrics: Metrics,
) -> ShardPipeline {
    ShardPipeline::from_config(
        source,
        transport,
        Arc::new(FailedDocumentWriter::in_memory()),
        metrics,
        config.with_retry(no_delay_retry(3)),
    )
}

pub fn coordinator(
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    initial_lease: Duration,
    tolerance: Duration,
) -> LeaseCoordinator {
    LeaseCoordinator::new(
        store,
        clock,
        CoordinatorConfig {
            initial_lease,
            tolerable_clock_difference: tolerance,
            ..CoordinatorConfig::default()
        },
    )
    .with_retry(no_delay_retry(1))
}
