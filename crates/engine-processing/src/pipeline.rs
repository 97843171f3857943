use crate::{
    batcher::BulkBatcher,
    bulk::{
        client::BulkIndexClient,
        serialize::{BulkSerializer, SerializationCache},
    },
    config::PipelineConfig,
    error::{BulkError, PipelineError},
    failed_writer::FailedDocumentWriter,
    rate_limit::RateLimiter,
    writer_pool::{SequencedResult, WriterPool},
};
use connectors::{source::DocumentSource, transport::BulkTransport};
use engine_core::metrics::Metrics;
use futures::StreamExt;
use model::{
    execution::outcome::BatchStatus, pagination::cursor::ProgressCursor, work::item::WorkItem,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc, time::Instant};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineExit {
    /// The shard was read to the end and every batch was accounted for.
    Drained,
    /// Stopped before the end; resume from `last_cursor`.
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineSummary {
    pub exit: PipelineExit,
    pub batches: usize,
    pub docs_written: u64,
    pub docs_failed: u64,
    pub last_cursor: Option<ProgressCursor>,
}

/// Reads one shard from an offset and writes it to the target.
///
/// source -> batcher -> bounded queue -> writer pool -> in-order acknowledgement.
/// Each acknowledged batch moves the published cursor forward; batches that
/// finish out of order wait until every earlier batch has finished.
pub struct ShardPipeline {
    source: Arc<dyn DocumentSource>,
    client: Arc<BulkIndexClient>,
    serializer: BulkSerializer,
    config: PipelineConfig,
}

impl ShardPipeline {
    pub fn new(
        source: Arc<dyn DocumentSource>,
        client: Arc<BulkIndexClient>,
        serializer: BulkSerializer,
        config: PipelineConfig,
    ) -> Self {
        Self {
            source,
            client,
            serializer,
            config,
        }
    }

    /// Wires the serializer cache, rate limiter and bulk client from `config`.
    pub fn from_config(
        source: Arc<dyn DocumentSource>,
        transport: Arc<dyn BulkTransport>,
        failed: Arc<FailedDocumentWriter>,
        metrics: Metrics,
        config: PipelineConfig,
    ) -> Self {
        let cache = (config.serialization_cache_bytes > 0)
            .then(|| SerializationCache::new(config.serialization_cache_bytes));
        let serializer = BulkSerializer::new(cache);
        let limiter = config
            .max_requests_per_second
            .map(|rate| Arc::new(RateLimiter::new(rate, config.burst)));

        let client = BulkIndexClient::new(
            transport,
            serializer.clone(),
            config.retry.clone(),
            failed,
            metrics,
        )
        .with_compression(config.compression)
        .with_rate_limiter(limiter);

        Self::new(source, Arc::new(client), serializer, config)
    }

    /// Streams `item` from `start_offset` into `target_index`.
    ///
    /// `stop` ends the run early: no new batch is formed or started after it
    /// fires. Every acknowledged cursor is published on `progress`.
    pub async fn run(
        &self,
        item: &WorkItem,
        target_index: &str,
        start_offset: u64,
        stop: &CancellationToken,
        progress: &watch::Sender<Option<ProgressCursor>>,
    ) -> Result<PipelineSummary, PipelineError> {
        let started = Instant::now();
        let halt = stop.child_token();

        info!(work_item = %item, target_index, start_offset, "Starting shard pipeline");
        let stream = self.source.read_documents(item, start_offset).await?;

        let (pool, batch_tx, result_rx) = WriterPool::spawn(
            self.client.clone(),
            target_index.to_string(),
            self.config.max_concurrent_requests,
            self.config.queue_depth,
            self.config.in_flight_policy,
            halt.clone(),
        );

        let batcher = BulkBatcher::new(
            item.clone(),
            target_index,
            self.config.max_docs_per_batch,
            self.config.max_bytes_per_batch,
            self.serializer.clone(),
        );

        let produce = produce(stream, batcher, batch_tx, halt.clone());
        let collect = collect(result_rx, progress, halt.clone());
        let (produced, collected) = tokio::join!(produce, collect);
        pool.join().await?;

        let (sent, drained) = produced?;
        let collected = collected?;

        let complete = drained && !collected.gap && collected.acknowledged == sent;
        let summary = PipelineSummary {
            exit: if complete {
                PipelineExit::Drained
            } else {
                PipelineExit::Stopped
            },
            batches: collected.acknowledged as usize,
            docs_written: collected.docs_written,
            docs_failed: collected.docs_failed,
            last_cursor: collected.last_cursor,
        };

        info!(
            work_item = %item,
            exit = ?summary.exit,
            batches = summary.batches,
            docs_written = summary.docs_written,
            docs_failed = summary.docs_failed,
            position = summary.last_cursor.as_ref().map(|c| c.position),
            duration_ms = started.elapsed().as_millis(),
            "Shard pipeline finished"
        );
        Ok(summary)
    }
}

/// Feeds batches to the pool. Returns how many were sent and whether the
/// source was read to the end.
async fn produce(
    mut stream: connectors::source::DocumentStream,
    mut batcher: BulkBatcher,
    batch_tx: mpsc::Sender<(u64, model::records::batch::DocumentBatch)>,
    halt: CancellationToken,
) -> Result<(u64, bool), PipelineError> {
    let mut seq = 0u64;

    let result = loop {
        let next = tokio::select! {
            biased;
            _ = halt.cancelled() => break Ok(false),
            next = stream.next() => next,
        };

        let (batch, at_end) = match next {
            None => (batcher.finish(), true),
            Some(Ok(doc)) => match batcher.push(doc) {
                Ok(batch) => (batch, false),
                Err(err) => break Err(PipelineError::Batching(err)),
            },
            Some(Err(err)) => break Err(PipelineError::Source(err)),
        };

        if let Some(batch) = batch {
            tokio::select! {
                biased;
                _ = halt.cancelled() => break Ok(false),
                sent = batch_tx.send((seq, batch)) => {
                    if sent.is_err() {
                        break Ok(false);
                    }
                    seq += 1;
                }
            }
        }

        if at_end {
            break Ok(true);
        }
    };

    if result.is_err() {
        halt.cancel();
    }
    result.map(|drained| (seq, drained))
}

struct Collected {
    acknowledged: u64,
    gap: bool,
    docs_written: u64,
    docs_failed: u64,
    last_cursor: Option<ProgressCursor>,
}

/// Applies results in batch order. The first missing batch (cancelled or
/// failed) freezes the cursor; later results are drained but not applied.
async fn collect(
    mut result_rx: mpsc::Receiver<SequencedResult>,
    progress: &watch::Sender<Option<ProgressCursor>>,
    halt: CancellationToken,
) -> Result<Collected, PipelineError> {
    let mut out = Collected {
        acknowledged: 0,
        gap: false,
        docs_written: 0,
        docs_failed: 0,
        last_cursor: None,
    };
    let mut waiting = BTreeMap::new();
    let mut next_seq = 0u64;
    let mut fatal = None;

    while let Some((seq, batch_id, result)) = result_rx.recv().await {
        waiting.insert(seq, (batch_id, result));

        while let Some((batch_id, result)) = waiting.remove(&next_seq) {
            next_seq += 1;
            if out.gap {
                continue;
            }

            match result {
                Ok(report) => {
                    out.acknowledged += 1;
                    out.docs_written += report.docs_written as u64;
                    out.docs_failed += report.docs_failed as u64;
                    if report.status != BatchStatus::Written {
                        warn!(batch_id = %batch_id, status = %report.status, "Batch completed with failed documents");
                    }
                    if let Some(cursor) = report.cursor {
                        progress.send_replace(Some(cursor.clone()));
                        out.last_cursor = Some(cursor);
                    }
                }
                Err(BulkError::Cancelled) => out.gap = true,
                Err(source) => {
                    out.gap = true;
                    halt.cancel();
                    fatal.get_or_insert(PipelineError::Bulk {
                        batch_id: batch_id.to_string(),
                        source,
                    });
                }
            }
        }
    }

    match fatal {
        Some(err) => Err(err),
        None => Ok(out),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failed_writer::FailedDocumentWriter;
    use async_trait::async_trait;
    use connectors::{
        error::ConnectorError,
        source::synthetic::SyntheticSource,
        transport::{BulkHeaders, BulkTransport, TransportResponse},
    };
    use engine_core::retry::RetryPolicy;
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    /// Acknowledges every document, after an optional delay.
    struct AckAll {
        delay: Duration,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl BulkTransport for AckAll {
        async fn bulk_write(
            &self,
            _index: &str,
            body: Vec<u8>,
            _headers: &BulkHeaders,
        ) -> Result<TransportResponse, ConnectorError> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let text = String::from_utf8_lossy(&body);
            let items: Vec<_> = text
                .lines()
                .step_by(2)
                .map(|line| {
                    let v: serde_json::Value = serde_json::from_str(line).unwrap();
                    serde_json::json!({"index": {"_id": v["index"]["_id"], "status": 201}})
                })
                .collect();
            Ok(TransportResponse::new(
                200,
                serde_json::json!({"errors": false, "items": items}).to_string(),
            ))
        }

        fn supports_compression(&self) -> bool {
            false
        }
    }

    fn pipeline(transport: Arc<AckAll>, docs: u64, config: PipelineConfig) -> ShardPipeline {
        let source = Arc::new(SyntheticSource::new("snap", vec!["idx".into()], 1, docs));
        let serializer = BulkSerializer::uncached();
        let client = Arc::new(BulkIndexClient::new(
            transport,
            serializer.clone(),
            RetryPolicy::new(3, Duration::ZERO, Duration::ZERO),
            Arc::new(FailedDocumentWriter::in_memory()),
            Metrics::new(),
        ));
        ShardPipeline::new(source, client, serializer, config)
    }

    #[tokio::test]
    async fn drains_shard_and_publishes_final_cursor() {
        let transport = Arc::new(AckAll {
            delay: Duration::ZERO,
            requests: AtomicUsize::new(0),
        });
        let config = PipelineConfig::default()
            .with_batch_limits(5, usize::MAX)
            .with_concurrency(3);
        let pipeline = pipeline(transport.clone(), 12, config);
        let (tx, rx) = watch::channel(None);

        let summary = pipeline
            .run(
                &WorkItem::new("snap", "idx", 0),
                "idx",
                0,
                &CancellationToken::new(),
                &tx,
            )
            .await
            .unwrap();

        assert_eq!(summary.exit, PipelineExit::Drained);
        assert_eq!(summary.batches, 3);
        assert_eq!(summary.docs_written, 12);
        assert_eq!(rx.borrow().as_ref().unwrap().position, 12);
        assert_eq!(transport.requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let transport = Arc::new(AckAll {
            delay: Duration::ZERO,
            requests: AtomicUsize::new(0),
        });
        let pipeline = pipeline(
            transport,
            20,
            PipelineConfig::default().with_batch_limits(4, usize::MAX),
        );
        let (tx, _rx) = watch::channel(None);

        let summary = pipeline
            .run(&WorkItem::new("snap", "idx", 0), "idx", 14, &CancellationToken::new(), &tx)
            .await
            .unwrap();
        assert_eq!(summary.docs_written, 6);
        assert_eq!(summary.last_cursor.unwrap().position, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_leaves_contiguous_cursor() {
        let transport = Arc::new(AckAll {
            delay: Duration::from_millis(100),
            requests: AtomicUsize::new(0),
        });
        let pipeline = pipeline(
            transport,
            1_000,
            PipelineConfig::default()
                .with_batch_limits(10, usize::MAX)
                .with_concurrency(2),
        );
        let (tx, rx) = watch::channel(None);
        let stop = CancellationToken::new();

        let stopper = {
            let stop = stop.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(350)).await;
                stop.cancel();
            })
        };

        let summary = pipeline
            .run(&WorkItem::new("snap", "idx", 0), "idx", 0, &stop, &tx)
            .await
            .unwrap();
        stopper.await.unwrap();

        assert_eq!(summary.exit, PipelineExit::Stopped);
        let position = summary.last_cursor.as_ref().unwrap().position;
        assert!(position > 0 && position < 1_000);
        assert_eq!(position % 10, 0);
        assert_eq!(summary.docs_written, position);
        assert_eq!(rx.borrow().as_ref().unwrap().position, position);
    }
}
