use crate::{
    bulk::{response::parse_bulk_response, serialize::BulkSerializer},
    config::CompressionMode,
    error::BulkError,
    failed_writer::FailedDocumentWriter,
    rate_limit::RateLimiter,
    retry::{classify_bulk_status, classify_connector_error},
};
use connectors::transport::{BulkHeaders, BulkTransport};
use engine_core::{
    metrics::Metrics,
    retry::{RetryDisposition, RetryPolicy},
};
use model::{
    execution::{
        failed_document::FailedDocument,
        outcome::{BatchReport, BatchStatus, BulkWriteOutcome, ItemOutcome},
    },
    records::{batch::DocumentBatch, document::Document},
};
use std::{collections::HashMap, sync::Arc, time::Instant};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Why the last attempt did not clear the batch.
enum AttemptFailure {
    /// The request never got a usable response, or got a 429/5xx.
    Request { error_type: String, message: String, status: Option<u16> },
    /// The request went through but some items were refused.
    Items(HashMap<String, ItemOutcome>),
}

/// Sends document batches as bulk requests and reconciles partial failures.
pub struct BulkIndexClient {
    transport: Arc<dyn BulkTransport>,
    serializer: BulkSerializer,
    retry: RetryPolicy,
    compression: CompressionMode,
    rate_limiter: Option<Arc<RateLimiter>>,
    failed: Arc<FailedDocumentWriter>,
    metrics: Metrics,
}

impl BulkIndexClient {
    pub fn new(
        transport: Arc<dyn BulkTransport>,
        serializer: BulkSerializer,
        retry: RetryPolicy,
        failed: Arc<FailedDocumentWriter>,
        metrics: Metrics,
    ) -> Self {
        Self {
            transport,
            serializer,
            retry,
            compression: CompressionMode::Auto,
            rate_limiter: None,
            failed,
            metrics,
        }
    }

    pub fn with_compression(mut self, compression: CompressionMode) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: Option<Arc<RateLimiter>>) -> Self {
        self.rate_limiter = limiter;
        self
    }

    fn compress(&self) -> bool {
        self.compression == CompressionMode::Auto && self.transport.supports_compression()
    }

    /// Writes `batch` to `index`, retrying only the documents that have not
    /// been acknowledged yet.
    ///
    /// Documents still failing when attempts run out, or refused by a 4xx on
    /// the whole request, go to the failed-document side channel and the batch
    /// reports `PartiallyFailed` or `Rejected`. Once `cancel` fires no further
    /// attempt is started and the call returns `BulkError::Cancelled`.
    pub async fn write_batch(
        &self,
        index: &str,
        batch: &DocumentBatch,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, BulkError> {
        let started = Instant::now();
        let mut pending: Vec<&Document> = batch.documents.iter().collect();
        let mut attempts: u32 = 0;
        let mut bytes_sent: u64 = 0;

        info!(
            batch_id = %batch.id,
            work_item = %batch.work_item,
            docs = batch.len(),
            bytes = batch.size_bytes(),
            "Writing batch"
        );

        let failure = loop {
            if cancel.is_cancelled() {
                return Err(BulkError::Cancelled);
            }
            if let Some(limiter) = &self.rate_limiter {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(BulkError::Cancelled),
                    _ = limiter.acquire() => {}
                }
            }

            attempts += 1;
            let body = self.serializer.body(index, pending.iter().copied())?;
            let mut headers = BulkHeaders::new();
            let body = if self.compress() {
                headers.push(("Content-Encoding".to_string(), "gzip".to_string()));
                BulkSerializer::gzip(&body)?
            } else {
                body
            };
            // Stop may have fired while the body was being built.
            if cancel.is_cancelled() {
                return Err(BulkError::Cancelled);
            }
            bytes_sent += body.len() as u64;
            self.metrics.increment_requests(1);
            self.metrics.increment_bytes(body.len() as u64);

            let failure = match self.transport.bulk_write(index, body, &headers).await {
                Err(err) => match classify_connector_error(&err) {
                    RetryDisposition::Stop => return Err(BulkError::Transport(err)),
                    RetryDisposition::Retry => AttemptFailure::Request {
                        error_type: "transport_error".to_string(),
                        message: err.to_string(),
                        status: None,
                    },
                },
                Ok(response) if !response.is_success() => {
                    if classify_bulk_status(response.status) == RetryDisposition::Stop {
                        return self.reject(
                            index,
                            batch,
                            &pending,
                            response.status,
                            &response.body,
                            attempts,
                            bytes_sent,
                            started,
                        );
                    }
                    AttemptFailure::Request {
                        error_type: "http_status".to_string(),
                        message: response.body,
                        status: Some(response.status),
                    }
                }
                Ok(response) => match parse_bulk_response(response.status, &response.body) {
                    Ok(outcome) => {
                        let failed = retain_unacknowledged(&mut pending, &outcome);
                        if pending.is_empty() {
                            break None;
                        }
                        AttemptFailure::Items(failed)
                    }
                    Err(err) => AttemptFailure::Request {
                        error_type: "invalid_response".to_string(),
                        message: err.to_string(),
                        status: Some(response.status),
                    },
                },
            };

            if attempts as usize >= self.retry.max_attempts {
                break Some(failure);
            }

            let delay = self.retry.delay_for(attempts as usize - 1);
            warn!(
                batch_id = %batch.id,
                attempt = attempts,
                remaining = pending.len(),
                delay_ms = delay.as_millis(),
                "Bulk attempt incomplete, retrying remainder"
            );
            self.metrics.increment_retries(1);
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(BulkError::Cancelled),
                _ = sleep(delay) => {}
            }
        };

        let docs_failed = pending.len();
        let status = match failure {
            None => BatchStatus::Written,
            Some(failure) => {
                let records = failed_documents(index, batch, &pending, &failure, attempts);
                self.failed.write_batch(&records)?;
                warn!(
                    batch_id = %batch.id,
                    failed = docs_failed,
                    attempts,
                    "Retries exhausted; failed documents sent to side channel"
                );
                BatchStatus::PartiallyFailed
            }
        };

        Ok(self.report(batch, status, docs_failed, attempts, bytes_sent, started))
    }

    #[allow(clippy::too_many_arguments)]
    fn reject(
        &self,
        index: &str,
        batch: &DocumentBatch,
        pending: &[&Document],
        status: u16,
        body: &str,
        attempts: u32,
        bytes_sent: u64,
        started: Instant,
    ) -> Result<BatchReport, BulkError> {
        let failure = AttemptFailure::Request {
            error_type: "request_rejected".to_string(),
            message: body.to_string(),
            status: Some(status),
        };
        let records = failed_documents(index, batch, pending, &failure, attempts);
        self.failed.write_batch(&records)?;
        warn!(batch_id = %batch.id, status, docs = pending.len(), "Bulk request rejected by target");

        Ok(self.report(batch, BatchStatus::Rejected, pending.len(), attempts, bytes_sent, started))
    }

    fn report(
        &self,
        batch: &DocumentBatch,
        status: BatchStatus,
        docs_failed: usize,
        attempts: u32,
        bytes_sent: u64,
        started: Instant,
    ) -> BatchReport {
        let docs_written = batch.len() - docs_failed;
        self.metrics.increment_docs_written(docs_written as u64);
        self.metrics.increment_docs_failed(docs_failed as u64);
        self.metrics.increment_batches(1);

        let duration = started.elapsed();
        debug!(
            batch_id = %batch.id,
            %status,
            docs_written,
            docs_failed,
            attempts,
            duration_ms = duration.as_millis(),
            "Batch finished"
        );

        BatchReport {
            batch_id: batch.id.clone(),
            status,
            docs_written,
            docs_failed,
            attempts,
            bytes_sent,
            duration,
            cursor: batch.cursor(),
        }
    }
}

/// Drops acknowledged documents from `pending` and returns the refusals for
/// the rest, keyed by id.
///
/// Response items line up with request lines, so they are matched by position
/// when the counts agree and by id otherwise.
fn retain_unacknowledged(
    pending: &mut Vec<&Document>,
    outcome: &BulkWriteOutcome,
) -> HashMap<String, ItemOutcome> {
    let mut failures = HashMap::new();

    if outcome.items.len() == pending.len() {
        let mut items = outcome.items.iter();
        pending.retain(|_| match items.next() {
            Some(item) if item.succeeded() => false,
            Some(item) => {
                failures.insert(item.id.clone(), item.clone());
                true
            }
            None => true,
        });
        return failures;
    }

    let succeeded: std::collections::HashSet<&str> = outcome.succeeded_ids().collect();
    for item in outcome.failed() {
        failures.insert(item.id.clone(), item.clone());
    }
    pending.retain(|doc| !succeeded.contains(doc.id.as_str()));
    failures
}

fn failed_documents(
    index: &str,
    batch: &DocumentBatch,
    pending: &[&Document],
    failure: &AttemptFailure,
    attempts: u32,
) -> Vec<FailedDocument> {
    pending
        .iter()
        .map(|doc| {
            let record = match failure {
                AttemptFailure::Request { error_type, message, status } => {
                    let record = FailedDocument::new(doc, index, batch, error_type, message);
                    match status {
                        Some(status) => record.with_status(*status),
                        None => record,
                    }
                }
                AttemptFailure::Items(items) => match items.get(&doc.id) {
                    Some(item) => {
                        let (error_type, reason) = item
                            .error
                            .as_ref()
                            .map(|e| (e.error_type.clone(), e.reason.clone()))
                            .unwrap_or_else(|| ("unknown".to_string(), String::new()));
                        FailedDocument::new(doc, index, batch, error_type, reason)
                            .with_status(item.status)
                    }
                    None => FailedDocument::new(
                        doc,
                        index,
                        batch,
                        "missing_item",
                        "no result for document in bulk response",
                    ),
                },
            };
            record.with_attempts(attempts)
        })
        .collect()
}
