use crate::{bulk::client::BulkIndexClient, config::InFlightPolicy, error::BulkError};
use model::{
    core::identifiers::BatchId, execution::outcome::BatchReport, records::batch::DocumentBatch,
};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// A batch tagged with its formation order.
pub type SequencedBatch = (u64, DocumentBatch);

/// Result for one sequenced batch. Results arrive in completion order.
pub type SequencedResult = (u64, BatchId, Result<BatchReport, BulkError>);

/// Fixed set of writer tasks pulling batches from one bounded queue.
///
/// The queue bound is the backpressure: a full queue suspends the sender.
pub struct WriterPool {
    handles: Vec<JoinHandle<()>>,
}

impl WriterPool {
    pub fn spawn(
        client: Arc<BulkIndexClient>,
        index: String,
        workers: usize,
        queue_depth: usize,
        policy: InFlightPolicy,
        stop: CancellationToken,
    ) -> (Self, mpsc::Sender<SequencedBatch>, mpsc::Receiver<SequencedResult>) {
        let (batch_tx, batch_rx) = mpsc::channel::<SequencedBatch>(queue_depth.max(1));
        let (result_tx, result_rx) = mpsc::channel::<SequencedResult>(queue_depth.max(1) + workers);
        let batch_rx = Arc::new(Mutex::new(batch_rx));

        let handles = (0..workers.max(1))
            .map(|worker| {
                let client = client.clone();
                let index = index.clone();
                let batch_rx = batch_rx.clone();
                let result_tx = result_tx.clone();
                let stop = stop.clone();

                tokio::spawn(async move {
                    loop {
                        let next = batch_rx.lock().await.recv().await;
                        let Some((seq, batch)) = next else { break };

                        // Queued but not started: never begin a write after stop.
                        if stop.is_cancelled() {
                            let _ = result_tx.send((seq, batch.id, Err(BulkError::Cancelled))).await;
                            continue;
                        }

                        let result = match policy {
                            InFlightPolicy::Finish => client.write_batch(&index, &batch, &stop).await,
                            InFlightPolicy::Abort => tokio::select! {
                                res = client.write_batch(&index, &batch, &stop) => res,
                                _ = stop.cancelled() => Err(BulkError::Cancelled),
                            },
                        };

                        if result_tx.send((seq, batch.id, result)).await.is_err() {
                            break;
                        }
                    }
                    debug!(worker, "Writer task finished");
                })
            })
            .collect();

        (Self { handles }, batch_tx, result_rx)
    }

    pub async fn join(self) -> Result<(), tokio::task::JoinError> {
        for handle in self.handles {
            handle.await?;
        }
        Ok(())
    }
}
