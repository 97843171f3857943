use connectors::error::ConnectorError;
use engine_core::{error::LeaseStoreError, lease::RejectReason};
use engine_processing::error::PipelineError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The store stayed unreachable through every retry, or refused the request.
    #[error("Lease store error: {0}")]
    Store(#[from] LeaseStoreError),

    /// Our lease was rejected on renewal. Stop writing immediately.
    #[error("Lease on {work_item} lost: {reason}")]
    LeaseLost {
        work_item: String,
        reason: RejectReason,
    },

    #[error("Lease store returned a record without a holder for {0}")]
    MissingLease(String),
}

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    #[error("Pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),
}

#[derive(Debug, Error)]
pub enum SetupError {
    #[error("Failed to enumerate shards: {0}")]
    Source(#[from] ConnectorError),

    #[error("Failed to create work items: {0}")]
    Store(#[from] LeaseStoreError),
}
