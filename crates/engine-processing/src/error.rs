use connectors::error::ConnectorError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BulkError {
    #[error("Bulk transport failed: {0}")]
    Transport(#[from] ConnectorError),

    #[error("Failed to serialize document '{id}': {source}")]
    Serialization {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to compress bulk body: {0}")]
    Compression(#[source] std::io::Error),

    #[error("Failed to record failed documents: {0}")]
    FailedDocuments(#[from] FailedDocumentWriterError),

    /// The pipeline stopped before this batch was fully acknowledged.
    #[error("Bulk write cancelled")]
    Cancelled,
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Failed to read source documents: {0}")]
    Source(#[from] ConnectorError),

    #[error("Bulk write failed for batch '{batch_id}': {source}")]
    Bulk {
        batch_id: String,
        #[source]
        source: BulkError,
    },

    #[error("Failed to prepare batch: {0}")]
    Batching(#[source] BulkError),

    #[error("Writer task failed: {0}")]
    WriterTask(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum FailedDocumentWriterError {
    #[error("Failed to write to file: {0}")]
    FileWrite(#[from] std::io::Error),

    #[error("Failed to serialize failed document: {0}")]
    Serialization(#[from] serde_json::Error),
}
