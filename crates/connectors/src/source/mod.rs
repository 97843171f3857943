use crate::error::ConnectorError;
use async_trait::async_trait;
use futures::stream::BoxStream;
use model::{records::document::Document, work::item::WorkItem};

pub mod ndjson;
pub mod synthetic;

/// Ordered stream of live documents from one shard.
pub type DocumentStream = BoxStream<'static, Result<Document, ConnectorError>>;

/// Read side of a snapshot.
///
/// `read_documents` must resume at `start_offset` without yielding earlier
/// documents, and must skip malformed entries (logging them) rather than fail.
/// Skipped entries still consume a position.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list_indices(&self) -> Result<Vec<String>, ConnectorError>;

    async fn list_shards(&self, index: &str) -> Result<Vec<WorkItem>, ConnectorError>;

    async fn read_documents(
        &self,
        item: &WorkItem,
        start_offset: u64,
    ) -> Result<DocumentStream, ConnectorError>;
}
