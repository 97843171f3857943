use crate::{
    error::ConnectorError,
    source::{DocumentSource, DocumentStream},
};
use async_trait::async_trait;
use futures::StreamExt;
use model::{records::document::Document, work::item::WorkItem};
use tracing::warn;

/// Deterministic generated documents, for load tests and local runs.
///
/// Documents are `{"title": "doc-<n>", "body": "<filler>"}` with ids
/// `<index>-<shard>-<n>`. With `malformed_every = Some(k)`, every k-th position
/// (1-based) is treated as a corrupt entry and skipped.
#[derive(Debug, Clone)]
pub struct SyntheticSource {
    snapshot: String,
    indices: Vec<String>,
    shards_per_index: u32,
    docs_per_shard: u64,
    body_bytes: usize,
    malformed_every: Option<u64>,
}

impl SyntheticSource {
    pub fn new(
        snapshot: impl Into<String>,
        indices: Vec<String>,
        shards_per_index: u32,
        docs_per_shard: u64,
    ) -> Self {
        Self {
            snapshot: snapshot.into(),
            indices,
            shards_per_index,
            docs_per_shard,
            body_bytes: 32,
            malformed_every: None,
        }
    }

    pub fn with_body_bytes(mut self, body_bytes: usize) -> Self {
        self.body_bytes = body_bytes;
        self
    }

    pub fn with_malformed_every(mut self, every: u64) -> Self {
        self.malformed_every = (every > 0).then_some(every);
        self
    }

    pub fn docs_per_shard(&self) -> u64 {
        self.docs_per_shard
    }

    fn make_document(item: &WorkItem, position: u64, body_bytes: usize) -> Document {
        let body = "x".repeat(body_bytes);
        let source = format!(r#"{{"title":"doc-{position}","body":"{body}"}}"#);
        Document::upsert(
            position,
            format!("{}-{}-{}", item.index, item.shard, position),
            source.into_bytes(),
        )
    }
}

#[async_trait]
impl DocumentSource for SyntheticSource {
    async fn list_indices(&self) -> Result<Vec<String>, ConnectorError> {
        Ok(self.indices.clone())
    }

    async fn list_shards(&self, index: &str) -> Result<Vec<WorkItem>, ConnectorError> {
        if !self.indices.iter().any(|i| i == index) {
            return Err(ConnectorError::UnknownIndex(index.to_string()));
        }

        Ok((0..self.shards_per_index)
            .map(|shard| WorkItem::new(&self.snapshot, index, shard))
            .collect())
    }

    async fn read_documents(
        &self,
        item: &WorkItem,
        start_offset: u64,
    ) -> Result<DocumentStream, ConnectorError> {
        if !self.indices.contains(&item.index) || item.shard >= self.shards_per_index {
            return Err(ConnectorError::UnknownIndex(item.key()));
        }

        let item = item.clone();
        let body_bytes = self.body_bytes;
        let malformed_every = self.malformed_every;

        let docs = (start_offset..self.docs_per_shard).filter_map(move |position| {
            if let Some(every) = malformed_every
                && (position + 1) % every == 0
            {
                warn!(work_item = %item, position, "Skipping malformed source entry");
                return None;
            }
            Some(Ok::<_, ConnectorError>(Self::make_document(
                &item, position, body_bytes,
            )))
        });

        Ok(futures::stream::iter(docs).boxed())
    }
}
