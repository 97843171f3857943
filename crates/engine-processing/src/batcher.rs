use crate::{bulk::serialize::BulkSerializer, error::BulkError};
use model::{
    core::identifiers::BatchId,
    records::{batch::DocumentBatch, document::Document},
    work::item::WorkItem,
};

/// Groups a document stream into batches bounded by count and bytes.
///
/// A document is always added first; the batch closes once it has reached
/// either limit. Boundaries depend only on the input and the limits, and a
/// document larger than `max_bytes` ends up alone in its own batch.
pub struct BulkBatcher {
    work_item: WorkItem,
    index: String,
    max_docs: usize,
    max_bytes: usize,
    serializer: BulkSerializer,
    current: Option<DocumentBatch>,
}

impl BulkBatcher {
    pub fn new(
        work_item: WorkItem,
        index: impl Into<String>,
        max_docs: usize,
        max_bytes: usize,
        serializer: BulkSerializer,
    ) -> Self {
        Self {
            work_item,
            index: index.into(),
            max_docs: max_docs.max(1),
            max_bytes: max_bytes.max(1),
            serializer,
            current: None,
        }
    }

    /// Adds `doc` and returns the batch it closed, if any.
    pub fn push(&mut self, doc: Document) -> Result<Option<DocumentBatch>, BulkError> {
        let size = self.serializer.section(&self.index, &doc)?.len();

        let batch = self.current.get_or_insert_with(|| {
            DocumentBatch::new(batch_id(&self.work_item, doc.position), self.work_item.clone())
        });
        batch.push(doc, size);

        if batch.len() >= self.max_docs || batch.size_bytes() >= self.max_bytes {
            return Ok(self.current.take());
        }
        Ok(None)
    }

    /// The open batch, if it has any documents.
    pub fn finish(&mut self) -> Option<DocumentBatch> {
        self.current.take().filter(|b| !b.is_empty())
    }
}

/// Deterministic id from the work item and the batch's first position.
fn batch_id(item: &WorkItem, start: u64) -> BatchId {
    let mut h = blake3::Hasher::new();
    h.update(item.key().as_bytes());
    h.update(&start.to_le_bytes());
    let hex = h.finalize().to_hex();
    BatchId::new(format!("bat-{}", &hex[..16]))
}
