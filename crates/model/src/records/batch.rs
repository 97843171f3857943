use crate::{
    core::identifiers::BatchId,
    pagination::cursor::ProgressCursor,
    records::document::Document,
    work::item::WorkItem,
};

/// Ordered, bounded group of documents submitted as one bulk request.
///
/// The serialized size is accumulated as documents are pushed so boundary
/// decisions never re-serialize the batch.
#[derive(Debug, Clone)]
pub struct DocumentBatch {
    pub id: BatchId,
    pub work_item: WorkItem,
    pub documents: Vec<Document>,
    size_bytes: usize,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl DocumentBatch {
    pub fn new(id: BatchId, work_item: WorkItem) -> Self {
        Self {
            id,
            work_item,
            documents: Vec::new(),
            size_bytes: 0,
            created_at: chrono::Utc::now(),
        }
    }

    pub fn push(&mut self, document: Document, serialized_len: usize) {
        self.size_bytes += serialized_len;
        self.documents.push(document);
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn start_position(&self) -> Option<u64> {
        self.documents.first().map(|d| d.position)
    }

    /// Exclusive end offset covered by this batch.
    pub fn end_position(&self) -> Option<u64> {
        self.documents.last().map(|d| d.position + 1)
    }

    /// Cursor reported once this batch is durably written.
    pub fn cursor(&self) -> Option<ProgressCursor> {
        let end = self.end_position()?;
        Some(ProgressCursor::new(
            self.work_item.clone(),
            end,
            self.len() as u64,
            self.size_bytes as u64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_size_and_positions_incrementally() {
        let item = WorkItem::new("s", "i", 0);
        let mut batch = DocumentBatch::new(BatchId::from("b1"), item.clone());
        assert!(batch.cursor().is_none());

        batch.push(Document::upsert(4, "a", b"{}".to_vec()), 30);
        batch.push(Document::upsert(6, "b", b"{}".to_vec()), 31);

        assert_eq!(batch.len(), 2);
        assert_eq!(batch.size_bytes(), 61);
        assert_eq!(batch.start_position(), Some(4));

        let cursor = batch.cursor().unwrap();
        assert_eq!(cursor.position, 7);
        assert_eq!(cursor.docs_in_batch, 2);
        assert_eq!(cursor.bytes_in_batch, 61);
        assert_eq!(cursor.work_item, item);
    }
}
