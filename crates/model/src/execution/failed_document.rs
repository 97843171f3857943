use crate::records::{batch::DocumentBatch, document::Document};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const SOURCE_PREVIEW_LIMIT: usize = 512;

/// A document the bulk client gave up on, kept for operator remediation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedDocument {
    pub id: String,
    pub document_id: String,
    pub index: String,
    pub work_item: String,
    pub batch_id: String,
    pub position: u64,
    pub error: FailureError,
    pub attempts: u32,
    pub source_preview: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureError {
    pub error_type: String,
    pub message: String,
    pub status: Option<u16>,
}

impl FailedDocument {
    pub fn new(
        document: &Document,
        index: &str,
        batch: &DocumentBatch,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            index: index.to_string(),
            work_item: batch.work_item.key(),
            batch_id: batch.id.to_string(),
            position: document.position,
            error: FailureError {
                error_type: error_type.into(),
                message: message.into(),
                status: None,
            },
            attempts: 0,
            source_preview: preview(&document.source),
            failed_at: Utc::now(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.error.status = Some(status);
        self
    }

    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }
}

fn preview(source: &[u8]) -> String {
    let text = String::from_utf8_lossy(source);
    if text.len() <= SOURCE_PREVIEW_LIMIT {
        return text.into_owned();
    }

    let mut cut = SOURCE_PREVIEW_LIMIT;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}...", &text[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{core::identifiers::BatchId, work::item::WorkItem};

    #[test]
    fn captures_batch_context_and_truncates_source() {
        let item = WorkItem::new("snap", "idx", 2);
        let batch = DocumentBatch::new(BatchId::from("bat-1"), item);
        let doc = Document::upsert(9, "doc-9", vec![b'x'; 2048]);

        let failed = FailedDocument::new(&doc, "idx", &batch, "mapper_parsing_exception", "bad")
            .with_status(400)
            .with_attempts(1);

        assert_eq!(failed.work_item, "snap__idx__2");
        assert_eq!(failed.batch_id, "bat-1");
        assert_eq!(failed.position, 9);
        assert_eq!(failed.error.status, Some(400));
        assert_eq!(failed.source_preview.len(), SOURCE_PREVIEW_LIMIT + 3);
    }
}
