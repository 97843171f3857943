use crate::error::FailedDocumentWriterError;
use model::execution::failed_document::FailedDocument;
use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};
use tracing::{debug, warn};

#[derive(Debug)]
enum Sink {
    /// One JSON object per line, appended.
    File(PathBuf),
    Memory(Vec<FailedDocument>),
    Discard,
}

/// Side channel for documents the target would not accept.
///
/// Writes are serialized so concurrent writer tasks never interleave lines.
#[derive(Debug)]
pub struct FailedDocumentWriter {
    sink: Mutex<Sink>,
}

impl FailedDocumentWriter {
    pub fn to_file(path: impl Into<PathBuf>) -> Self {
        Self {
            sink: Mutex::new(Sink::File(path.into())),
        }
    }

    pub fn in_memory() -> Self {
        Self {
            sink: Mutex::new(Sink::Memory(Vec::new())),
        }
    }

    pub fn discard() -> Self {
        Self {
            sink: Mutex::new(Sink::Discard),
        }
    }

    pub fn write_batch(&self, failed: &[FailedDocument]) -> Result<(), FailedDocumentWriterError> {
        if failed.is_empty() {
            return Ok(());
        }

        let mut sink = self.sink.lock().unwrap_or_else(|e| e.into_inner());
        match &mut *sink {
            Sink::File(path) => Self::append_lines(path, failed)?,
            Sink::Memory(docs) => docs.extend_from_slice(failed),
            Sink::Discard => {
                warn!(count = failed.len(), "Discarding failed documents; no side channel configured");
            }
        }
        Ok(())
    }

    /// Everything recorded so far, for in-memory writers. Empty otherwise.
    pub fn recorded(&self) -> Vec<FailedDocument> {
        match &*self.sink.lock().unwrap_or_else(|e| e.into_inner()) {
            Sink::Memory(docs) => docs.clone(),
            _ => Vec::new(),
        }
    }

    fn append_lines(path: &Path, failed: &[FailedDocument]) -> Result<(), FailedDocumentWriterError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        let mut buf = Vec::new();
        for doc in failed {
            serde_json::to_writer(&mut buf, doc)?;
            buf.push(b'\n');
        }
        file.write_all(&buf)?;

        debug!(count = failed.len(), path = %path.display(), "Wrote failed documents");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{
        core::identifiers::BatchId,
        records::{batch::DocumentBatch, document::Document},
        work::item::WorkItem,
    };

    fn failed(id: &str) -> FailedDocument {
        let doc = Document::upsert(3, id, br#"{"k":"v"}"#.to_vec());
        let mut batch = DocumentBatch::new(BatchId::from("bat-1"), WorkItem::new("s", "i", 0));
        batch.push(doc.clone(), 40);
        FailedDocument::new(&doc, "i", &batch, "mapper_parsing_exception", "bad field")
            .with_status(400)
            .with_attempts(2)
    }

    #[test]
    fn appends_json_lines_and_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("failed.jsonl");
        let writer = FailedDocumentWriter::to_file(&path);

        writer.write_batch(&[failed("a"), failed("b")]).unwrap();
        writer.write_batch(&[failed("c")]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 3);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["document_id"], "a");
        assert_eq!(first["work_item"], "s__i__0");
        assert_eq!(first["error"]["status"], 400);
    }

    #[test]
    fn memory_writer_keeps_documents() {
        let writer = FailedDocumentWriter::in_memory();
        writer.write_batch(&[failed("a")]).unwrap();
        writer.write_batch(&[]).unwrap();
        assert_eq!(writer.recorded().len(), 1);
    }
}
