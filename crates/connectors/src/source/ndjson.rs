use crate::{
    error::ConnectorError,
    source::{DocumentSource, DocumentStream},
};
use async_trait::async_trait;
use futures::StreamExt;
use model::{
    records::document::{Document, OpKind},
    work::item::WorkItem,
};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::path::{Path, PathBuf};
use tokio::{
    fs::File,
    io::{AsyncBufReadExt, BufReader},
};
use tracing::{debug, warn};

/// Snapshot exported as newline-delimited JSON, laid out as
/// `<root>/<snapshot>/<index>/<shard>.ndjson`.
///
/// Each line holds one entry:
/// `{"_id": "...", "_type": "...", "_routing": "...", "_op": "delete", "_source": {...}}`.
/// Only `_id` is required; `_source` is kept byte-for-byte.
pub struct NdjsonSource {
    root: PathBuf,
    snapshot: String,
}

#[derive(Deserialize)]
struct Entry<'a> {
    #[serde(rename = "_id")]
    id: String,
    #[serde(rename = "_type", default)]
    doc_type: Option<String>,
    #[serde(rename = "_routing", default)]
    routing: Option<String>,
    #[serde(rename = "_op", default)]
    op: OpKind,
    #[serde(rename = "_source", borrow, default)]
    source: Option<&'a RawValue>,
}

struct ReadState {
    reader: BufReader<File>,
    buf: Vec<u8>,
    item: WorkItem,
    position: u64,
}

/// Reads the next raw line into `buf`, without its terminator. Returns false at end of file.
async fn read_line(reader: &mut BufReader<File>, buf: &mut Vec<u8>) -> std::io::Result<bool> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }
    if buf.last() == Some(&b'\n') {
        buf.pop();
    }
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(true)
}

impl NdjsonSource {
    pub fn new(root: impl Into<PathBuf>, snapshot: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            snapshot: snapshot.into(),
        }
    }

    fn snapshot_dir(&self) -> PathBuf {
        self.root.join(&self.snapshot)
    }

    fn shard_path(&self, item: &WorkItem) -> PathBuf {
        self.snapshot_dir()
            .join(&item.index)
            .join(format!("{}.ndjson", item.shard))
    }
}

#[async_trait]
impl DocumentSource for NdjsonSource {
    async fn list_indices(&self) -> Result<Vec<String>, ConnectorError> {
        let mut entries = tokio::fs::read_dir(self.snapshot_dir()).await?;
        let mut indices = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && let Some(name) = entry.file_name().to_str()
            {
                indices.push(name.to_string());
            }
        }

        indices.sort();
        Ok(indices)
    }

    async fn list_shards(&self, index: &str) -> Result<Vec<WorkItem>, ConnectorError> {
        let dir = self.snapshot_dir().join(index);
        if !dir.is_dir() {
            return Err(ConnectorError::UnknownIndex(index.to_string()));
        }

        let mut entries = tokio::fs::read_dir(&dir).await?;
        let mut shards = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ndjson") {
                continue;
            }
            shards.push(shard_number(&path)?);
        }

        shards.sort_unstable();
        Ok(shards
            .into_iter()
            .map(|shard| WorkItem::new(&self.snapshot, index, shard))
            .collect())
    }

    async fn read_documents(
        &self,
        item: &WorkItem,
        start_offset: u64,
    ) -> Result<DocumentStream, ConnectorError> {
        let file = File::open(self.shard_path(item)).await?;
        let mut reader = BufReader::new(file);
        let mut buf = Vec::new();

        // Skip already-acknowledged entries without decoding them.
        let mut position = 0;
        while position < start_offset {
            if !read_line(&mut reader, &mut buf).await? {
                break;
            }
            position += 1;
        }

        debug!(work_item = %item, start_offset, "Opened shard for reading");

        let state = ReadState {
            reader,
            buf,
            item: item.clone(),
            position,
        };

        Ok(futures::stream::try_unfold(state, next_document).boxed())
    }
}

async fn next_document(
    mut state: ReadState,
) -> Result<Option<(Document, ReadState)>, ConnectorError> {
    while read_line(&mut state.reader, &mut state.buf).await? {
        let position = state.position;
        state.position += 1;

        if state.buf.trim_ascii().is_empty() {
            debug!(work_item = %state.item, position, "Skipping blank entry");
            continue;
        }

        match parse_entry(position, &state.buf) {
            Ok(doc) => return Ok(Some((doc, state))),
            Err(e) => {
                warn!(
                    work_item = %state.item,
                    position,
                    error = %e,
                    "Skipping malformed source entry"
                );
            }
        }
    }

    Ok(None)
}

fn parse_entry(position: u64, line: &[u8]) -> Result<Document, serde_json::Error> {
    let entry: Entry<'_> = serde_json::from_slice(line)?;
    let source = match (entry.op, entry.source) {
        (OpKind::Delete, _) => Vec::new(),
        (OpKind::Upsert, Some(raw)) => raw.get().as_bytes().to_vec(),
        (OpKind::Upsert, None) => b"{}".to_vec(),
    };

    Ok(Document {
        position,
        id: entry.id,
        doc_type: entry.doc_type,
        routing: entry.routing,
        source,
        op: entry.op,
    })
}

fn shard_number(path: &Path) -> Result<u32, ConnectorError> {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| ConnectorError::InvalidShard(path.display().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    fn write_shard(root: &Path, index: &str, shard: u32, lines: &[&str]) {
        let dir = root.join("snap").join(index);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(format!("{shard}.ndjson")), lines.join("\n")).unwrap();
    }

    #[tokio::test]
    async fn lists_indices_and_shards_in_order() {
        let dir = tempdir().unwrap();
        write_shard(dir.path(), "logs", 1, &[]);
        write_shard(dir.path(), "logs", 0, &[]);
        write_shard(dir.path(), "users", 0, &[]);

        let source = NdjsonSource::new(dir.path(), "snap");
        assert_eq!(source.list_indices().await.unwrap(), vec!["logs", "users"]);

        let shards = source.list_shards("logs").await.unwrap();
        assert_eq!(
            shards,
            vec![WorkItem::new("snap", "logs", 0), WorkItem::new("snap", "logs", 1)]
        );
        assert!(matches!(
            source.list_shards("missing").await,
            Err(ConnectorError::UnknownIndex(_))
        ));
    }

    #[tokio::test]
    async fn skips_malformed_entries_but_keeps_positions() {
        let dir = tempdir().unwrap();
        write_shard(
            dir.path(),
            "logs",
            0,
            &[
                r#"{"_id":"a","_source":{"n":1}}"#,
                r#"not json"#,
                r#"{"_source":{"n":3}}"#,
                r#"{"_id":"d","_routing":"r1","_type":"_doc","_source":{"n": 4}}"#,
                r#"{"_id":"e","_op":"delete"}"#,
            ],
        );

        let source = NdjsonSource::new(dir.path(), "snap");
        let item = WorkItem::new("snap", "logs", 0);
        let docs: Vec<Document> = source
            .read_documents(&item, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        let ids: Vec<_> = docs.iter().map(|d| (d.id.as_str(), d.position)).collect();
        assert_eq!(ids, vec![("a", 0), ("d", 3), ("e", 4)]);
        assert_eq!(docs[0].source, br#"{"n":1}"#.to_vec());
        assert_eq!(docs[1].source, br#"{"n": 4}"#.to_vec());
        assert_eq!(docs[1].routing.as_deref(), Some("r1"));
        assert_eq!(docs[2].op, OpKind::Delete);
    }

    #[tokio::test]
    async fn invalid_utf8_entry_is_skipped_not_fatal() {
        let dir = tempdir().unwrap();
        let shard = dir.path().join("snap").join("logs");
        std::fs::create_dir_all(&shard).unwrap();
        let mut bytes = br#"{"_id":"a","_source":{}}"#.to_vec();
        bytes.extend_from_slice(b"\r\n{\"_id\":\"b\",\"_source\":{\"v\":\"\xff\xfe\"}}\n");
        bytes.extend_from_slice(br#"{"_id":"c","_source":{}}"#);
        std::fs::write(shard.join("0.ndjson"), bytes).unwrap();

        let source = NdjsonSource::new(dir.path(), "snap");
        let item = WorkItem::new("snap", "logs", 0);
        let docs: Vec<Document> = source
            .read_documents(&item, 0)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        let ids: Vec<_> = docs.iter().map(|d| (d.id.as_str(), d.position)).collect();
        assert_eq!(ids, vec![("a", 0), ("c", 2)]);

        // The skip path must not choke on the same bytes.
        let docs: Vec<Document> = source
            .read_documents(&item, 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c");
    }

    #[tokio::test]
    async fn resumes_from_offset() {
        let dir = tempdir().unwrap();
        write_shard(
            dir.path(),
            "logs",
            0,
            &[
                r#"{"_id":"a","_source":{}}"#,
                r#"{"_id":"b","_source":{}}"#,
                r#"{"_id":"c","_source":{}}"#,
            ],
        );

        let source = NdjsonSource::new(dir.path(), "snap");
        let item = WorkItem::new("snap", "logs", 0);
        let docs: Vec<Document> = source
            .read_documents(&item, 2)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();

        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].id, "c");
        assert_eq!(docs[0].position, 2);
    }
}
