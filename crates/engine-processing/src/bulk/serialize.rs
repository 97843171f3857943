//! Bulk wire format.
//!
//! Each document becomes one section: an action line naming the target index
//! and id, then (for upserts) the source on a single line. Sections are
//! newline-terminated and concatenated into the request body.

use crate::error::BulkError;
use flate2::{Compression, write::GzEncoder};
use model::records::document::{Document, OpKind};
use moka::sync::Cache;
use serde::Serialize;
use std::{io::Write, sync::Arc};

#[derive(Serialize)]
struct ActionMeta<'a> {
    #[serde(rename = "_index")]
    index: &'a str,
    #[serde(rename = "_id")]
    id: &'a str,
    #[serde(rename = "_type", skip_serializing_if = "Option::is_none")]
    doc_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing: Option<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "lowercase")]
enum Action<'a> {
    Index(ActionMeta<'a>),
    Delete(ActionMeta<'a>),
}

type SectionKey = [u8; 32];

/// Bounded cache of serialized sections, weighed by byte length.
///
/// The batcher sizes each document by serializing it, and the client needs
/// the same bytes again when it builds the request body (and again on every
/// retry), so one serialization serves all of them.
#[derive(Clone)]
pub struct SerializationCache {
    inner: Cache<SectionKey, Arc<[u8]>>,
}

impl SerializationCache {
    pub fn new(max_bytes: u64) -> Self {
        let inner = Cache::builder()
            .max_capacity(max_bytes)
            .weigher(|_key: &SectionKey, value: &Arc<[u8]>| {
                u32::try_from(value.len()).unwrap_or(u32::MAX)
            })
            .build();
        Self { inner }
    }

    fn get(&self, key: &SectionKey) -> Option<Arc<[u8]>> {
        self.inner.get(key)
    }

    fn insert(&self, key: SectionKey, section: Arc<[u8]>) {
        self.inner.insert(key, section);
    }

    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

/// Turns documents into bulk sections, optionally through a shared cache.
#[derive(Clone, Default)]
pub struct BulkSerializer {
    cache: Option<SerializationCache>,
}

impl BulkSerializer {
    pub fn new(cache: Option<SerializationCache>) -> Self {
        Self { cache }
    }

    pub fn uncached() -> Self {
        Self { cache: None }
    }

    /// The serialized section for `doc` written to `index`.
    pub fn section(&self, index: &str, doc: &Document) -> Result<Arc<[u8]>, BulkError> {
        let Some(cache) = &self.cache else {
            return Self::encode(index, doc).map(Arc::from);
        };

        let key = Self::cache_key(index, doc);
        if let Some(section) = cache.get(&key) {
            return Ok(section);
        }
        let section: Arc<[u8]> = Arc::from(Self::encode(index, doc)?);
        cache.insert(key, section.clone());
        Ok(section)
    }

    /// Concatenated sections for `docs`, in order.
    pub fn body<'a>(
        &self,
        index: &str,
        docs: impl IntoIterator<Item = &'a Document>,
    ) -> Result<Vec<u8>, BulkError> {
        let mut body = Vec::new();
        for doc in docs {
            body.extend_from_slice(&self.section(index, doc)?);
        }
        Ok(body)
    }

    pub fn gzip(body: &[u8]) -> Result<Vec<u8>, BulkError> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(body.len() / 4), Compression::fast());
        encoder.write_all(body).map_err(BulkError::Compression)?;
        encoder.finish().map_err(BulkError::Compression)
    }

    fn cache_key(index: &str, doc: &Document) -> SectionKey {
        let mut h = blake3::Hasher::new();
        h.update(index.as_bytes());
        h.update(&[0]);
        h.update(doc.id.as_bytes());
        h.update(&[0]);
        h.update(doc.doc_type.as_deref().unwrap_or_default().as_bytes());
        h.update(&[0]);
        h.update(doc.routing.as_deref().unwrap_or_default().as_bytes());
        h.update(&[doc.op as u8]);
        h.update(&doc.source);
        *h.finalize().as_bytes()
    }

    fn encode(index: &str, doc: &Document) -> Result<Vec<u8>, BulkError> {
        let meta = ActionMeta {
            index,
            id: &doc.id,
            doc_type: doc.doc_type.as_deref(),
            routing: doc.routing.as_deref(),
        };
        let action = match doc.op {
            OpKind::Upsert => Action::Index(meta),
            OpKind::Delete => Action::Delete(meta),
        };

        let serialization = |source| BulkError::Serialization {
            id: doc.id.clone(),
            source,
        };

        let mut out = serde_json::to_vec(&action).map_err(serialization)?;
        out.push(b'\n');

        if doc.op == OpKind::Upsert {
            // A source line must not contain raw newlines; re-encode compactly if it does.
            if doc.source.contains(&b'\n') {
                let value: serde_json::Value =
                    serde_json::from_slice(&doc.source).map_err(serialization)?;
                serde_json::to_writer(&mut out, &value).map_err(serialization)?;
            } else {
                out.extend_from_slice(&doc.source);
            }
            out.push(b'\n');
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    #[test]
    fn upsert_has_action_and_source_lines() {
        let doc = Document::upsert(0, "a1", br#"{"title":"x"}"#.to_vec()).with_routing("r1");
        let section = BulkSerializer::uncached().section("logs", &doc).unwrap();
        assert_eq!(
            std::str::from_utf8(&section).unwrap(),
            "{\"index\":{\"_index\":\"logs\",\"_id\":\"a1\",\"routing\":\"r1\"}}\n{\"title\":\"x\"}\n"
        );
    }

    #[test]
    fn delete_has_no_source_line_and_typed_docs_carry_type() {
        let doc = Document::delete(3, "gone").with_type("doc");
        let section = BulkSerializer::uncached().section("logs", &doc).unwrap();
        assert_eq!(
            std::str::from_utf8(&section).unwrap(),
            "{\"delete\":{\"_index\":\"logs\",\"_id\":\"gone\",\"_type\":\"doc\"}}\n"
        );
    }

    #[test]
    fn multi_line_sources_are_compacted() {
        let doc = Document::upsert(0, "p", b"{\n  \"a\": 1\n}".to_vec());
        let section = BulkSerializer::uncached().section("i", &doc).unwrap();
        let text = std::str::from_utf8(&section).unwrap();
        assert_eq!(text.lines().nth(1), Some("{\"a\":1}"));
        assert_eq!(text.matches('\n').count(), 2);
    }

    #[test]
    fn cache_serves_repeat_serializations() {
        let cache = SerializationCache::new(1024 * 1024);
        let serializer = BulkSerializer::new(Some(cache.clone()));
        let doc = Document::upsert(0, "a", br#"{"k":1}"#.to_vec());

        let first = serializer.section("i", &doc).unwrap();
        let second = serializer.section("i", &doc).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.entry_count(), 1);

        // Same id, different target index: a different section.
        let other = serializer.section("j", &doc).unwrap();
        assert!(!Arc::ptr_eq(&first, &other));
    }

    #[test]
    fn gzip_round_trips_body() {
        let docs = vec![
            Document::upsert(0, "a", br#"{"k":1}"#.to_vec()),
            Document::upsert(1, "b", br#"{"k":2}"#.to_vec()),
        ];
        let body = BulkSerializer::uncached().body("i", &docs).unwrap();
        let compressed = BulkSerializer::gzip(&body).unwrap();

        let mut decoded = Vec::new();
        GzDecoder::new(compressed.as_slice())
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, body);
    }
}
