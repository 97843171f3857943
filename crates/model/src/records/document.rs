use serde::{Deserialize, Serialize};

/// Kind of write a document turns into on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    #[default]
    Upsert,
    Delete,
}

/// One live document read from a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Zero-based ordinal within the shard, counting skipped entries too.
    pub position: u64,
    pub id: String,
    pub doc_type: Option<String>,
    pub routing: Option<String>,
    pub source: Vec<u8>,
    pub op: OpKind,
}

impl Document {
    pub fn upsert(position: u64, id: impl Into<String>, source: impl Into<Vec<u8>>) -> Self {
        Self {
            position,
            id: id.into(),
            doc_type: None,
            routing: None,
            source: source.into(),
            op: OpKind::Upsert,
        }
    }

    pub fn delete(position: u64, id: impl Into<String>) -> Self {
        Self {
            position,
            id: id.into(),
            doc_type: None,
            routing: None,
            source: Vec::new(),
            op: OpKind::Delete,
        }
    }

    pub fn with_type(mut self, doc_type: impl Into<String>) -> Self {
        self.doc_type = Some(doc_type.into());
        self
    }

    pub fn with_routing(mut self, routing: impl Into<String>) -> Self {
        self.routing = Some(routing.into());
        self
    }
}
