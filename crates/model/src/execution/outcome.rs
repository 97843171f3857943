use crate::{core::identifiers::BatchId, pagination::cursor::ProgressCursor};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Error detail attached to a failed bulk item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub error_type: String,
    pub reason: String,
}

/// Result for one document inside a bulk response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Action key of the response item (`index`, `create`, `update`, `delete`).
    pub action: String,
    pub id: String,
    pub status: u16,
    pub error: Option<ItemError>,
}

impl ItemOutcome {
    /// 200/201 are applied writes; a delete of a missing document is also done.
    pub fn succeeded(&self) -> bool {
        matches!(self.status, 200 | 201) || (self.action == "delete" && self.status == 404)
    }
}

/// Parsed response of one bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BulkWriteOutcome {
    pub status: u16,
    pub took_ms: Option<u64>,
    pub errors: bool,
    pub items: Vec<ItemOutcome>,
}

impl BulkWriteOutcome {
    pub fn succeeded_ids(&self) -> impl Iterator<Item = &str> {
        self.items
            .iter()
            .filter(|i| i.succeeded())
            .map(|i| i.id.as_str())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ItemOutcome> {
        self.items.iter().filter(|i| !i.succeeded())
    }

    pub fn has_failures(&self) -> bool {
        self.errors || self.items.iter().any(|i| !i.succeeded())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Every document was acknowledged by the target.
    Written,
    /// Retries ran out with documents still failing.
    PartiallyFailed,
    /// The target refused the request as malformed; not retried.
    Rejected,
}

impl fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BatchStatus::Written => f.write_str("written"),
            BatchStatus::PartiallyFailed => f.write_str("partially_failed"),
            BatchStatus::Rejected => f.write_str("rejected"),
        }
    }
}

/// Final accounting for one batch after all attempts.
#[derive(Debug, Clone)]
pub struct BatchReport {
    pub batch_id: BatchId,
    pub status: BatchStatus,
    pub docs_written: usize,
    pub docs_failed: usize,
    pub attempts: u32,
    pub bytes_sent: u64,
    pub duration: Duration,
    pub cursor: Option<ProgressCursor>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(action: &str, id: &str, status: u16) -> ItemOutcome {
        ItemOutcome {
            action: action.to_string(),
            id: id.to_string(),
            status,
            error: None,
        }
    }

    #[test]
    fn delete_of_missing_document_counts_as_success() {
        assert!(item("delete", "a", 404).succeeded());
        assert!(!item("index", "a", 404).succeeded());
        assert!(item("index", "a", 201).succeeded());
        assert!(!item("index", "a", 429).succeeded());
    }

    #[test]
    fn splits_succeeded_and_failed_items() {
        let outcome = BulkWriteOutcome {
            status: 200,
            took_ms: Some(3),
            errors: true,
            items: vec![item("index", "a", 201), item("index", "b", 503)],
        };
        assert_eq!(outcome.succeeded_ids().collect::<Vec<_>>(), vec!["a"]);
        assert_eq!(outcome.failed().count(), 1);
        assert!(outcome.has_failures());
    }
}
