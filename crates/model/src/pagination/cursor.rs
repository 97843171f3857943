use crate::work::item::WorkItem;
use serde::{Deserialize, Serialize};

/// Checkpoint marking how far into a work item's document sequence processing
/// has durably advanced.
///
/// `position` is an exclusive end offset: the count of leading documents of the
/// shard that are written. Reading resumes at exactly this offset.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProgressCursor {
    pub work_item: WorkItem,
    pub position: u64,
    pub docs_in_batch: u64,
    pub bytes_in_batch: u64,
}

impl ProgressCursor {
    pub fn new(work_item: WorkItem, position: u64, docs_in_batch: u64, bytes_in_batch: u64) -> Self {
        Self {
            work_item,
            position,
            docs_in_batch,
            bytes_in_batch,
        }
    }

    /// Cursor for a work item nothing has been written for yet.
    pub fn start(work_item: WorkItem) -> Self {
        Self::new(work_item, 0, 0, 0)
    }

    /// True if `self` may replace `previous` without moving progress backwards.
    pub fn follows(&self, previous: &ProgressCursor) -> bool {
        self.work_item == previous.work_item && self.position >= previous.position
    }
}
