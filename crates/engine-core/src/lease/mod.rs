use crate::error::LeaseStoreError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{
    pagination::cursor::ProgressCursor,
    work::{item::WorkItem, lease::LeaseRecord},
};
use std::{fmt, time::Duration};

pub mod cluster;
pub mod memory;
pub mod rules;
pub mod sled_store;

/// The mutation a worker asks the store to apply to one lease record.
#[derive(Debug, Clone, PartialEq)]
pub enum LeaseOp {
    /// Take the item if it is unassigned, expired, or already ours.
    Acquire { initial_duration: Duration },
    /// Extend our valid lease and record progress.
    Renew { cursor: Option<ProgressCursor> },
    /// Record progress and let the lease lapse right now.
    Release { cursor: Option<ProgressCursor> },
    /// Mark the item done. Terminal.
    Complete,
}

impl LeaseOp {
    pub fn name(&self) -> &'static str {
        match self {
            LeaseOp::Acquire { .. } => "acquire",
            LeaseOp::Renew { .. } => "renew",
            LeaseOp::Release { .. } => "release",
            LeaseOp::Complete => "complete",
        }
    }
}

/// A conditional write request. `client_time` is only used for the skew
/// check; the store never trusts it for expiry.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaseRequest {
    pub holder_id: String,
    pub client_time: DateTime<Utc>,
    pub op: LeaseOp,
}

impl LeaseRequest {
    pub fn new(holder_id: impl Into<String>, client_time: DateTime<Utc>, op: LeaseOp) -> Self {
        Self {
            holder_id: holder_id.into(),
            client_time,
            op,
        }
    }
}

/// Why a conditional write was not applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotFound,
    Completed,
    HeldByOther {
        holder: String,
        expiry: DateTime<Utc>,
    },
    NotHolder,
    Expired,
    CursorRegressed {
        stored: u64,
        requested: u64,
    },
    /// Another writer updated the record between our read and our write.
    Conflict,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::NotFound => f.write_str("work item not found"),
            RejectReason::Completed => f.write_str("work item already completed"),
            RejectReason::HeldByOther { holder, expiry } => {
                write!(f, "held by {holder} until {}", expiry.to_rfc3339())
            }
            RejectReason::NotHolder => f.write_str("lease held by another worker"),
            RejectReason::Expired => f.write_str("lease expired"),
            RejectReason::CursorRegressed { stored, requested } => {
                write!(f, "cursor {requested} is behind stored cursor {stored}")
            }
            RejectReason::Conflict => f.write_str("concurrent update"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum UpdateResult {
    Applied(LeaseRecord),
    Rejected(RejectReason),
}

/// Shared store of lease records, one per work item.
///
/// All mutation goes through `conditional_update`, evaluated atomically at the
/// store against the store's own clock. Losing a race is an
/// `UpdateResult::Rejected`, never an error.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Creates unassigned records for items that have none. Returns how many were new.
    async fn create_work_items(&self, items: &[WorkItem]) -> Result<usize, LeaseStoreError>;

    /// Items that are not completed and carry no valid lease, up to `limit`.
    async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, LeaseStoreError>;

    async fn conditional_update(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError>;

    async fn get(&self, item: &WorkItem) -> Result<Option<LeaseRecord>, LeaseStoreError>;

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseStoreError>;
}
