use crate::{pagination::cursor::ProgressCursor, work::item::WorkItem};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, time::Duration};

/// Stored coordination state for one work item.
///
/// Only a lease store mutates this record, and only through its conditional
/// write path. `expiry` always comes from the store's clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaseRecord {
    pub work_item: WorkItem,
    pub holder_id: Option<String>,
    pub expiry: Option<DateTime<Utc>>,
    /// Duration granted by the most recent acquisition; renewals extend by this.
    pub lease_duration_ms: u64,
    /// Doubling exponent applied to the next acquisition.
    pub next_acquisition_exponent: u32,
    pub acknowledged_cursor: Option<ProgressCursor>,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Observable state of a work item at a given store instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LeaseState {
    Unassigned,
    Leased {
        holder: String,
        expiry: DateTime<Utc>,
    },
    Expired {
        holder: String,
        expiry: DateTime<Utc>,
    },
    Completed {
        at: DateTime<Utc>,
    },
}

impl LeaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeaseState::Unassigned => "Unassigned",
            LeaseState::Leased { .. } => "Leased",
            LeaseState::Expired { .. } => "Expired",
            LeaseState::Completed { .. } => "Completed",
        }
    }
}

impl fmt::Display for LeaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl LeaseRecord {
    pub fn unassigned(work_item: WorkItem, now: DateTime<Utc>) -> Self {
        Self {
            work_item,
            holder_id: None,
            expiry: None,
            lease_duration_ms: 0,
            next_acquisition_exponent: 0,
            acknowledged_cursor: None,
            completed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }

    /// A lease is valid while it has a holder, has not expired and the item is
    /// not completed.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed()
            && self.holder_id.is_some()
            && self.expiry.is_some_and(|expiry| expiry > now)
    }

    pub fn is_held_by(&self, holder: &str, now: DateTime<Utc>) -> bool {
        self.is_valid_at(now) && self.holder_id.as_deref() == Some(holder)
    }

    /// True when no valid lease blocks a new acquisition.
    pub fn is_claimable_at(&self, now: DateTime<Utc>) -> bool {
        !self.is_completed() && !self.is_valid_at(now)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> LeaseState {
        if let Some(at) = self.completed_at {
            return LeaseState::Completed { at };
        }

        match (&self.holder_id, self.expiry) {
            (Some(holder), Some(expiry)) if expiry > now => LeaseState::Leased {
                holder: holder.clone(),
                expiry,
            },
            (Some(holder), Some(expiry)) => LeaseState::Expired {
                holder: holder.clone(),
                expiry,
            },
            _ => LeaseState::Unassigned,
        }
    }

    /// Offset a new holder resumes reading from.
    pub fn resume_offset(&self) -> u64 {
        self.acknowledged_cursor
            .as_ref()
            .map(|c| c.position)
            .unwrap_or(0)
    }

    /// The lease view handed to the current holder, if there is one.
    pub fn lease(&self) -> Option<Lease> {
        let holder_id = self.holder_id.clone()?;
        let expiry = self.expiry?;
        Some(Lease {
            work_item: self.work_item.clone(),
            holder_id,
            expiry,
            duration: Duration::from_millis(self.lease_duration_ms),
            acknowledged_cursor: self.acknowledged_cursor.clone(),
        })
    }
}

/// A store-granted, time-bounded claim on a work item.
#[derive(Debug, Clone, PartialEq)]
pub struct Lease {
    pub work_item: WorkItem,
    pub holder_id: String,
    pub expiry: DateTime<Utc>,
    pub duration: Duration,
    pub acknowledged_cursor: Option<ProgressCursor>,
}

impl Lease {
    /// Time left before `expiry`, as seen from `now`. Zero once expired.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expiry - now).to_std().unwrap_or(Duration::ZERO)
    }

    pub fn resume_offset(&self) -> u64 {
        self.acknowledged_cursor
            .as_ref()
            .map(|c| c.position)
            .unwrap_or(0)
    }
}
