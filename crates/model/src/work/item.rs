use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

const KEY_SEPARATOR: &str = "__";

/// The smallest unit of migration work: one shard of one index in one snapshot.
///
/// Work items are enumerated once, up front, and never change afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkItem {
    pub snapshot: String,
    pub index: String,
    pub shard: u32,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Invalid work item key '{0}', expected <snapshot>__<index>__<shard>")]
pub struct WorkItemKeyError(pub String);

impl WorkItem {
    pub fn new(snapshot: impl Into<String>, index: impl Into<String>, shard: u32) -> Self {
        Self {
            snapshot: snapshot.into(),
            index: index.into(),
            shard,
        }
    }

    /// Stable key used to address the item's lease record.
    pub fn key(&self) -> String {
        format!(
            "{}{sep}{}{sep}{}",
            self.snapshot,
            self.index,
            self.shard,
            sep = KEY_SEPARATOR
        )
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

impl FromStr for WorkItem {
    type Err = WorkItemKeyError;

    /// The shard is split off the right and the snapshot off the left, so only
    /// the snapshot name must be free of `__`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || WorkItemKeyError(s.to_string());

        let (rest, shard) = s.rsplit_once(KEY_SEPARATOR).ok_or_else(err)?;
        let shard = shard.parse::<u32>().map_err(|_| err())?;
        let (snapshot, index) = rest.split_once(KEY_SEPARATOR).ok_or_else(err)?;

        if snapshot.is_empty() || index.is_empty() {
            return Err(err());
        }

        Ok(WorkItem::new(snapshot, index, shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_round_trips_through_from_str() {
        let item = WorkItem::new("snap-1", "logs__2024", 3);
        let parsed: WorkItem = item.key().parse().unwrap();
        assert_eq!(parsed, item);
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!("snap__idx".parse::<WorkItem>().is_err());
        assert!("snap__idx__x".parse::<WorkItem>().is_err());
        assert!("__idx__1".parse::<WorkItem>().is_err());
    }
}
