use crate::{
    clock::Clock,
    error::LeaseStoreError,
    lease::{LeaseRequest, LeaseStore, UpdateResult, rules},
};
use async_trait::async_trait;
use model::work::{item::WorkItem, lease::LeaseRecord};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use std::{path::Path, sync::Arc, time::Duration};
use tracing::debug;

const KEY_PREFIX: &str = "lease:";

/// Lease store on an embedded sled database.
///
/// Conditional writes run inside a sled transaction, which gives
/// compare-and-set semantics between tasks of one process. Separate processes
/// can share the directory only by running one after another, since sled
/// holds an exclusive lock on it while open.
pub struct SledLeaseStore {
    db: sled::Db,
    clock: Arc<dyn Clock>,
    skew_tolerance: Duration,
}

impl SledLeaseStore {
    pub fn open(
        path: impl AsRef<Path>,
        clock: Arc<dyn Clock>,
        skew_tolerance: Duration,
    ) -> Result<Self, LeaseStoreError> {
        let db = sled::open(path)?;
        Ok(Self {
            db,
            clock,
            skew_tolerance,
        })
    }

    #[inline]
    fn key(item: &WorkItem) -> String {
        format!("{KEY_PREFIX}{}", item.key())
    }

    fn decode(bytes: &[u8]) -> Result<LeaseRecord, LeaseStoreError> {
        bincode::deserialize(bytes).map_err(|e| LeaseStoreError::Serialization(e.to_string()))
    }

    fn encode(record: &LeaseRecord) -> Result<Vec<u8>, LeaseStoreError> {
        bincode::serialize(record).map_err(|e| LeaseStoreError::Serialization(e.to_string()))
    }

    fn scan(&self) -> impl Iterator<Item = Result<LeaseRecord, LeaseStoreError>> + '_ {
        self.db.scan_prefix(KEY_PREFIX).map(|entry| {
            let (_key, value) = entry?;
            Self::decode(&value)
        })
    }
}

#[async_trait]
impl LeaseStore for SledLeaseStore {
    async fn create_work_items(&self, items: &[WorkItem]) -> Result<usize, LeaseStoreError> {
        let now = self.clock.now();
        let mut created = 0;

        for item in items {
            let bytes = Self::encode(&LeaseRecord::unassigned(item.clone(), now))?;
            // Insert only if absent; an existing record keeps its progress.
            if self
                .db
                .compare_and_swap(Self::key(item), None as Option<&[u8]>, Some(bytes))?
                .is_ok()
            {
                created += 1;
            }
        }

        self.db.flush_async().await?;
        Ok(created)
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let now = self.clock.now();
        let mut items = Vec::new();
        for record in self.scan() {
            let record = record?;
            if record.is_claimable_at(now) {
                items.push(record.work_item);
                if items.len() >= limit {
                    break;
                }
            }
        }
        Ok(items)
    }

    async fn conditional_update(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError> {
        let key = Self::key(item);

        let result = self
            .db
            .transaction::<_, _, LeaseStoreError>(|tx_db| {
                let current = match tx_db.get(key.as_bytes())? {
                    Some(bytes) => {
                        Some(Self::decode(&bytes).map_err(ConflictableTransactionError::Abort)?)
                    }
                    None => None,
                };

                let now = self.clock.now();
                let result = rules::evaluate(current.as_ref(), request, now, self.skew_tolerance)
                    .map_err(ConflictableTransactionError::Abort)?;

                if let UpdateResult::Applied(record) = &result
                    && current.as_ref() != Some(record)
                {
                    let bytes = Self::encode(record).map_err(ConflictableTransactionError::Abort)?;
                    tx_db.insert(key.as_bytes(), bytes)?;
                }
                Ok(result)
            });

        let result = match result {
            Ok(result) => result,
            Err(TransactionError::Abort(e)) => return Err(e),
            Err(TransactionError::Storage(e)) => return Err(e.into()),
        };

        if matches!(result, UpdateResult::Applied(_)) {
            self.db.flush_async().await?;
        }
        debug!(work_item = %item, op = request.op.name(), "Lease transaction committed");
        Ok(result)
    }

    async fn get(&self, item: &WorkItem) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        match self.db.get(Self::key(item))? {
            Some(bytes) => Ok(Some(Self::decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseStoreError> {
        self.scan().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        lease::{LeaseOp, RejectReason},
    };
    use model::pagination::cursor::ProgressCursor;
    use tempfile::tempdir;

    fn acquire(holder: &str, clock: &ManualClock) -> LeaseRequest {
        LeaseRequest::new(
            holder,
            clock.now(),
            LeaseOp::Acquire {
                initial_duration: Duration::from_secs(30),
            },
        )
    }

    #[tokio::test]
    async fn progress_survives_reopen() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let item = WorkItem::new("snap", "idx", 2);
        let cursor = ProgressCursor::new(item.clone(), 25, 25, 2_500);

        {
            let store =
                SledLeaseStore::open(dir.path(), clock.clone(), Duration::from_secs(5)).unwrap();
            assert_eq!(store.create_work_items(&[item.clone()]).await.unwrap(), 1);
            store
                .conditional_update(&item, &acquire("w1", &clock))
                .await
                .unwrap();
            let release = LeaseRequest::new(
                "w1",
                clock.now(),
                LeaseOp::Release {
                    cursor: Some(cursor.clone()),
                },
            );
            let result = store.conditional_update(&item, &release).await.unwrap();
            assert!(matches!(result, UpdateResult::Applied(_)));
        }

        let store = SledLeaseStore::open(dir.path(), clock.clone(), Duration::from_secs(5)).unwrap();
        assert_eq!(store.create_work_items(&[item.clone()]).await.unwrap(), 0);

        let record = store.get(&item).await.unwrap().unwrap();
        assert_eq!(record.acknowledged_cursor, Some(cursor));
        assert_eq!(store.list_claimable(10).await.unwrap(), vec![item]);
    }

    #[tokio::test]
    async fn completed_items_are_never_claimable() {
        let dir = tempdir().unwrap();
        let clock = Arc::new(ManualClock::default());
        let store = SledLeaseStore::open(dir.path(), clock.clone(), Duration::from_secs(5)).unwrap();
        let item = WorkItem::new("snap", "idx", 0);
        store.create_work_items(&[item.clone()]).await.unwrap();

        store
            .conditional_update(&item, &acquire("w1", &clock))
            .await
            .unwrap();
        let complete = LeaseRequest::new("w1", clock.now(), LeaseOp::Complete);
        store.conditional_update(&item, &complete).await.unwrap();

        clock.advance(Duration::from_secs(3600));
        assert!(store.list_claimable(10).await.unwrap().is_empty());
        let result = store
            .conditional_update(&item, &acquire("w2", &clock))
            .await
            .unwrap();
        assert_eq!(result, UpdateResult::Rejected(RejectReason::Completed));
    }
}
