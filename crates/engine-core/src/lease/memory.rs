use crate::{
    clock::Clock,
    error::LeaseStoreError,
    lease::{LeaseRequest, LeaseStore, UpdateResult, rules},
};
use async_trait::async_trait;
use model::work::{item::WorkItem, lease::LeaseRecord};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};
use tracing::debug;

/// In-process lease store. Every write runs under a single mutex, so it
/// offers the same conditional semantics as the shared backends.
#[derive(Debug)]
pub struct MemoryLeaseStore {
    records: Mutex<BTreeMap<String, LeaseRecord>>,
    clock: Arc<dyn Clock>,
    skew_tolerance: Duration,
}

impl MemoryLeaseStore {
    pub fn new(clock: Arc<dyn Clock>, skew_tolerance: Duration) -> Self {
        Self {
            records: Mutex::new(BTreeMap::new()),
            clock,
            skew_tolerance,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, LeaseRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LeaseStore for MemoryLeaseStore {
    async fn create_work_items(&self, items: &[WorkItem]) -> Result<usize, LeaseStoreError> {
        let now = self.clock.now();
        let mut records = self.lock();
        let mut created = 0;
        for item in items {
            records.entry(item.key()).or_insert_with(|| {
                created += 1;
                LeaseRecord::unassigned(item.clone(), now)
            });
        }
        Ok(created)
    }

    async fn list_claimable(&self, limit: usize) -> Result<Vec<WorkItem>, LeaseStoreError> {
        let now = self.clock.now();
        Ok(self
            .lock()
            .values()
            .filter(|rec| rec.is_claimable_at(now))
            .take(limit)
            .map(|rec| rec.work_item.clone())
            .collect())
    }

    async fn conditional_update(
        &self,
        item: &WorkItem,
        request: &LeaseRequest,
    ) -> Result<UpdateResult, LeaseStoreError> {
        let key = item.key();
        let mut records = self.lock();
        let now = self.clock.now();

        let result = rules::evaluate(records.get(&key), request, now, self.skew_tolerance)?;
        if let UpdateResult::Applied(record) = &result {
            records.insert(key, record.clone());
        }
        debug!(work_item = %item, op = request.op.name(), applied = matches!(result, UpdateResult::Applied(_)), "Lease update evaluated");
        Ok(result)
    }

    async fn get(&self, item: &WorkItem) -> Result<Option<LeaseRecord>, LeaseStoreError> {
        Ok(self.lock().get(&item.key()).cloned())
    }

    async fn list_all(&self) -> Result<Vec<LeaseRecord>, LeaseStoreError> {
        Ok(self.lock().values().cloned().collect())
    }
}
