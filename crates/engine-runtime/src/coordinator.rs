use crate::error::CoordinatorError;
use chrono::{DateTime, Utc};
use engine_core::{
    clock::Clock,
    lease::{LeaseOp, LeaseRequest, LeaseStore, UpdateResult},
    retry::RetryPolicy,
};
use engine_processing::retry::classify_lease_store_error;
use model::{
    pagination::cursor::ProgressCursor,
    work::{
        item::WorkItem,
        lease::{Lease, LeaseRecord},
    },
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

/// Timing knobs for lease handling.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Duration of a first acquisition; later acquisitions double it.
    pub initial_lease: Duration,
    /// Margin subtracted from any remaining-time computation.
    pub tolerable_clock_difference: Duration,
    /// How many claimable items to look at per acquisition attempt.
    pub candidate_limit: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            initial_lease: Duration::from_secs(600),
            tolerable_clock_difference: Duration::from_secs(5),
            candidate_limit: 64,
        }
    }
}

/// Hands out work items through conditional writes on a [`LeaseStore`].
///
/// The coordinator never decides on its own that a lease has expired. Every
/// transition is a store-side conditional write, and a lost race comes back
/// as `None` (acquire), `false` (complete) or [`CoordinatorError::LeaseLost`]
/// (renew).
pub struct LeaseCoordinator {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    config: CoordinatorConfig,
    retry: RetryPolicy,
}

impl LeaseCoordinator {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>, config: CoordinatorConfig) -> Self {
        Self {
            store,
            clock,
            config,
            retry: RetryPolicy::for_lease_store(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn tolerable_clock_difference(&self) -> Duration {
        self.config.tolerable_clock_difference
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Time left until `expiry` on our clock, minus the skew tolerance.
    pub fn remaining_until(&self, expiry: DateTime<Utc>) -> Duration {
        (expiry - self.clock.now())
            .to_std()
            .unwrap_or(Duration::ZERO)
            .saturating_sub(self.config.tolerable_clock_difference)
    }

    /// Claims the first item this worker can win.
    ///
    /// Candidates are rotated by a hash of `worker_id` so that workers starting
    /// together spread over the item set instead of all racing for the first one.
    pub async fn acquire_next(&self, worker_id: &str) -> Result<Option<Lease>, CoordinatorError> {
        let limit = self.config.candidate_limit.max(1);
        let mut candidates = self
            .retry
            .run(|| self.store.list_claimable(limit), classify_lease_store_error)
            .await
            .map_err(|e| CoordinatorError::Store(e.into_inner()))?;

        if candidates.is_empty() {
            debug!(worker_id, "No claimable work items");
            return Ok(None);
        }

        let offset = rotation(worker_id, candidates.len());
        candidates.rotate_left(offset);

        let op = LeaseOp::Acquire {
            initial_duration: self.config.initial_lease,
        };
        for item in candidates {
            match self.update(&item, worker_id, op.clone()).await? {
                UpdateResult::Applied(record) => {
                    let lease = Self::lease_of(&record)?;
                    info!(
                        worker_id,
                        work_item = %item,
                        expiry = %lease.expiry.to_rfc3339(),
                        lease_secs = lease.duration.as_secs(),
                        resume_offset = lease.resume_offset(),
                        "Lease acquired"
                    );
                    return Ok(Some(lease));
                }
                UpdateResult::Rejected(reason) => {
                    debug!(worker_id, work_item = %item, %reason, "Lost acquisition race");
                }
            }
        }

        Ok(None)
    }

    /// Extends our lease and records `cursor` as acknowledged progress.
    pub async fn renew(
        &self,
        worker_id: &str,
        item: &WorkItem,
        cursor: Option<ProgressCursor>,
    ) -> Result<Lease, CoordinatorError> {
        let position = cursor.as_ref().map(|c| c.position);
        match self.update(item, worker_id, LeaseOp::Renew { cursor }).await? {
            UpdateResult::Applied(record) => {
                let lease = Self::lease_of(&record)?;
                info!(
                    worker_id,
                    work_item = %item,
                    position,
                    expiry = %lease.expiry.to_rfc3339(),
                    "Lease renewed"
                );
                Ok(lease)
            }
            UpdateResult::Rejected(reason) => {
                warn!(worker_id, work_item = %item, %reason, "Lease lost");
                Err(CoordinatorError::LeaseLost {
                    work_item: item.key(),
                    reason,
                })
            }
        }
    }

    /// Records `cursor` and lets the lease lapse now, so the item can be
    /// reclaimed without waiting out the expiry. Returns whether it applied.
    pub async fn release(
        &self,
        worker_id: &str,
        item: &WorkItem,
        cursor: Option<ProgressCursor>,
    ) -> Result<bool, CoordinatorError> {
        let position = cursor.as_ref().map(|c| c.position);
        match self.update(item, worker_id, LeaseOp::Release { cursor }).await? {
            UpdateResult::Applied(_) => {
                info!(worker_id, work_item = %item, position, "Lease released");
                Ok(true)
            }
            UpdateResult::Rejected(reason) => {
                warn!(worker_id, work_item = %item, %reason, "Release rejected");
                Ok(false)
            }
        }
    }

    /// Marks the item done. False if we no longer hold it.
    pub async fn complete(&self, worker_id: &str, item: &WorkItem) -> Result<bool, CoordinatorError> {
        match self.update(item, worker_id, LeaseOp::Complete).await? {
            UpdateResult::Applied(_) => {
                info!(worker_id, work_item = %item, "Work item completed");
                Ok(true)
            }
            UpdateResult::Rejected(reason) => {
                warn!(worker_id, work_item = %item, %reason, "Completion rejected");
                Ok(false)
            }
        }
    }

    /// True when at least one item exists and every item is completed.
    pub async fn all_completed(&self) -> Result<bool, CoordinatorError> {
        let records = self
            .retry
            .run(|| self.store.list_all(), classify_lease_store_error)
            .await
            .map_err(|e| CoordinatorError::Store(e.into_inner()))?;
        Ok(!records.is_empty() && records.iter().all(LeaseRecord::is_completed))
    }

    async fn update(
        &self,
        item: &WorkItem,
        worker_id: &str,
        op: LeaseOp,
    ) -> Result<UpdateResult, CoordinatorError> {
        // Each attempt carries a fresh client timestamp for the skew check.
        self.retry
            .run(
                || {
                    let request = LeaseRequest::new(worker_id, self.clock.now(), op.clone());
                    async move { self.store.conditional_update(item, &request).await }
                },
                classify_lease_store_error,
            )
            .await
            .map_err(|e| CoordinatorError::Store(e.into_inner()))
    }

    fn lease_of(record: &LeaseRecord) -> Result<Lease, CoordinatorError> {
        record
            .lease()
            .ok_or_else(|| CoordinatorError::MissingLease(record.work_item.key()))
    }
}

fn rotation(worker_id: &str, len: usize) -> usize {
    let hash = blake3::hash(worker_id.as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(head) % len as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;
    use engine_core::{
        clock::ManualClock, error::LeaseStoreError, lease::RejectReason,
        lease::memory::MemoryLeaseStore,
    };

    const LEASE: Duration = Duration::from_secs(60);
    const TOLERANCE: Duration = Duration::from_secs(5);

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<MemoryLeaseStore>,
        coordinator: LeaseCoordinator,
    }

    async fn fixture(shards: u32) -> Fixture {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryLeaseStore::new(clock.clone(), TOLERANCE));
        let items: Vec<_> = (0..shards).map(|s| WorkItem::new("snap", "idx", s)).collect();
        store.create_work_items(&items).await.unwrap();

        let coordinator = LeaseCoordinator::new(
            store.clone(),
            clock.clone(),
            CoordinatorConfig {
                initial_lease: LEASE,
                tolerable_clock_difference: TOLERANCE,
                candidate_limit: 16,
            },
        )
        .with_retry(RetryPolicy::new(2, Duration::ZERO, Duration::ZERO));

        Fixture {
            clock,
            store,
            coordinator,
        }
    }

    #[tokio::test]
    async fn second_worker_gets_nothing_while_single_item_is_held() {
        let f = fixture(1).await;
        let lease = f.coordinator.acquire_next("w1").await.unwrap().unwrap();
        assert_eq!(lease.holder_id, "w1");
        assert_eq!(lease.duration, LEASE);

        assert!(f.coordinator.acquire_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_with_doubled_duration_and_cursor() {
        let f = fixture(1).await;
        let lease = f.coordinator.acquire_next("w1").await.unwrap().unwrap();
        let cursor = ProgressCursor::new(lease.work_item.clone(), 40, 20, 800);
        f.coordinator
            .renew("w1", &lease.work_item, Some(cursor.clone()))
            .await
            .unwrap();

        f.clock.advance(LEASE * 2);
        let reclaimed = f.coordinator.acquire_next("w2").await.unwrap().unwrap();
        assert_eq!(reclaimed.holder_id, "w2");
        assert_eq!(reclaimed.duration, LEASE * 2);
        assert_eq!(reclaimed.acknowledged_cursor, Some(cursor));
        assert_eq!(reclaimed.resume_offset(), 40);

        let err = f
            .coordinator
            .renew("w1", &lease.work_item, None)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::LeaseLost {
                reason: RejectReason::NotHolder,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn release_makes_item_claimable_immediately() {
        let f = fixture(1).await;
        let lease = f.coordinator.acquire_next("w1").await.unwrap().unwrap();
        let cursor = ProgressCursor::new(lease.work_item.clone(), 7, 7, 70);

        assert!(
            f.coordinator
                .release("w1", &lease.work_item, Some(cursor))
                .await
                .unwrap()
        );
        let next = f.coordinator.acquire_next("w2").await.unwrap().unwrap();
        assert_eq!(next.resume_offset(), 7);
    }

    #[tokio::test]
    async fn completion_is_terminal() {
        let f = fixture(1).await;
        let lease = f.coordinator.acquire_next("w1").await.unwrap().unwrap();

        assert!(!f.coordinator.all_completed().await.unwrap());
        assert!(f.coordinator.complete("w1", &lease.work_item).await.unwrap());
        assert!(f.coordinator.complete("w1", &lease.work_item).await.unwrap());
        assert!(!f.coordinator.complete("w2", &lease.work_item).await.unwrap());
        assert!(f.coordinator.all_completed().await.unwrap());

        f.clock.advance(LEASE * 10);
        assert!(f.coordinator.acquire_next("w2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn workers_spread_over_items() {
        let f = fixture(8).await;
        let mut held = std::collections::HashSet::new();
        for w in 0..8 {
            let lease = f
                .coordinator
                .acquire_next(&format!("worker-{w}"))
                .await
                .unwrap()
                .unwrap();
            assert!(held.insert(lease.work_item));
        }
        assert!(f.coordinator.acquire_next("late").await.unwrap().is_none());
        assert_eq!(f.store.list_claimable(10).await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn skewed_client_is_refused() {
        let f = fixture(1).await;
        let skewed_clock = Arc::new(ManualClock::new(f.clock.now() + chrono::TimeDelta::seconds(30)));
        let skewed = LeaseCoordinator::new(f.store.clone(), skewed_clock, CoordinatorConfig::default())
            .with_retry(RetryPolicy::new(3, Duration::ZERO, Duration::ZERO));

        let err = skewed.acquire_next("w1").await.unwrap_err();
        assert!(matches!(
            err,
            CoordinatorError::Store(LeaseStoreError::ClockSkew { .. })
        ));
    }

    #[test]
    fn remaining_time_subtracts_tolerance() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryLeaseStore::new(clock.clone(), TOLERANCE));
        let coordinator = LeaseCoordinator::new(
            store,
            clock.clone(),
            CoordinatorConfig {
                initial_lease: LEASE,
                tolerable_clock_difference: TOLERANCE,
                candidate_limit: 1,
            },
        );

        let expiry = clock.now() + chrono::TimeDelta::seconds(20);
        assert_eq!(coordinator.remaining_until(expiry), Duration::from_secs(15));
        clock.advance(Duration::from_secs(18));
        assert_eq!(coordinator.remaining_until(expiry), Duration::ZERO);
    }
}
