use crate::{clock::Clock, error::ProgressError, lease::LeaseStore};
use chrono::{DateTime, Utc};
use model::work::{item::WorkItem, lease::LeaseState};
use serde::Serialize;
use std::sync::Arc;

/// Read-only view over the lease store for status reporting.
#[derive(Clone)]
pub struct ProgressService {
    store: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub unassigned: usize,
    pub leased: usize,
    pub expired: usize,
    pub completed: usize,
    /// Sum of acknowledged cursor positions across items.
    pub docs_acknowledged: u64,
}

impl ProgressSummary {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ItemProgress {
    pub work_item: WorkItem,
    pub state: LeaseState,
    pub acknowledged_position: u64,
    pub next_acquisition_exponent: u32,
    pub updated_at: DateTime<Utc>,
}

impl ProgressService {
    pub fn new(store: Arc<dyn LeaseStore>, clock: Arc<dyn Clock>) -> Self {
        ProgressService { store, clock }
    }

    pub async fn items(&self) -> Result<Vec<ItemProgress>, ProgressError> {
        let now = self.clock.now();
        let mut items: Vec<ItemProgress> = self
            .store
            .list_all()
            .await?
            .into_iter()
            .map(|record| ItemProgress {
                state: record.state_at(now),
                acknowledged_position: record.resume_offset(),
                next_acquisition_exponent: record.next_acquisition_exponent,
                updated_at: record.updated_at,
                work_item: record.work_item,
            })
            .collect();
        items.sort_by(|a, b| a.work_item.cmp(&b.work_item));
        Ok(items)
    }

    pub async fn item(&self, item: &WorkItem) -> Result<ItemProgress, ProgressError> {
        let record = self
            .store
            .get(item)
            .await?
            .ok_or_else(|| ProgressError::UnknownItem(item.key()))?;
        Ok(ItemProgress {
            state: record.state_at(self.clock.now()),
            acknowledged_position: record.resume_offset(),
            next_acquisition_exponent: record.next_acquisition_exponent,
            updated_at: record.updated_at,
            work_item: record.work_item,
        })
    }

    pub async fn summary(&self) -> Result<ProgressSummary, ProgressError> {
        let items = self.items().await?;
        let mut summary = ProgressSummary {
            total: items.len(),
            ..Default::default()
        };

        for item in &items {
            match item.state {
                LeaseState::Unassigned => summary.unassigned += 1,
                LeaseState::Leased { .. } => summary.leased += 1,
                LeaseState::Expired { .. } => summary.expired += 1,
                LeaseState::Completed { .. } => summary.completed += 1,
            }
            summary.docs_acknowledged += item.acknowledged_position;
        }
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        clock::ManualClock,
        lease::{LeaseOp, LeaseRequest, memory::MemoryLeaseStore},
    };
    use model::pagination::cursor::ProgressCursor;
    use std::time::Duration;

    #[tokio::test]
    async fn summary_counts_each_state() {
        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryLeaseStore::new(clock.clone(), Duration::from_secs(5)));
        let items: Vec<_> = (0..4).map(|s| WorkItem::new("snap", "idx", s)).collect();
        store.create_work_items(&items).await.unwrap();

        let acquire = |holder: &str| {
            LeaseRequest::new(
                holder,
                clock.now(),
                LeaseOp::Acquire {
                    initial_duration: Duration::from_secs(30),
                },
            )
        };

        // 0: completed, 1: leased with progress, 2: expired, 3: unassigned.
        store.conditional_update(&items[0], &acquire("a")).await.unwrap();
        store
            .conditional_update(&items[0], &LeaseRequest::new("a", clock.now(), LeaseOp::Complete))
            .await
            .unwrap();
        store.conditional_update(&items[2], &acquire("c")).await.unwrap();
        clock.advance(Duration::from_secs(31));
        store.conditional_update(&items[1], &acquire("b")).await.unwrap();
        let renew = LeaseRequest::new(
            "b",
            clock.now(),
            LeaseOp::Renew {
                cursor: Some(ProgressCursor::new(items[1].clone(), 40, 40, 400)),
            },
        );
        store.conditional_update(&items[1], &renew).await.unwrap();

        let service = ProgressService::new(store, clock);
        let summary = service.summary().await.unwrap();
        assert_eq!(
            summary,
            ProgressSummary {
                total: 4,
                unassigned: 1,
                leased: 1,
                expired: 1,
                completed: 1,
                docs_acknowledged: 40,
            }
        );
        assert!(!summary.all_completed());

        let row = service.item(&items[1]).await.unwrap();
        assert_eq!(row.state.as_str(), "Leased");
        assert_eq!(row.acknowledged_position, 40);
        assert!(service.item(&WorkItem::new("x", "y", 9)).await.is_err());
    }
}
