use crate::{
    coordinator::LeaseCoordinator,
    error::{CoordinatorError, WorkerError},
};
use engine_core::metrics::{Metrics, MetricsSnapshot};
use engine_processing::pipeline::{PipelineExit, ShardPipeline};
use model::{
    pagination::cursor::ProgressCursor,
    work::{item::WorkItem, lease::Lease},
};
use serde::Serialize;
use std::{fmt, time::Duration, time::Instant};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// How a worker invocation ended. Each maps to a process exit code the
/// supervisor acts on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerOutcome {
    /// Every work item is completed.
    AllCompleted,
    /// Lease time ran out with work remaining. Relaunch.
    Continue,
    /// Nothing claimable, but other workers still hold leases.
    NothingToDo,
    LeaseLost,
    Shutdown,
}

impl WorkerOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerOutcome::AllCompleted => 0,
            WorkerOutcome::Continue => 2,
            WorkerOutcome::NothingToDo => 3,
            WorkerOutcome::LeaseLost => 4,
            WorkerOutcome::Shutdown => 130,
        }
    }
}

impl fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkerOutcome::AllCompleted => "all_completed",
            WorkerOutcome::Continue => "continue",
            WorkerOutcome::NothingToDo => "nothing_to_do",
            WorkerOutcome::LeaseLost => "lease_lost",
            WorkerOutcome::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerReport {
    pub worker_id: String,
    pub outcome: WorkerOutcome,
    pub items_completed: usize,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Cadence of progress-persisting renewals. Shorter than the lease.
    pub renew_interval: Duration,
    /// Below this much remaining lease time no new batch is started.
    pub min_time_for_batch: Duration,
    /// Release the lease on time exhaustion and shutdown instead of letting it expire.
    pub release_on_exit: bool,
    /// Prepended to the source index name to form the target index.
    pub index_prefix: String,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: generate_worker_id(),
            renew_interval: Duration::from_secs(60),
            min_time_for_batch: Duration::from_secs(30),
            release_on_exit: true,
            index_prefix: String::new(),
        }
    }
}

impl WorkerConfig {
    pub fn target_index(&self, item: &WorkItem) -> String {
        format!("{}{}", self.index_prefix, item.index)
    }
}

/// Fresh identity for one process invocation.
pub fn generate_worker_id() -> String {
    format!("worker-{}", Uuid::new_v4())
}

/// Why the renewal task stopped the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeepAliveStop {
    TimeExhausted,
    LeaseLost,
    Shutdown,
}

/// How one lease holding ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HoldingEnd {
    Completed,
    TimeExhausted,
    LeaseLost,
    Shutdown,
}

/// The per-process control loop: acquire, stream, renew, and finish or hand
/// the item back.
pub struct Worker {
    config: WorkerConfig,
    coordinator: LeaseCoordinator,
    pipeline: ShardPipeline,
    metrics: Metrics,
    shutdown: CancellationToken,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        coordinator: LeaseCoordinator,
        pipeline: ShardPipeline,
        metrics: Metrics,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            coordinator,
            pipeline,
            metrics,
            shutdown,
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    /// Works items until none is claimable, time runs out, the lease is lost
    /// or shutdown is requested.
    pub async fn run(&self) -> Result<WorkerReport, WorkerError> {
        let started = Instant::now();
        let mut items_completed = 0;
        let result = self.run_items(&mut items_completed).await;
        let metrics = self.metrics.snapshot();

        match &result {
            Ok(outcome) => info!(
                worker_id = %self.config.worker_id,
                outcome = %outcome,
                exit_code = outcome.exit_code(),
                items_completed,
                docs_written = metrics.docs_written,
                docs_failed = metrics.docs_failed,
                bytes_sent = metrics.bytes_sent,
                bulk_requests = metrics.bulk_requests,
                bulk_retries = metrics.bulk_retries,
                lease_renewals = metrics.lease_renewals,
                duration_ms = started.elapsed().as_millis(),
                "Worker finished"
            ),
            Err(err) => error!(
                worker_id = %self.config.worker_id,
                error = %err,
                items_completed,
                docs_written = metrics.docs_written,
                duration_ms = started.elapsed().as_millis(),
                "Worker failed"
            ),
        }

        result.map(|outcome| WorkerReport {
            worker_id: self.config.worker_id.clone(),
            outcome,
            items_completed,
            metrics,
        })
    }

    async fn run_items(&self, items_completed: &mut usize) -> Result<WorkerOutcome, WorkerError> {
        let worker_id = self.config.worker_id.as_str();
        info!(worker_id, "Worker started");

        loop {
            if self.shutdown.is_cancelled() {
                return Ok(WorkerOutcome::Shutdown);
            }

            let Some(lease) = self.coordinator.acquire_next(worker_id).await? else {
                if self.coordinator.all_completed().await? {
                    return Ok(WorkerOutcome::AllCompleted);
                }
                info!(worker_id, "No claimable work items left");
                return Ok(WorkerOutcome::NothingToDo);
            };

            match self.process(lease).await? {
                HoldingEnd::Completed => *items_completed += 1,
                HoldingEnd::TimeExhausted => return Ok(WorkerOutcome::Continue),
                HoldingEnd::LeaseLost => return Ok(WorkerOutcome::LeaseLost),
                HoldingEnd::Shutdown => return Ok(WorkerOutcome::Shutdown),
            }
        }
    }

    async fn process(&self, lease: Lease) -> Result<HoldingEnd, WorkerError> {
        let item = lease.work_item.clone();
        let index = self.config.target_index(&item);
        let stop = self.shutdown.child_token();
        let (progress_tx, progress_rx) = watch::channel(lease.acknowledged_cursor.clone());

        let run = self.pipeline.run(
            &item,
            &index,
            lease.resume_offset(),
            &stop,
            &progress_tx,
        );
        let keep = self.keep_alive(&lease, &progress_rx);
        tokio::pin!(run, keep);

        let (result, stopped_by) = tokio::select! {
            biased;
            result = &mut run => (result, None),
            stopped_by = &mut keep => {
                // In-flight writes settle per the pipeline's policy; nothing new starts.
                stop.cancel();
                (run.await, Some(stopped_by))
            }
        };

        let cursor = progress_rx.borrow().clone();

        let stopped_by = match stopped_by {
            Some(Err(err)) => {
                if let Err(pipeline_err) = &result {
                    warn!(work_item = %item, error = %pipeline_err, "Pipeline also failed");
                }
                return Err(err.into());
            }
            Some(Ok(KeepAliveStop::LeaseLost)) => return Ok(HoldingEnd::LeaseLost),
            Some(Ok(reason)) => Some(reason),
            None => None,
        };

        let summary = match result {
            Ok(summary) => summary,
            Err(err) => {
                // Keep what was acknowledged before failing.
                if let Err(persist_err) = self.persist(&item, cursor).await {
                    warn!(work_item = %item, error = %persist_err, "Could not persist cursor");
                }
                return Err(err.into());
            }
        };

        if summary.exit == PipelineExit::Drained {
            if !self.finish_item(&item, cursor).await? {
                return Ok(HoldingEnd::LeaseLost);
            }
            return Ok(if self.shutdown.is_cancelled() {
                HoldingEnd::Shutdown
            } else {
                HoldingEnd::Completed
            });
        }

        if !self.persist(&item, cursor).await? {
            return Ok(HoldingEnd::LeaseLost);
        }
        Ok(match stopped_by {
            Some(KeepAliveStop::TimeExhausted) => HoldingEnd::TimeExhausted,
            _ => HoldingEnd::Shutdown,
        })
    }

    /// Renews on a cadence until the holding's time budget runs out.
    ///
    /// The budget is the expiry granted at acquisition; renewals keep the
    /// lease alive and checkpoint progress but never extend the budget, so a
    /// long shard is worked in lease-sized increments.
    async fn keep_alive(
        &self,
        lease: &Lease,
        progress: &watch::Receiver<Option<ProgressCursor>>,
    ) -> Result<KeepAliveStop, CoordinatorError> {
        let worker_id = self.config.worker_id.as_str();
        let deadline = lease.expiry;

        loop {
            let budget = self.coordinator.remaining_until(deadline);
            if budget <= self.config.min_time_for_batch {
                info!(
                    worker_id,
                    work_item = %lease.work_item,
                    remaining_ms = budget.as_millis(),
                    "Lease time exhausted"
                );
                return Ok(KeepAliveStop::TimeExhausted);
            }

            let wait = self
                .config
                .renew_interval
                .min(budget - self.config.min_time_for_batch);
            tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(KeepAliveStop::Shutdown),
                _ = tokio::time::sleep(wait) => {}
            }

            let cursor = progress.borrow().clone();
            match self.coordinator.renew(worker_id, &lease.work_item, cursor).await {
                Ok(_) => self.metrics.increment_renewals(1),
                Err(CoordinatorError::LeaseLost { .. }) => return Ok(KeepAliveStop::LeaseLost),
                Err(err) => return Err(err),
            }
        }
    }

    /// Final cursor, then completion. False if the lease was gone.
    async fn finish_item(
        &self,
        item: &WorkItem,
        cursor: Option<ProgressCursor>,
    ) -> Result<bool, CoordinatorError> {
        let worker_id = self.config.worker_id.as_str();
        match self.coordinator.renew(worker_id, item, cursor).await {
            Ok(_) => {}
            Err(CoordinatorError::LeaseLost { .. }) => return Ok(false),
            Err(err) => return Err(err),
        }
        self.coordinator.complete(worker_id, item).await
    }

    /// Stores the cursor, releasing the lease if configured. False if the
    /// lease was gone.
    async fn persist(
        &self,
        item: &WorkItem,
        cursor: Option<ProgressCursor>,
    ) -> Result<bool, CoordinatorError> {
        let worker_id = self.config.worker_id.as_str();
        if self.config.release_on_exit {
            return self.coordinator.release(worker_id, item, cursor).await;
        }
        match self.coordinator.renew(worker_id, item, cursor).await {
            Ok(_) => Ok(true),
            Err(CoordinatorError::LeaseLost { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcomes_map_to_distinct_exit_codes() {
        let outcomes = [
            WorkerOutcome::AllCompleted,
            WorkerOutcome::Continue,
            WorkerOutcome::NothingToDo,
            WorkerOutcome::LeaseLost,
            WorkerOutcome::Shutdown,
        ];
        let codes: Vec<i32> = outcomes.iter().map(WorkerOutcome::exit_code).collect();
        assert_eq!(codes, vec![0, 2, 3, 4, 130]);
        assert_eq!(WorkerOutcome::Continue.to_string(), "continue");
    }

    #[test]
    fn target_index_applies_prefix() {
        let config = WorkerConfig {
            index_prefix: "migrated-".into(),
            ..WorkerConfig::default()
        };
        assert_eq!(
            config.target_index(&WorkItem::new("snap", "logs", 2)),
            "migrated-logs"
        );
    }

    #[test]
    fn worker_ids_are_unique_per_invocation() {
        assert_ne!(generate_worker_id(), generate_worker_id());
        assert!(generate_worker_id().starts_with("worker-"));
    }
}
