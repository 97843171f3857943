//! Store-side lease transition rules.
//!
//! Every store backend runs these inside its atomic section (a mutex, a sled
//! transaction, or the equivalent painless script for cluster-backed stores),
//! with `store_now` read from the store's own clock.

use crate::{
    error::LeaseStoreError,
    lease::{LeaseOp, LeaseRequest, RejectReason, UpdateResult},
};
use chrono::{DateTime, TimeDelta, Utc};
use model::work::lease::LeaseRecord;
use std::time::Duration;

/// Acquisition durations stop doubling past `initial * 2^MAX_LEASE_EXPONENT`.
pub const MAX_LEASE_EXPONENT: u32 = 16;

/// Rejects requests whose client clock is too far from the store clock.
pub fn check_skew(
    client_time: DateTime<Utc>,
    store_now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<(), LeaseStoreError> {
    let skew_ms = (client_time - store_now).num_milliseconds();
    let tolerance_ms = tolerance.as_millis() as u64;
    if skew_ms.unsigned_abs() > tolerance_ms {
        return Err(LeaseStoreError::ClockSkew {
            skew_ms,
            tolerance_ms,
        });
    }
    Ok(())
}

/// Duration granted to an acquisition made with the given exponent.
pub fn acquisition_duration(initial: Duration, exponent: u32) -> Duration {
    let factor = 1u32 << exponent.min(MAX_LEASE_EXPONENT);
    initial.saturating_mul(factor)
}

/// Applies `request` to `current` and returns the record to persist, or the
/// reason the write must not happen.
pub fn evaluate(
    current: Option<&LeaseRecord>,
    request: &LeaseRequest,
    store_now: DateTime<Utc>,
    tolerance: Duration,
) -> Result<UpdateResult, LeaseStoreError> {
    check_skew(request.client_time, store_now, tolerance)?;

    let Some(current) = current else {
        return Ok(UpdateResult::Rejected(RejectReason::NotFound));
    };

    if let Some(reason) = rejection(current, request, store_now) {
        return Ok(match reason {
            // Completing twice is harmless for the holder that did it.
            RejectReason::Completed
                if request.op == LeaseOp::Complete
                    && current.holder_id.as_deref() == Some(request.holder_id.as_str()) =>
            {
                UpdateResult::Applied(current.clone())
            }
            other => UpdateResult::Rejected(other),
        });
    }

    let mut next = current.clone();
    next.updated_at = store_now;

    match &request.op {
        LeaseOp::Acquire { initial_duration } => {
            if current.is_held_by(&request.holder_id, store_now) {
                next.expiry = Some(expiry_after(store_now, lease_duration(&next)));
            } else {
                let duration =
                    acquisition_duration(*initial_duration, current.next_acquisition_exponent);
                next.holder_id = Some(request.holder_id.clone());
                next.expiry = Some(expiry_after(store_now, duration));
                next.lease_duration_ms = duration.as_millis() as u64;
                next.next_acquisition_exponent = current.next_acquisition_exponent + 1;
            }
        }
        LeaseOp::Renew { cursor } => {
            if let Some(cursor) = cursor {
                next.acknowledged_cursor = Some(cursor.clone());
            }
            next.expiry = Some(expiry_after(store_now, lease_duration(&next)));
        }
        LeaseOp::Release { cursor } => {
            if let Some(cursor) = cursor {
                next.acknowledged_cursor = Some(cursor.clone());
            }
            next.expiry = Some(store_now);
        }
        LeaseOp::Complete => {
            next.completed_at = Some(store_now);
        }
    }

    Ok(UpdateResult::Applied(next))
}

/// Why `request` cannot be applied to `current` at `store_now`, if it cannot.
pub fn rejection(
    current: &LeaseRecord,
    request: &LeaseRequest,
    store_now: DateTime<Utc>,
) -> Option<RejectReason> {
    if current.is_completed() {
        return Some(RejectReason::Completed);
    }

    let holder = request.holder_id.as_str();
    match &request.op {
        LeaseOp::Acquire { .. } => {
            if current.is_valid_at(store_now) && current.holder_id.as_deref() != Some(holder) {
                return Some(RejectReason::HeldByOther {
                    holder: current.holder_id.clone().unwrap_or_default(),
                    expiry: current.expiry.unwrap_or(store_now),
                });
            }
            None
        }
        LeaseOp::Renew { cursor } | LeaseOp::Release { cursor } => {
            holder_rejection(current, holder, store_now).or_else(|| {
                let requested = cursor.as_ref()?;
                let stored = current.acknowledged_cursor.as_ref()?;
                (!requested.follows(stored)).then(|| RejectReason::CursorRegressed {
                    stored: stored.position,
                    requested: requested.position,
                })
            })
        }
        LeaseOp::Complete => holder_rejection(current, holder, store_now),
    }
}

fn holder_rejection(
    current: &LeaseRecord,
    holder: &str,
    store_now: DateTime<Utc>,
) -> Option<RejectReason> {
    if current.holder_id.as_deref() != Some(holder) {
        return Some(RejectReason::NotHolder);
    }
    if !current.is_valid_at(store_now) {
        return Some(RejectReason::Expired);
    }
    None
}

fn expiry_after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(duration)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn lease_duration(record: &LeaseRecord) -> Duration {
    Duration::from_millis(record.lease_duration_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::{pagination::cursor::ProgressCursor, work::item::WorkItem};

    const TOLERANCE: Duration = Duration::from_secs(5);
    const LEASE: Duration = Duration::from_secs(60);

    fn item() -> WorkItem {
        WorkItem::new("snap", "idx", 0)
    }

    fn req(holder: &str, now: DateTime<Utc>, op: LeaseOp) -> LeaseRequest {
        LeaseRequest::new(holder, now, op)
    }

    fn acquire(holder: &str, now: DateTime<Utc>) -> LeaseRequest {
        req(
            holder,
            now,
            LeaseOp::Acquire {
                initial_duration: LEASE,
            },
        )
    }

    fn applied(result: Result<UpdateResult, LeaseStoreError>) -> LeaseRecord {
        match result.unwrap() {
            UpdateResult::Applied(rec) => rec,
            UpdateResult::Rejected(reason) => panic!("unexpected rejection: {reason}"),
        }
    }

    fn rejected(result: Result<UpdateResult, LeaseStoreError>) -> RejectReason {
        match result.unwrap() {
            UpdateResult::Rejected(reason) => reason,
            UpdateResult::Applied(rec) => panic!("unexpected apply: {rec:?}"),
        }
    }

    #[test]
    fn acquire_assigns_store_time_expiry() {
        let now = Utc::now();
        let rec = LeaseRecord::unassigned(item(), now);
        // Client clock is 3s ahead; expiry still comes from store_now.
        let client = now + TimeDelta::seconds(3);

        let leased = applied(evaluate(Some(&rec), &acquire("w1", client), now, TOLERANCE));
        assert_eq!(leased.holder_id.as_deref(), Some("w1"));
        assert_eq!(leased.expiry, Some(now + TimeDelta::seconds(60)));
        assert_eq!(leased.next_acquisition_exponent, 1);
    }

    #[test]
    fn rejects_clock_skew_beyond_tolerance() {
        let now = Utc::now();
        let rec = LeaseRecord::unassigned(item(), now);
        let client = now - TimeDelta::seconds(6);

        let err = evaluate(Some(&rec), &acquire("w1", client), now, TOLERANCE).unwrap_err();
        assert!(matches!(err, LeaseStoreError::ClockSkew { skew_ms: -6000, .. }));
    }

    #[test]
    fn second_worker_is_rejected_while_lease_is_valid() {
        let now = Utc::now();
        let rec = LeaseRecord::unassigned(item(), now);
        let leased = applied(evaluate(Some(&rec), &acquire("w1", now), now, TOLERANCE));

        let reason = rejected(evaluate(Some(&leased), &acquire("w2", now), now, TOLERANCE));
        assert!(matches!(reason, RejectReason::HeldByOther { ref holder, .. } if holder == "w1"));
    }

    #[test]
    fn reclaim_after_expiry_doubles_duration_and_keeps_cursor() {
        let t0 = Utc::now();
        let rec = LeaseRecord::unassigned(item(), t0);
        let leased = applied(evaluate(Some(&rec), &acquire("w1", t0), t0, TOLERANCE));

        let cursor = ProgressCursor::new(item(), 40, 20, 800);
        let renew = req(
            "w1",
            t0,
            LeaseOp::Renew {
                cursor: Some(cursor.clone()),
            },
        );
        let renewed = applied(evaluate(Some(&leased), &renew, t0, TOLERANCE));

        let t1 = t0 + TimeDelta::seconds(61);
        let reclaimed = applied(evaluate(Some(&renewed), &acquire("w2", t1), t1, TOLERANCE));
        assert_eq!(reclaimed.holder_id.as_deref(), Some("w2"));
        assert_eq!(reclaimed.acknowledged_cursor, Some(cursor));
        assert_eq!(reclaimed.lease_duration_ms, 120_000);
        assert_eq!(reclaimed.expiry, Some(t1 + TimeDelta::seconds(120)));
    }

    #[test]
    fn renew_requires_valid_lease_and_forward_cursor() {
        let t0 = Utc::now();
        let rec = LeaseRecord::unassigned(item(), t0);
        let leased = applied(evaluate(Some(&rec), &acquire("w1", t0), t0, TOLERANCE));

        let forward = req(
            "w1",
            t0,
            LeaseOp::Renew {
                cursor: Some(ProgressCursor::new(item(), 10, 10, 100)),
            },
        );
        let renewed = applied(evaluate(Some(&leased), &forward, t0, TOLERANCE));

        let backward = req(
            "w1",
            t0,
            LeaseOp::Renew {
                cursor: Some(ProgressCursor::new(item(), 5, 5, 50)),
            },
        );
        assert_eq!(
            rejected(evaluate(Some(&renewed), &backward, t0, TOLERANCE)),
            RejectReason::CursorRegressed {
                stored: 10,
                requested: 5
            }
        );

        let other = req("w2", t0, LeaseOp::Renew { cursor: None });
        assert_eq!(
            rejected(evaluate(Some(&renewed), &other, t0, TOLERANCE)),
            RejectReason::NotHolder
        );

        let late = t0 + TimeDelta::seconds(61);
        let too_late = req("w1", late, LeaseOp::Renew { cursor: None });
        assert_eq!(
            rejected(evaluate(Some(&renewed), &too_late, late, TOLERANCE)),
            RejectReason::Expired
        );
    }

    #[test]
    fn release_makes_item_claimable_immediately() {
        let t0 = Utc::now();
        let rec = LeaseRecord::unassigned(item(), t0);
        let leased = applied(evaluate(Some(&rec), &acquire("w1", t0), t0, TOLERANCE));

        let release = req(
            "w1",
            t0,
            LeaseOp::Release {
                cursor: Some(ProgressCursor::new(item(), 7, 7, 70)),
            },
        );
        let released = applied(evaluate(Some(&leased), &release, t0, TOLERANCE));
        assert!(released.is_claimable_at(t0));
        assert_eq!(released.resume_offset(), 7);

        let next = applied(evaluate(Some(&released), &acquire("w2", t0), t0, TOLERANCE));
        assert_eq!(next.holder_id.as_deref(), Some("w2"));
    }

    #[test]
    fn complete_is_terminal_and_idempotent_for_holder() {
        let t0 = Utc::now();
        let rec = LeaseRecord::unassigned(item(), t0);
        let leased = applied(evaluate(Some(&rec), &acquire("w1", t0), t0, TOLERANCE));

        let done = applied(evaluate(
            Some(&leased),
            &req("w1", t0, LeaseOp::Complete),
            t0,
            TOLERANCE,
        ));
        assert!(done.is_completed());

        let again = applied(evaluate(
            Some(&done),
            &req("w1", t0, LeaseOp::Complete),
            t0,
            TOLERANCE,
        ));
        assert_eq!(again, done);

        let later = t0 + TimeDelta::seconds(3600);
        assert_eq!(
            rejected(evaluate(Some(&done), &acquire("w2", later), later, TOLERANCE)),
            RejectReason::Completed
        );
    }

    #[test]
    fn missing_record_is_not_found() {
        let now = Utc::now();
        assert_eq!(
            rejected(evaluate(None, &acquire("w1", now), now, TOLERANCE)),
            RejectReason::NotFound
        );
    }
}
