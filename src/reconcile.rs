//! Bulk reconciliation - an initiator's batch decision over pending requests.
//!
//! Planning is pure: given a consistent snapshot of the event and the
//! targeted requests, [`plan`] produces the exact partition into confirmed
//! and rejected identifiers. Storage backends take the snapshot inside the
//! event's critical section (row lock or per-event mutex), apply the plan
//! there, and commit atomically, so the running confirmed count used while
//! planning is exactly what gets persisted.
//!
//! Ordering contract: requests are processed in caller-supplied order. With
//! N slots remaining, the first N pending requests in the batch win and the
//! remainder is rejected with `CapacityReached`. Identical input yields an
//! identical partition.

use crate::domain::event::{Event, UserId};
use crate::domain::request::state::{
    AnyParticipation, ParticipationStatus, RejectionReason, RequestId,
};
use crate::error::{GuestlistError, Result};

/// Target disposition for a reconciliation batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Confirmed,
    Rejected,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Confirmed => "confirmed",
            Disposition::Rejected => "rejected",
        }
    }
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The partition a reconciliation batch resolves to.
///
/// `confirm` and `reject` preserve caller order and together cover every
/// input identifier exactly once. All rejected items in one batch share a
/// single reason: `OwnerDecision` for a reject batch, `CapacityReached` for
/// the overflow of a confirm batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub confirm: Vec<RequestId>,
    pub reject: Vec<RequestId>,
    pub reject_reason: RejectionReason,
}

/// Outcome of an applied reconciliation, in caller order.
#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub confirmed: Vec<AnyParticipation>,
    pub rejected: Vec<AnyParticipation>,
}

/// Compute the partition for a reconciliation batch.
///
/// `batch` is the targeted requests with their live statuses, in
/// caller-supplied order, read under the same critical section that will
/// apply the plan.
///
/// # Errors
/// - `NotOwner` if `caller` is not the event initiator.
/// - `InvalidRequestState` if any targeted request is not pending, or the
///   same identifier appears twice. The whole batch fails; nothing may be
///   applied.
pub fn plan(
    event: &Event,
    caller: UserId,
    batch: &[(RequestId, ParticipationStatus)],
    disposition: Disposition,
) -> Result<ReconcilePlan> {
    if event.initiator != caller {
        return Err(GuestlistError::NotOwner {
            user: caller,
            event: event.id,
        });
    }

    // Strict all-pending-or-fail: a request that was already decided (or
    // canceled by its requester) poisons the whole batch. Duplicated ids
    // would double-apply a transition, so they fail the same way.
    let mut seen = std::collections::HashSet::with_capacity(batch.len());
    for (id, status) in batch {
        if *status != ParticipationStatus::Pending {
            return Err(GuestlistError::InvalidRequestState(
                *id,
                status.to_string(),
                ParticipationStatus::Pending.to_string(),
            ));
        }
        if !seen.insert(*id) {
            return Err(GuestlistError::InvalidRequestState(
                *id,
                "duplicated in batch".to_string(),
                ParticipationStatus::Pending.to_string(),
            ));
        }
    }

    match disposition {
        Disposition::Rejected => Ok(ReconcilePlan {
            confirm: Vec::new(),
            reject: batch.iter().map(|(id, _)| *id).collect(),
            reject_reason: RejectionReason::OwnerDecision,
        }),
        Disposition::Confirmed => {
            let mut confirm = Vec::new();
            let mut reject = Vec::new();
            // Running count, consistent with what the backend will persist.
            let mut confirmed = event.confirmed_requests;
            for (id, _) in batch {
                if event.participant_limit == 0 || confirmed < event.participant_limit {
                    confirm.push(*id);
                    confirmed += 1;
                } else {
                    // This and every later item lost the race for slots.
                    reject.push(*id);
                }
            }
            Ok(ReconcilePlan {
                confirm,
                reject,
                reject_reason: RejectionReason::CapacityReached,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::{EventId, EventStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn event(limit: u32, confirmed: u32) -> Event {
        Event {
            id: EventId(Uuid::new_v4()),
            initiator: UserId(Uuid::new_v4()),
            title: "meetup".to_string(),
            event_date: Utc::now(),
            created_on: Utc::now(),
            published_on: Some(Utc::now()),
            status: EventStatus::Published,
            participant_limit: limit,
            request_moderation: true,
            confirmed_requests: confirmed,
        }
    }

    fn pending_batch(n: usize) -> Vec<(RequestId, ParticipationStatus)> {
        (0..n)
            .map(|_| (RequestId(Uuid::new_v4()), ParticipationStatus::Pending))
            .collect()
    }

    #[test]
    fn caller_must_be_initiator() {
        let e = event(5, 0);
        let err = plan(
            &e,
            UserId(Uuid::new_v4()),
            &pending_batch(1),
            Disposition::Confirmed,
        )
        .unwrap_err();
        assert!(matches!(err, GuestlistError::NotOwner { .. }));
    }

    #[test]
    fn first_requests_win_remainder_rejected() {
        let e = event(2, 0);
        let batch = pending_batch(5);
        let plan = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap();
        assert_eq!(plan.confirm, vec![batch[0].0, batch[1].0]);
        assert_eq!(plan.reject, vec![batch[2].0, batch[3].0, batch[4].0]);
        assert_eq!(plan.reject_reason, RejectionReason::CapacityReached);
    }

    #[test]
    fn plan_is_deterministic() {
        let e = event(3, 1);
        let batch = pending_batch(6);
        let first = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap();
        let second = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.confirm.len(), 2);
    }

    #[test]
    fn already_full_event_rejects_everything() {
        let e = event(2, 2);
        let batch = pending_batch(3);
        let plan = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap();
        assert!(plan.confirm.is_empty());
        assert_eq!(plan.reject.len(), 3);
        assert_eq!(plan.reject_reason, RejectionReason::CapacityReached);
    }

    #[test]
    fn unlimited_event_confirms_everything() {
        let e = event(0, 0);
        let batch = pending_batch(4);
        let plan = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap();
        assert_eq!(plan.confirm.len(), 4);
        assert!(plan.reject.is_empty());
    }

    #[test]
    fn reject_batch_skips_capacity_check() {
        // Even a full event can reject its queue.
        let e = event(1, 1);
        let batch = pending_batch(3);
        let plan = plan(&e, e.initiator, &batch, Disposition::Rejected).unwrap();
        assert!(plan.confirm.is_empty());
        assert_eq!(plan.reject.len(), 3);
        assert_eq!(plan.reject_reason, RejectionReason::OwnerDecision);
    }

    #[test]
    fn non_pending_item_fails_the_batch() {
        let e = event(5, 0);
        let mut batch = pending_batch(3);
        batch[1].1 = ParticipationStatus::Rejected;
        for disposition in [Disposition::Confirmed, Disposition::Rejected] {
            let err = plan(&e, e.initiator, &batch, disposition).unwrap_err();
            match err {
                GuestlistError::InvalidRequestState(id, actual, expected) => {
                    assert_eq!(id, batch[1].0);
                    assert_eq!(actual, "rejected");
                    assert_eq!(expected, "pending");
                }
                other => panic!("unexpected error: {other}"),
            }
        }
    }

    #[test]
    fn duplicate_id_fails_the_batch() {
        let e = event(5, 0);
        let mut batch = pending_batch(2);
        batch.push(batch[0]);
        let err = plan(&e, e.initiator, &batch, Disposition::Confirmed).unwrap_err();
        assert!(matches!(err, GuestlistError::InvalidRequestState(..)));
    }

    #[test]
    fn empty_batch_yields_empty_plan() {
        let e = event(2, 0);
        let plan = plan(&e, e.initiator, &[], Disposition::Confirmed).unwrap();
        assert!(plan.confirm.is_empty());
        assert!(plan.reject.is_empty());
    }
}
