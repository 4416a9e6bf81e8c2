//! Admission policy - the pure decision at the heart of request submission.
//!
//! Given an event's moderation flag, capacity and live confirmed count, the
//! policy decides whether a new request is auto-confirmed, queued for the
//! initiator, or denied outright. It is a pure function: the caller must
//! evaluate it against a snapshot taken inside the event's critical section
//! and apply the outcome in the same transaction.

use crate::domain::event::{Event, EventStatus, UserId};
use crate::error::GuestlistError;

/// Positive admission outcome for a new request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Create the request already Confirmed. The caller must bump the
    /// event's confirmed count in the same transaction when the event
    /// tracks one (`participant_limit != 0`).
    AutoConfirm,
    /// Create the request Pending; it waits for a reconciliation.
    Queue,
}

/// Denial of a new request. Maps one-to-one onto client-visible errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Denial {
    /// The requester is the event initiator.
    SelfRequest,
    /// The event has not been published (or was canceled).
    NotPublished,
    /// All participation slots are taken.
    CapacityReached,
}

impl Denial {
    /// Lift this denial into the crate error for the given event.
    pub fn into_error(self, event: &Event) -> GuestlistError {
        match self {
            Denial::SelfRequest => GuestlistError::SelfRequestForbidden(event.id),
            Denial::NotPublished => GuestlistError::EventNotPublished(event.id),
            Denial::CapacityReached => GuestlistError::CapacityReached(event.id),
        }
    }
}

/// Decide how a new participation request from `requester` is admitted.
///
/// Rules, in order:
/// 1. the initiator may not request participation in their own event;
/// 2. only published events accept requests;
/// 3. a full event denies immediately;
/// 4. no moderation, or an unlimited event, confirms automatically;
/// 5. otherwise the request queues as pending.
pub fn decide(event: &Event, requester: UserId) -> Result<Decision, Denial> {
    if event.initiator == requester {
        return Err(Denial::SelfRequest);
    }
    if event.status != EventStatus::Published {
        return Err(Denial::NotPublished);
    }
    if event.is_full() {
        return Err(Denial::CapacityReached);
    }
    if !event.request_moderation || event.is_unlimited() {
        Ok(Decision::AutoConfirm)
    } else {
        Ok(Decision::Queue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::event::EventId;
    use chrono::Utc;
    use uuid::Uuid;

    fn event(status: EventStatus, moderation: bool, limit: u32, confirmed: u32) -> Event {
        Event {
            id: EventId(Uuid::new_v4()),
            initiator: UserId(Uuid::new_v4()),
            title: "meetup".to_string(),
            event_date: Utc::now(),
            created_on: Utc::now(),
            published_on: None,
            status,
            participant_limit: limit,
            request_moderation: moderation,
            confirmed_requests: confirmed,
        }
    }

    fn stranger() -> UserId {
        UserId(Uuid::new_v4())
    }

    #[test]
    fn initiator_is_always_denied() {
        // Even on a full, unpublished event the self-request denial wins.
        let e = event(EventStatus::Pending, true, 1, 1);
        assert_eq!(decide(&e, e.initiator), Err(Denial::SelfRequest));

        let e = event(EventStatus::Published, false, 0, 0);
        assert_eq!(decide(&e, e.initiator), Err(Denial::SelfRequest));
    }

    #[test]
    fn unpublished_event_denies() {
        for status in [EventStatus::Pending, EventStatus::Canceled] {
            let e = event(status, false, 0, 0);
            assert_eq!(decide(&e, stranger()), Err(Denial::NotPublished));
        }
    }

    #[test]
    fn full_event_denies() {
        let e = event(EventStatus::Published, true, 3, 3);
        assert_eq!(decide(&e, stranger()), Err(Denial::CapacityReached));

        // An over-moderated event with free slots does not.
        let e = event(EventStatus::Published, true, 3, 2);
        assert_eq!(decide(&e, stranger()), Ok(Decision::Queue));
    }

    #[test]
    fn no_moderation_auto_confirms() {
        let e = event(EventStatus::Published, false, 10, 5);
        assert_eq!(decide(&e, stranger()), Ok(Decision::AutoConfirm));
    }

    #[test]
    fn unlimited_event_auto_confirms_despite_moderation() {
        let e = event(EventStatus::Published, true, 0, 0);
        assert_eq!(decide(&e, stranger()), Ok(Decision::AutoConfirm));
    }

    #[test]
    fn moderated_limited_event_queues() {
        let e = event(EventStatus::Published, true, 10, 0);
        assert_eq!(decide(&e, stranger()), Ok(Decision::Queue));
    }
}
