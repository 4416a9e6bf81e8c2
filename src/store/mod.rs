//! Storage trait for persisting events and participation requests.
//!
//! The trait exposes the admission-critical operations as single atomic
//! units: every implementation must run `submit_request`, `reconcile` and
//! `cancel_request` inside a per-event critical section (a row lock held for
//! the duration of the check-and-increment in Postgres, an async mutex in
//! memory), so that two concurrent admissions cannot both observe "one slot
//! left" and both confirm.
//!
//! Lock waits are bounded; exceeding the bound surfaces as the transient
//! `Contention` error rather than a hang.

use async_trait::async_trait;

use crate::domain::event::{Event, EventId, EventStatus, NewEvent, UserId};
use crate::domain::request::state::{
    AnyParticipation, Participation, ParticipationState, RequestId,
};
use crate::domain::user::User;
use crate::error::Result;
use crate::reconcile::{Disposition, ReconcileResult};

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

/// Storage abstraction over events, users and participation requests.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Register a user. The user store proper is an external collaborator;
    /// this subsystem only needs existence.
    async fn create_user(&self, name: String) -> Result<User>;

    /// Existence lookup by identifier.
    async fn user_exists(&self, id: UserId) -> Result<bool>;

    /// Create an event in the Pending status with a zero confirmed count.
    ///
    /// # Errors
    /// `UserNotFound` if the initiator does not exist.
    async fn create_event(&self, input: NewEvent) -> Result<Event>;

    /// Get an event by ID.
    async fn get_event(&self, id: EventId) -> Result<Event>;

    /// Apply an administrative status decision to an event.
    ///
    /// The edge is validated against the transition table under the event's
    /// critical section; publishing records `published_on`.
    ///
    /// # Errors
    /// `IllegalTransition` for any edge other than Pending -> Published and
    /// Pending -> Canceled (a concurrent admin decision loses the same way).
    async fn update_event_status(&self, id: EventId, to: EventStatus) -> Result<Event>;

    /// Submit a participation request, applying the admission policy.
    ///
    /// Runs entirely inside the event's critical section: policy evaluation,
    /// request creation and (for auto-confirmation against a limited event)
    /// the confirmed-count increment commit together or not at all.
    ///
    /// # Errors
    /// `SelfRequestForbidden`, `EventNotPublished`, `CapacityReached`,
    /// `DuplicateRequest`, `EventNotFound`, `UserNotFound`.
    async fn submit_request(&self, requester: UserId, event: EventId) -> Result<AnyParticipation>;

    /// Apply an initiator's batch decision over pending requests.
    ///
    /// Requests are processed in the order of `ids` against the live
    /// confirmed count (see [`crate::reconcile::plan`]); the partition is
    /// applied all-or-nothing.
    async fn reconcile(
        &self,
        caller: UserId,
        event: EventId,
        ids: &[RequestId],
        disposition: Disposition,
    ) -> Result<ReconcileResult>;

    /// Cancel a request on behalf of its requester.
    ///
    /// Allowed from Pending and Confirmed; canceling a confirmed request
    /// does not release its slot.
    ///
    /// # Errors
    /// `RequestNotFound` if the request does not exist or does not belong to
    /// `requester`; `InvalidRequestState` from a terminal state.
    async fn cancel_request(&self, requester: UserId, id: RequestId) -> Result<AnyParticipation>;

    /// Get a participation request by ID.
    async fn get_request(&self, id: RequestId) -> Result<AnyParticipation>;

    /// All requests submitted by a user, oldest first.
    async fn requests_for_user(&self, user: UserId) -> Result<Vec<AnyParticipation>>;

    /// All requests targeting an event, oldest first.
    async fn requests_for_event(&self, event: EventId) -> Result<Vec<AnyParticipation>>;

    /// Persist a typed state transition.
    ///
    /// Implementations guard the write on the expected prior state (only a
    /// pending row may become confirmed or rejected; only a pending or
    /// confirmed row may become canceled) and report a guard miss as
    /// `InvalidRequestState`.
    async fn persist<T: ParticipationState + Clone>(&self, request: &Participation<T>) -> Result<()>
    where
        AnyParticipation: From<Participation<T>>;
}
