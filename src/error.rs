//! Error types for the admission control subsystem.

use thiserror::Error;

use crate::domain::event::{EventId, EventStatus, UserId};
use crate::domain::request::state::RequestId;

/// Result type alias using the guestlist error type.
pub type Result<T> = std::result::Result<T, GuestlistError>;

/// Main error type for the admission control subsystem.
#[derive(Error, Debug)]
pub enum GuestlistError {
    /// Event not found
    #[error("Event not found: {0}")]
    EventNotFound(EventId),

    /// Participation request not found
    #[error("Participation request not found: {0}")]
    RequestNotFound(RequestId),

    /// User not found
    #[error("User not found: {0}")]
    UserNotFound(UserId),

    /// An active request already exists for this requester and event
    #[error("Duplicate participation request from user {requester} for event {event}")]
    DuplicateRequest { requester: UserId, event: EventId },

    /// The event has no remaining participation slots
    #[error("Participant limit reached for event {0}")]
    CapacityReached(EventId),

    /// Caller is not the initiator of the event
    #[error("User {user} is not the initiator of event {event}")]
    NotOwner { user: UserId, event: EventId },

    /// An event initiator may not request participation in their own event
    #[error("Initiator may not request participation in their own event {0}")]
    SelfRequestForbidden(EventId),

    /// Requests can only target published events
    #[error("Event {0} is not published")]
    EventNotPublished(EventId),

    /// Requested event status edge is not in the transition table
    #[error("Illegal event transition for {event}: {from} -> {to}")]
    IllegalTransition {
        event: EventId,
        from: EventStatus,
        to: EventStatus,
    },

    /// Request is in an invalid state for the requested operation
    #[error("Invalid state transition: request {0} is in state '{1}', expected '{2}'")]
    InvalidRequestState(RequestId, String, String),

    /// Transient storage contention (lock wait timeout, serialization failure).
    /// Retried once internally; safe for the caller to retry the whole operation.
    #[error("Storage contention: {0}")]
    Contention(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// General error from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Coarse classification used by outer layers (HTTP adapters, retry loops)
/// to decide how an error propagates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 404-equivalent; never retried.
    NotFound,
    /// 409-equivalent; the caller may retry with different input.
    Conflict,
    /// 403-equivalent.
    Forbidden,
    /// 503-equivalent; safe to retry the whole operation unchanged.
    Transient,
    /// 500-equivalent.
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Transient => "transient",
            ErrorKind::Internal => "internal",
        }
    }
}

impl GuestlistError {
    /// Classify this error per the propagation taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GuestlistError::EventNotFound(_)
            | GuestlistError::RequestNotFound(_)
            | GuestlistError::UserNotFound(_) => ErrorKind::NotFound,
            GuestlistError::DuplicateRequest { .. }
            | GuestlistError::CapacityReached(_)
            | GuestlistError::EventNotPublished(_)
            | GuestlistError::IllegalTransition { .. }
            | GuestlistError::InvalidRequestState(..) => ErrorKind::Conflict,
            GuestlistError::NotOwner { .. } | GuestlistError::SelfRequestForbidden(_) => {
                ErrorKind::Forbidden
            }
            GuestlistError::Contention(_) => ErrorKind::Transient,
            GuestlistError::Serialization(_) | GuestlistError::Other(_) => ErrorKind::Internal,
        }
    }

    /// Whether the operation may be retried unchanged (used by the internal
    /// retry-once policy in the service layer).
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn classification_matches_taxonomy() {
        let event = EventId(Uuid::new_v4());
        let user = UserId(Uuid::new_v4());

        assert_eq!(
            GuestlistError::EventNotFound(event).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            GuestlistError::CapacityReached(event).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            GuestlistError::NotOwner { user, event }.kind(),
            ErrorKind::Forbidden
        );
        assert_eq!(
            GuestlistError::Contention("lock timeout".into()).kind(),
            ErrorKind::Transient
        );
        assert!(GuestlistError::Contention("lock timeout".into()).is_transient());
        assert!(!GuestlistError::CapacityReached(event).is_transient());
    }
}
