//! Typestate model for participation requests.
//!
//! A request progresses through distinct states, enforced at compile time:
//! only a `Participation<Pending>` can be confirmed or rejected, which is
//! what guards a reconciliation batch against double-processing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::super::event::{EventId, UserId};

/// Unique identifier for a participation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(pub Uuid);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for RequestId {
    fn from(uuid: Uuid) -> Self {
        RequestId(uuid)
    }
}

impl std::ops::Deref for RequestId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Marker trait for valid participation request states.
pub trait ParticipationState: Send + Sync {}

/// A user's request to participate in an event.
///
/// The generic parameter `T` represents the current state of the request,
/// so operations are only available in states where they are legal.
#[derive(Debug, Clone, Serialize)]
pub struct Participation<T: ParticipationState> {
    /// The current state of the request.
    pub state: T,
    /// Identity and references, immutable over the request's lifetime.
    pub data: ParticipationData,
}

/// Immutable participation request data.
///
/// Holds references only; the live event (capacity fields included) is always
/// re-read at the storage boundary, never embedded, to avoid stale-read
/// overbooking.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipationData {
    pub id: RequestId,
    pub event_id: EventId,
    pub requester: UserId,
    /// Submission timestamp.
    pub created: DateTime<Utc>,
}

// ============================================================================
// Request States
// ============================================================================

/// Request is queued for an initiator decision.
#[derive(Debug, Clone, Serialize)]
pub struct Pending;

impl ParticipationState for Pending {}

/// Request holds a participation slot (or the event is unlimited).
#[derive(Debug, Clone, Serialize)]
pub struct Confirmed {
    pub confirmed_at: DateTime<Utc>,
}

impl ParticipationState for Confirmed {}

/// Why a request was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    /// The event ran out of participation slots before this request's turn.
    CapacityReached,
    /// The initiator explicitly rejected the batch.
    OwnerDecision,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::CapacityReached => "capacity_reached",
            RejectionReason::OwnerDecision => "owner_decision",
        }
    }
}

impl std::str::FromStr for RejectionReason {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "capacity_reached" => Ok(RejectionReason::CapacityReached),
            "owner_decision" => Ok(RejectionReason::OwnerDecision),
            _ => Err(format!("Invalid rejection reason: {}", s)),
        }
    }
}

/// Request was rejected (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Rejected {
    pub rejected_at: DateTime<Utc>,
    pub reason: RejectionReason,
}

impl ParticipationState for Rejected {}

/// Request was canceled by its requester (terminal).
#[derive(Debug, Clone, Serialize)]
pub struct Canceled {
    pub canceled_at: DateTime<Utc>,
}

impl ParticipationState for Canceled {}

/// Status enum matching the string values stored in the `status` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParticipationStatus {
    Pending,
    Confirmed,
    Rejected,
    Canceled,
}

impl ParticipationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ParticipationStatus::Pending => "pending",
            ParticipationStatus::Confirmed => "confirmed",
            ParticipationStatus::Rejected => "rejected",
            ParticipationStatus::Canceled => "canceled",
        }
    }
}

impl std::fmt::Display for ParticipationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ParticipationStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ParticipationStatus::Pending),
            "confirmed" => Ok(ParticipationStatus::Confirmed),
            "rejected" => Ok(ParticipationStatus::Rejected),
            "canceled" => Ok(ParticipationStatus::Canceled),
            _ => Err(format!("Invalid participation status: {}", s)),
        }
    }
}

// ============================================================================
// Unified Request Representation
// ============================================================================

/// Enum that can hold a participation request in any state.
///
/// Used by storage and results where requests are handled uniformly
/// regardless of their current state.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", content = "request")]
pub enum AnyParticipation {
    Pending(Participation<Pending>),
    Confirmed(Participation<Confirmed>),
    Rejected(Participation<Rejected>),
    Canceled(Participation<Canceled>),
}

impl AnyParticipation {
    /// Get the request ID regardless of state.
    pub fn id(&self) -> RequestId {
        self.data().id
    }

    /// Get the request data regardless of state.
    pub fn data(&self) -> &ParticipationData {
        match self {
            AnyParticipation::Pending(r) => &r.data,
            AnyParticipation::Confirmed(r) => &r.data,
            AnyParticipation::Rejected(r) => &r.data,
            AnyParticipation::Canceled(r) => &r.data,
        }
    }

    /// Get the status enum of the current state.
    pub fn status(&self) -> ParticipationStatus {
        match self {
            AnyParticipation::Pending(_) => ParticipationStatus::Pending,
            AnyParticipation::Confirmed(_) => ParticipationStatus::Confirmed,
            AnyParticipation::Rejected(_) => ParticipationStatus::Rejected,
            AnyParticipation::Canceled(_) => ParticipationStatus::Canceled,
        }
    }

    /// Check if this request is in the Pending state.
    pub fn is_pending(&self) -> bool {
        matches!(self, AnyParticipation::Pending(_))
    }

    /// A request counts against the uniqueness constraint unless canceled.
    pub fn is_active(&self) -> bool {
        !matches!(self, AnyParticipation::Canceled(_))
    }

    /// Try to take as a Pending request, consuming self.
    pub fn into_pending(self) -> Option<Participation<Pending>> {
        match self {
            AnyParticipation::Pending(r) => Some(r),
            _ => None,
        }
    }
}

// Conversion traits for going from typed Participation to AnyParticipation

impl From<Participation<Pending>> for AnyParticipation {
    fn from(r: Participation<Pending>) -> Self {
        AnyParticipation::Pending(r)
    }
}

impl From<Participation<Confirmed>> for AnyParticipation {
    fn from(r: Participation<Confirmed>) -> Self {
        AnyParticipation::Confirmed(r)
    }
}

impl From<Participation<Rejected>> for AnyParticipation {
    fn from(r: Participation<Rejected>) -> Self {
        AnyParticipation::Rejected(r)
    }
}

impl From<Participation<Canceled>> for AnyParticipation {
    fn from(r: Participation<Canceled>) -> Self {
        AnyParticipation::Canceled(r)
    }
}
