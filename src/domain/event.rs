//! Event aggregate and its status state machine.
//!
//! An event owns the two capacity fields that the whole subsystem revolves
//! around: `participant_limit` (0 = unlimited) and `confirmed_requests`.
//! The invariant `participant_limit == 0 || confirmed_requests <=
//! participant_limit` must hold at every observable point; every
//! check-then-increment on these fields runs inside the storage layer's
//! per-event critical section.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{GuestlistError, Result};

/// Unique identifier for an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Display only first 8 characters for readability in logs
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for EventId {
    fn from(uuid: Uuid) -> Self {
        EventId(uuid)
    }
}

impl std::ops::Deref for EventId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Unique identifier for a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub Uuid);

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl From<Uuid> for UserId {
    fn from(uuid: Uuid) -> Self {
        UserId(uuid)
    }
}

impl std::ops::Deref for UserId {
    type Target = Uuid;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

/// Moderation status of an event.
///
/// ```text
/// Pending ──publish──> Published
///    │
///    └────cancel─────> Canceled
/// ```
///
/// Published and Canceled are terminal for this state machine; content
/// edits after publication are outside admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Published,
    Canceled,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Published => "published",
            EventStatus::Canceled => "canceled",
        }
    }

    /// Exhaustive transition table. Only a pending event may be decided on.
    pub fn can_transition(self, to: EventStatus) -> bool {
        matches!(
            (self, to),
            (EventStatus::Pending, EventStatus::Published)
                | (EventStatus::Pending, EventStatus::Canceled)
        )
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "published" => Ok(EventStatus::Published),
            "canceled" => Ok(EventStatus::Canceled),
            _ => Err(format!("Invalid event status: {}", s)),
        }
    }
}

/// A public event with a bounded number of participation slots.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub id: EventId,
    /// The user that created the event ("owner" in admission decisions).
    pub initiator: UserId,
    pub title: String,
    pub event_date: DateTime<Utc>,
    pub created_on: DateTime<Utc>,
    pub published_on: Option<DateTime<Utc>>,
    pub status: EventStatus,
    /// Maximum confirmed requests. 0 means unlimited.
    pub participant_limit: u32,
    /// When true, confirmation requires an explicit initiator decision.
    pub request_moderation: bool,
    pub confirmed_requests: u32,
}

impl Event {
    /// An event with `participant_limit == 0` accepts any number of
    /// participants and does not track a confirmed count.
    pub fn is_unlimited(&self) -> bool {
        self.participant_limit == 0
    }

    /// True when no participation slot remains.
    pub fn is_full(&self) -> bool {
        !self.is_unlimited() && self.confirmed_requests >= self.participant_limit
    }

    /// Remaining slots, or `None` for an unlimited event.
    pub fn remaining_slots(&self) -> Option<u32> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.participant_limit.saturating_sub(self.confirmed_requests))
        }
    }

    /// Validate a status edge against the transition table.
    pub fn check_transition(&self, to: EventStatus) -> Result<()> {
        if self.status.can_transition(to) {
            Ok(())
        } else {
            Err(GuestlistError::IllegalTransition {
                event: self.id,
                from: self.status,
                to,
            })
        }
    }
}

/// Input for creating an event. Created events start in `Pending`.
#[derive(Debug, Clone, Deserialize)]
pub struct NewEvent {
    pub initiator: UserId,
    pub title: String,
    pub event_date: DateTime<Utc>,
    pub participant_limit: u32,
    pub request_moderation: bool,
}
