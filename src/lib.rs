//! Guestlist: participation admission control for capacity-limited events.
//!
//! An event goes through a small administrative lifecycle (pending,
//! published, canceled) and, once published, accepts participation requests.
//! Each request moves through its own state machine:
//!
//! ```text
//!                  +-----------+
//!        +-------->| CONFIRMED |------+
//!        |         +-----------+      |
//!   +---------+                       v
//!   | PENDING |                 +----------+
//!   +---------+---------------->| CANCELED |
//!        |                      +----------+
//!        |         +----------+
//!        +-------->| REJECTED |
//!                  +----------+
//! ```
//!
//! Admission is capacity-aware: an event may carry a participant limit and a
//! moderation flag, and every path that confirms a request checks and bumps
//! the confirmed count atomically inside a per-event critical section, so the
//! limit holds under concurrency. The event initiator resolves the pending
//! queue in ordered batches; with N slots left, the first N requests in the
//! batch win and the rest are rejected.
//!
//! # Architecture
//!
//! - [`domain`]: events, users, and the typestate participation request.
//!   Transitions are methods that only exist on the states they are legal
//!   from; [`AnyParticipation`] is the type-erased form storage hands back.
//! - [`policy`] / [`reconcile`]: the pure admission and batching decisions.
//!   Backends evaluate them against snapshots taken under the event's lock.
//! - [`store`]: the [`Storage`] trait with a PostgreSQL implementation
//!   (row locks, guarded updates) and an in-memory one for tests.
//! - [`service`]: [`Admissions`], the exposed surface; retries transient
//!   contention once and decorates the public read path with view counts.
//! - [`stats`]: client for the external visit-statistics collector.
//!
//! # Example
//!
//! ```ignore
//! use guestlist::{Admissions, InMemoryStore, MockStatsClient, NewEvent};
//!
//! let service = Admissions::new(InMemoryStore::new(), MockStatsClient::new());
//! let owner = service.create_user("owner".to_string()).await?;
//! let guest = service.create_user("guest".to_string()).await?;
//!
//! let event = service.create_event(NewEvent {
//!     initiator: owner.id,
//!     title: "rustconf afterparty".to_string(),
//!     event_date: chrono::Utc::now() + chrono::Duration::days(7),
//!     participant_limit: 100,
//!     request_moderation: false,
//! }).await?;
//! service.publish_event(owner.id, event.id).await?;
//!
//! // No moderation: the request comes back already confirmed.
//! let request = service.submit_request(guest.id, event.id).await?;
//! assert!(request.is_active());
//! ```

pub mod domain;
pub mod error;
pub mod policy;
pub mod reconcile;
pub mod service;
pub mod stats;
pub mod store;

pub use domain::event::{Event, EventId, EventStatus, NewEvent, UserId};
pub use domain::request::state::{
    AnyParticipation, Participation, ParticipationStatus, RejectionReason, RequestId,
};
pub use domain::user::User;
pub use error::{ErrorKind, GuestlistError, Result};
pub use reconcile::{Disposition, ReconcilePlan, ReconcileResult};
pub use service::{Admissions, EventView};
pub use stats::{HttpStatsClient, MockStatsClient, StatsClient, Visit, ViewRange};
pub use store::Storage;
pub use store::memory::InMemoryStore;
#[cfg(feature = "postgres")]
pub use store::postgres::PostgresStore;

/// Get the migrator for the crate's schema.
///
/// # Example
/// ```ignore
/// let pool = sqlx::PgPool::connect(&url).await?;
/// guestlist::migrator().run(&pool).await?;
/// ```
#[cfg(feature = "postgres")]
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}
