//! State transitions for participation requests.
//!
//! Transitions return different types, so the compiler rules out illegal
//! edges; the storage layer additionally guards each persisted transition on
//! the expected current state, which catches concurrent double-processing.
//!
//! ```text
//! Participation<Pending> ──confirm()──> Participation<Confirmed>
//!       │                                       │
//!       ├──reject(reason)──> Participation<Rejected>
//!       │                                       │
//!       └──cancel()──> Participation<Canceled> <┘
//! ```
//!
//! Rejected and Canceled are terminal. A requester may cancel a Confirmed
//! request at any time; doing so does not release the participation slot -
//! slots are only reassigned through an explicit reconciliation.

use chrono::Utc;

use super::state::{Canceled, Confirmed, Participation, Pending, Rejected, RejectionReason};
use crate::error::Result;
use crate::store::Storage;

impl Participation<Pending> {
    /// Confirm this request, giving it a participation slot.
    ///
    /// The caller is responsible for running this inside the event's critical
    /// section together with the confirmed-count increment.
    pub async fn confirm<S: Storage + ?Sized>(self, storage: &S) -> Result<Participation<Confirmed>> {
        let request = Participation {
            data: self.data,
            state: Confirmed {
                confirmed_at: Utc::now(),
            },
        };
        storage.persist(&request).await?;
        Ok(request)
    }

    /// Reject this request with the given reason.
    pub async fn reject<S: Storage + ?Sized>(
        self,
        reason: RejectionReason,
        storage: &S,
    ) -> Result<Participation<Rejected>> {
        let request = Participation {
            data: self.data,
            state: Rejected {
                rejected_at: Utc::now(),
                reason,
            },
        };
        storage.persist(&request).await?;
        Ok(request)
    }

    pub async fn cancel<S: Storage + ?Sized>(self, storage: &S) -> Result<Participation<Canceled>> {
        let request = Participation {
            data: self.data,
            state: Canceled {
                canceled_at: Utc::now(),
            },
        };
        storage.persist(&request).await?;
        Ok(request)
    }
}

impl Participation<Confirmed> {
    /// Cancel a confirmed request. The event's confirmed count is left
    /// untouched: no implicit promotion of pending requests.
    pub async fn cancel<S: Storage + ?Sized>(self, storage: &S) -> Result<Participation<Canceled>> {
        tracing::debug!(
            request_id = %self.data.id,
            event_id = %self.data.event_id,
            "Canceling confirmed request; slot is not released"
        );
        let request = Participation {
            data: self.data,
            state: Canceled {
                canceled_at: Utc::now(),
            },
        };
        storage.persist(&request).await?;
        Ok(request)
    }
}
