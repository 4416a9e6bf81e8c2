//! In-memory implementation of the Storage trait.
//!
//! Used by the test suite and by embedded deployments that do not need
//! durability. Admission-critical operations serialize on a per-event
//! `tokio` mutex, mirroring the row lock the Postgres implementation takes,
//! with a bounded wait that surfaces as `Contention`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use uuid::Uuid;

use super::Storage;
use crate::domain::event::{Event, EventId, EventStatus, NewEvent, UserId};
use crate::domain::request::state::{
    AnyParticipation, Participation, ParticipationData, ParticipationState, ParticipationStatus,
    Pending, RequestId,
};
use crate::domain::user::User;
use crate::error::{GuestlistError, Result};
use crate::policy::{self, Decision};
use crate::reconcile::{self, Disposition, ReconcileResult};

/// Default bound on waiting for an event's critical section.
const DEFAULT_LOCK_WAIT: Duration = Duration::from_secs(5);

/// In-memory store with per-event admission locks.
pub struct InMemoryStore {
    users: Mutex<HashMap<UserId, User>>,
    events: Mutex<HashMap<EventId, Event>>,
    requests: Mutex<HashMap<RequestId, AnyParticipation>>,
    // TODO: locks for deleted events are never evicted; add cleanup if event
    // deletion becomes part of this store's surface.
    event_locks: Mutex<HashMap<EventId, Arc<AsyncMutex<()>>>>,
    lock_wait: Duration,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            event_locks: Mutex::new(HashMap::new()),
            lock_wait: DEFAULT_LOCK_WAIT,
        }
    }

    /// Set the bound on lock waits. Builder method chained after `new()`.
    pub fn with_lock_wait(mut self, lock_wait: Duration) -> Self {
        self.lock_wait = lock_wait;
        self
    }

    /// Enter the event's critical section, waiting at most `lock_wait`.
    async fn lock_event(&self, id: EventId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self.event_locks.lock();
            Arc::clone(locks.entry(id).or_default())
        };
        tokio::time::timeout(self.lock_wait, lock.lock_owned())
            .await
            .map_err(|_| {
                GuestlistError::Contention(format!("timed out waiting for event {id} lock"))
            })
    }

    fn event_snapshot(&self, id: EventId) -> Result<Event> {
        self.events
            .lock()
            .get(&id)
            .cloned()
            .ok_or(GuestlistError::EventNotFound(id))
    }

    fn has_active_request(&self, requester: UserId, event: EventId) -> bool {
        self.requests.lock().values().any(|r| {
            r.data().requester == requester && r.data().event_id == event && r.is_active()
        })
    }

    /// Bump the confirmed count by `delta`, holding the capacity invariant.
    /// Callers must be inside the event's critical section.
    fn increment_confirmed(&self, id: EventId, delta: u32) -> Result<()> {
        let mut events = self.events.lock();
        let event = events
            .get_mut(&id)
            .ok_or(GuestlistError::EventNotFound(id))?;
        if event.participant_limit == 0 {
            // Unlimited events do not track a count.
            return Ok(());
        }
        let next = event.confirmed_requests + delta;
        if next > event.participant_limit {
            return Err(GuestlistError::CapacityReached(id));
        }
        event.confirmed_requests = next;
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStore {
    async fn create_user(&self, name: String) -> Result<User> {
        let user = User {
            id: UserId(Uuid::new_v4()),
            name,
            created_on: Utc::now(),
        };
        self.users.lock().insert(user.id, user.clone());
        Ok(user)
    }

    async fn user_exists(&self, id: UserId) -> Result<bool> {
        Ok(self.users.lock().contains_key(&id))
    }

    async fn create_event(&self, input: NewEvent) -> Result<Event> {
        if !self.user_exists(input.initiator).await? {
            return Err(GuestlistError::UserNotFound(input.initiator));
        }
        let event = Event {
            id: EventId(Uuid::new_v4()),
            initiator: input.initiator,
            title: input.title,
            event_date: input.event_date,
            created_on: Utc::now(),
            published_on: None,
            status: EventStatus::Pending,
            participant_limit: input.participant_limit,
            request_moderation: input.request_moderation,
            confirmed_requests: 0,
        };
        self.events.lock().insert(event.id, event.clone());
        Ok(event)
    }

    async fn get_event(&self, id: EventId) -> Result<Event> {
        self.event_snapshot(id)
    }

    async fn update_event_status(&self, id: EventId, to: EventStatus) -> Result<Event> {
        let _guard = self.lock_event(id).await?;
        let mut events = self.events.lock();
        let event = events
            .get_mut(&id)
            .ok_or(GuestlistError::EventNotFound(id))?;
        event.check_transition(to)?;
        event.status = to;
        if to == EventStatus::Published {
            event.published_on = Some(Utc::now());
        }
        Ok(event.clone())
    }

    async fn submit_request(&self, requester: UserId, event: EventId) -> Result<AnyParticipation> {
        if !self.user_exists(requester).await? {
            return Err(GuestlistError::UserNotFound(requester));
        }

        let _guard = self.lock_event(event).await?;
        let snapshot = self.event_snapshot(event)?;

        if self.has_active_request(requester, event) {
            return Err(GuestlistError::DuplicateRequest { requester, event });
        }

        let decision = policy::decide(&snapshot, requester)
            .map_err(|denial| denial.into_error(&snapshot))?;

        let data = ParticipationData {
            id: RequestId(Uuid::new_v4()),
            event_id: event,
            requester,
            created: Utc::now(),
        };

        let created: AnyParticipation = match decision {
            Decision::AutoConfirm => {
                self.increment_confirmed(event, 1)?;
                AnyParticipation::Confirmed(Participation {
                    data,
                    state: crate::domain::request::state::Confirmed {
                        confirmed_at: Utc::now(),
                    },
                })
            }
            Decision::Queue => AnyParticipation::Pending(Participation {
                data,
                state: Pending,
            }),
        };

        self.requests.lock().insert(created.id(), created.clone());
        Ok(created)
    }

    async fn reconcile(
        &self,
        caller: UserId,
        event: EventId,
        ids: &[RequestId],
        disposition: Disposition,
    ) -> Result<ReconcileResult> {
        let _guard = self.lock_event(event).await?;
        let snapshot = self.event_snapshot(event)?;

        // Load the batch in caller order with live statuses.
        let batch: Vec<(RequestId, ParticipationStatus)> = {
            let requests = self.requests.lock();
            ids.iter()
                .map(|id| {
                    requests
                        .get(id)
                        .filter(|r| r.data().event_id == event)
                        .map(|r| (*id, r.status()))
                        .ok_or(GuestlistError::RequestNotFound(*id))
                })
                .collect::<Result<_>>()?
        };

        let plan = reconcile::plan(&snapshot, caller, &batch, disposition)?;

        // Apply under the event lock. Every id was verified pending above and
        // cancellation also serializes on the event lock, so the typed
        // transitions below cannot miss their guards.
        let mut confirmed = Vec::with_capacity(plan.confirm.len());
        for id in &plan.confirm {
            let pending = self
                .requests
                .lock()
                .get(id)
                .cloned()
                .and_then(AnyParticipation::into_pending)
                .ok_or_else(|| {
                    GuestlistError::InvalidRequestState(
                        *id,
                        "unknown".to_string(),
                        ParticipationStatus::Pending.to_string(),
                    )
                })?;
            confirmed.push(AnyParticipation::from(pending.confirm(self).await?));
        }
        if !plan.confirm.is_empty() {
            self.increment_confirmed(event, plan.confirm.len() as u32)?;
        }

        let mut rejected = Vec::with_capacity(plan.reject.len());
        for id in &plan.reject {
            let pending = self
                .requests
                .lock()
                .get(id)
                .cloned()
                .and_then(AnyParticipation::into_pending)
                .ok_or_else(|| {
                    GuestlistError::InvalidRequestState(
                        *id,
                        "unknown".to_string(),
                        ParticipationStatus::Pending.to_string(),
                    )
                })?;
            rejected.push(AnyParticipation::from(
                pending.reject(plan.reject_reason, self).await?,
            ));
        }

        Ok(ReconcileResult {
            confirmed,
            rejected,
        })
    }

    async fn cancel_request(&self, requester: UserId, id: RequestId) -> Result<AnyParticipation> {
        // Resolve the event first; the authoritative state read happens
        // again under the event lock.
        let event_id = {
            let requests = self.requests.lock();
            let request = requests
                .get(&id)
                .filter(|r| r.data().requester == requester)
                .ok_or(GuestlistError::RequestNotFound(id))?;
            request.data().event_id
        };

        let _guard = self.lock_event(event_id).await?;
        let current = self
            .requests
            .lock()
            .get(&id)
            .cloned()
            .ok_or(GuestlistError::RequestNotFound(id))?;

        match current {
            AnyParticipation::Pending(r) => Ok(AnyParticipation::from(r.cancel(self).await?)),
            AnyParticipation::Confirmed(r) => Ok(AnyParticipation::from(r.cancel(self).await?)),
            other => Err(GuestlistError::InvalidRequestState(
                id,
                other.status().to_string(),
                "pending or confirmed".to_string(),
            )),
        }
    }

    async fn get_request(&self, id: RequestId) -> Result<AnyParticipation> {
        self.requests
            .lock()
            .get(&id)
            .cloned()
            .ok_or(GuestlistError::RequestNotFound(id))
    }

    async fn requests_for_user(&self, user: UserId) -> Result<Vec<AnyParticipation>> {
        let mut requests: Vec<AnyParticipation> = self
            .requests
            .lock()
            .values()
            .filter(|r| r.data().requester == user)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.data().created);
        Ok(requests)
    }

    async fn requests_for_event(&self, event: EventId) -> Result<Vec<AnyParticipation>> {
        let mut requests: Vec<AnyParticipation> = self
            .requests
            .lock()
            .values()
            .filter(|r| r.data().event_id == event)
            .cloned()
            .collect();
        requests.sort_by_key(|r| r.data().created);
        Ok(requests)
    }

    async fn persist<T: ParticipationState + Clone>(&self, request: &Participation<T>) -> Result<()>
    where
        AnyParticipation: From<Participation<T>>,
    {
        let incoming = AnyParticipation::from(request.clone());
        let id = incoming.id();

        let mut requests = self.requests.lock();
        let current = requests
            .get(&id)
            .ok_or(GuestlistError::RequestNotFound(id))?;

        // State guard: the write only lands if the row is still in a state
        // the transition is legal from.
        let allowed_from: &[ParticipationStatus] = match incoming.status() {
            ParticipationStatus::Pending => &[ParticipationStatus::Pending],
            ParticipationStatus::Confirmed | ParticipationStatus::Rejected => {
                &[ParticipationStatus::Pending]
            }
            ParticipationStatus::Canceled => {
                &[ParticipationStatus::Pending, ParticipationStatus::Confirmed]
            }
        };
        if !allowed_from.contains(&current.status()) {
            return Err(GuestlistError::InvalidRequestState(
                id,
                current.status().to_string(),
                allowed_from
                    .iter()
                    .map(|s| s.as_str())
                    .collect::<Vec<_>>()
                    .join(" or "),
            ));
        }

        requests.insert(id, incoming);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::request::state::Canceled;

    fn new_event_input(initiator: UserId) -> NewEvent {
        NewEvent {
            initiator,
            title: "meetup".to_string(),
            event_date: Utc::now(),
            participant_limit: 0,
            request_moderation: false,
        }
    }

    #[tokio::test]
    async fn persist_guards_against_double_processing() {
        let store = InMemoryStore::new();
        let owner = store.create_user("owner".to_string()).await.unwrap();
        let guest = store.create_user("guest".to_string()).await.unwrap();
        let event = store
            .create_event(NewEvent {
                request_moderation: true,
                participant_limit: 5,
                ..new_event_input(owner.id)
            })
            .await
            .unwrap();
        store
            .update_event_status(event.id, EventStatus::Published)
            .await
            .unwrap();

        let submitted = store.submit_request(guest.id, event.id).await.unwrap();
        let pending = submitted.clone().into_pending().unwrap();

        // First transition lands, replay of a stale Pending handle does not.
        pending.clone().confirm(&store).await.unwrap();
        let err = pending.confirm(&store).await.unwrap_err();
        assert!(matches!(err, GuestlistError::InvalidRequestState(..)));
    }

    #[tokio::test]
    async fn persist_rejects_unknown_request() {
        let store = InMemoryStore::new();
        let ghost = Participation {
            data: ParticipationData {
                id: RequestId(Uuid::new_v4()),
                event_id: EventId(Uuid::new_v4()),
                requester: UserId(Uuid::new_v4()),
                created: Utc::now(),
            },
            state: Canceled {
                canceled_at: Utc::now(),
            },
        };
        let err = store.persist(&ghost).await.unwrap_err();
        assert!(matches!(err, GuestlistError::RequestNotFound(_)));
    }

    #[tokio::test]
    async fn lock_wait_bound_surfaces_as_contention() {
        let store = Arc::new(InMemoryStore::new().with_lock_wait(Duration::from_millis(20)));
        let owner = store.create_user("owner".to_string()).await.unwrap();
        let event = store
            .create_event(new_event_input(owner.id))
            .await
            .unwrap();

        // Hold the event lock so the submit below cannot enter.
        let held = store.lock_event(event.id).await.unwrap();
        let guest = store.create_user("guest".to_string()).await.unwrap();
        let err = store.submit_request(guest.id, event.id).await.unwrap_err();
        assert!(err.is_transient(), "expected contention, got {err}");
        drop(held);
    }
}
