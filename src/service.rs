//! Service surface of the admission subsystem.
//!
//! [`Admissions`] wraps a [`Storage`] backend and a [`StatsClient`] and
//! exposes the operations callers actually invoke. The storage backend owns
//! atomicity; this layer owns the cross-cutting concerns: transient-error
//! retry, structured logging, metrics, and the stats decoration on the
//! public read path.
//!
//! Every mutating operation retries once with a short backoff when the
//! store reports contention, then surfaces the error to the caller.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;

use crate::domain::event::{Event, EventId, EventStatus, NewEvent, UserId};
use crate::domain::request::state::{AnyParticipation, RequestId};
use crate::domain::user::User;
use crate::error::{GuestlistError, Result};
use crate::reconcile::{Disposition, ReconcileResult};
use crate::stats::{StatsClient, Visit, ViewRange};
use crate::store::Storage;

const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// A published event decorated with its collector view count.
#[derive(Debug, Clone)]
pub struct EventView {
    pub event: Event,
    pub views: u64,
}

/// Participation admission service.
///
/// # Example
/// ```ignore
/// use guestlist::{Admissions, InMemoryStore, MockStatsClient};
///
/// let service = Admissions::new(InMemoryStore::new(), MockStatsClient::new());
/// let owner = service.store().create_user("owner".to_string()).await?;
/// ```
pub struct Admissions<S, C> {
    store: S,
    stats: C,
    app: String,
    retry_backoff: Duration,
}

impl<S: Storage, C: StatsClient> Admissions<S, C> {
    pub fn new(store: S, stats: C) -> Self {
        Self {
            store,
            stats,
            app: "guestlist".to_string(),
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Application name reported with every recorded visit.
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Backoff before the single contention retry.
    pub fn with_retry_backoff(mut self, retry_backoff: Duration) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    /// Get the underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run `op`, retrying once after a backoff if it fails transiently.
    async fn with_retry<T, F, Fut>(&self, name: &'static str, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        match op().await {
            Err(e) if e.is_transient() => {
                counter!("guestlist_contention_retries_total", "op" => name).increment(1);
                tracing::warn!(op = name, error = %e, "Contention, retrying once");
                tokio::time::sleep(self.retry_backoff).await;
                op().await
            }
            other => other,
        }
    }

    // ========================================================================
    // Users and events
    // ========================================================================

    pub async fn create_user(&self, name: String) -> Result<User> {
        self.store.create_user(name).await
    }

    /// Create an event in the Pending status.
    #[tracing::instrument(skip(self, input), fields(initiator = %input.initiator))]
    pub async fn create_event(&self, input: NewEvent) -> Result<Event> {
        let event = self.store.create_event(input).await?;
        tracing::info!(event_id = %event.id, title = %event.title, "Event created");
        Ok(event)
    }

    /// Publish a pending event. Records the moment participation opens.
    #[tracing::instrument(skip(self))]
    pub async fn publish_event(&self, admin: UserId, event: EventId) -> Result<Event> {
        self.with_retry("publish_event", || {
            self.store.update_event_status(event, EventStatus::Published)
        })
        .await
    }

    /// Cancel a pending event. Published events cannot be canceled.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_event(&self, admin: UserId, event: EventId) -> Result<Event> {
        self.with_retry("cancel_event", || {
            self.store.update_event_status(event, EventStatus::Canceled)
        })
        .await
    }

    /// Public read path: fetch a published event, record the visit with the
    /// stats collector, and decorate the event with its view count.
    ///
    /// Stats failures never fail the read; they are logged and the view
    /// count degrades to zero.
    #[tracing::instrument(skip(self))]
    pub async fn published_event(&self, event: EventId, client_ip: &str) -> Result<EventView> {
        let found = self.store.get_event(event).await?;
        // Unpublished events are invisible on the public surface.
        let Some(published_on) = found.published_on.filter(|_| found.status == EventStatus::Published)
        else {
            return Err(GuestlistError::EventNotFound(event));
        };

        let uri = format!("/events/{}", *found.id);
        let visit = Visit {
            app: self.app.clone(),
            uri: uri.clone(),
            ip: client_ip.to_string(),
            timestamp: Utc::now(),
        };
        if let Err(e) = self.stats.record_visit(&visit).await {
            tracing::warn!(event_id = %event, error = %e, "Failed to record visit");
        }

        let range = ViewRange {
            start: published_on,
            end: Utc::now(),
        };
        let views = match self.stats.count_views(&[uri], true, range).await {
            Ok(views) => views,
            Err(e) => {
                tracing::warn!(event_id = %event, error = %e, "Failed to count views");
                0
            }
        };
        Ok(EventView {
            event: found,
            views,
        })
    }

    // ========================================================================
    // Participation requests
    // ========================================================================

    /// Submit a participation request on behalf of `requester`.
    #[tracing::instrument(skip(self))]
    pub async fn submit_request(
        &self,
        requester: UserId,
        event: EventId,
    ) -> Result<AnyParticipation> {
        let outcome = self
            .with_retry("submit_request", || {
                self.store.submit_request(requester, event)
            })
            .await;
        match &outcome {
            Ok(request) => {
                counter!(
                    "guestlist_requests_submitted_total",
                    "status" => request.status().as_str()
                )
                .increment(1);
            }
            Err(e) => {
                counter!(
                    "guestlist_requests_denied_total",
                    "reason" => e.kind().as_str()
                )
                .increment(1);
            }
        }
        outcome
    }

    /// Apply the initiator's decision over a batch of pending requests.
    #[tracing::instrument(skip(self, ids), fields(batch = ids.len()))]
    pub async fn reconcile(
        &self,
        owner: UserId,
        event: EventId,
        ids: &[RequestId],
        disposition: Disposition,
    ) -> Result<ReconcileResult> {
        let result = self
            .with_retry("reconcile", || {
                self.store.reconcile(owner, event, ids, disposition)
            })
            .await?;
        counter!(
            "guestlist_reconcile_batches_total",
            "disposition" => disposition.as_str()
        )
        .increment(1);
        counter!("guestlist_requests_confirmed_total").increment(result.confirmed.len() as u64);
        counter!("guestlist_requests_rejected_total").increment(result.rejected.len() as u64);
        Ok(result)
    }

    /// Cancel a request on behalf of its requester. A confirmed request's
    /// slot is not released and no pending request is promoted.
    #[tracing::instrument(skip(self))]
    pub async fn cancel_request(
        &self,
        requester: UserId,
        request: RequestId,
    ) -> Result<AnyParticipation> {
        let canceled = self
            .with_retry("cancel_request", || {
                self.store.cancel_request(requester, request)
            })
            .await?;
        counter!("guestlist_requests_canceled_total").increment(1);
        Ok(canceled)
    }

    /// All requests `user` has submitted, oldest first.
    pub async fn requests_for_user(&self, user: UserId) -> Result<Vec<AnyParticipation>> {
        self.store.requests_for_user(user).await
    }

    /// The initiator's view of their event's request queue.
    ///
    /// # Errors
    /// `NotOwner` if `owner` did not initiate the event.
    pub async fn requests_for_event(
        &self,
        owner: UserId,
        event: EventId,
    ) -> Result<Vec<AnyParticipation>> {
        let found = self.store.get_event(event).await?;
        if found.initiator != owner {
            return Err(GuestlistError::NotOwner {
                user: owner,
                event,
            });
        }
        self.store.requests_for_event(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::MockStatsClient;
    use crate::store::memory::InMemoryStore;

    fn new_event_input(initiator: UserId, limit: u32, moderation: bool) -> NewEvent {
        NewEvent {
            initiator,
            title: "rustconf afterparty".to_string(),
            event_date: Utc::now() + chrono::Duration::days(7),
            participant_limit: limit,
            request_moderation: moderation,
        }
    }

    #[test_log::test(tokio::test)]
    async fn published_event_records_visit_and_decorates_views() {
        let service = Admissions::new(InMemoryStore::new(), MockStatsClient::new());
        let owner = service.create_user("owner".to_string()).await.unwrap();
        let event = service
            .create_event(new_event_input(owner.id, 10, true))
            .await
            .unwrap();
        service.publish_event(owner.id, event.id).await.unwrap();

        let uri = format!("/events/{}", *event.id);
        service.stats.set_views(&uri, 42);

        let view = service.published_event(event.id, "10.0.0.1").await.unwrap();
        assert_eq!(view.views, 42);
        assert_eq!(view.event.id, event.id);

        let recorded = service.stats.recorded_visits();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0].uri, uri);
        assert_eq!(recorded[0].ip, "10.0.0.1");
    }

    #[test_log::test(tokio::test)]
    async fn unpublished_event_is_invisible_on_the_public_surface() {
        let service = Admissions::new(InMemoryStore::new(), MockStatsClient::new());
        let owner = service.create_user("owner".to_string()).await.unwrap();
        let event = service
            .create_event(new_event_input(owner.id, 10, true))
            .await
            .unwrap();

        let err = service
            .published_event(event.id, "10.0.0.1")
            .await
            .unwrap_err();
        assert!(matches!(err, GuestlistError::EventNotFound(_)));
        assert!(service.stats.recorded_visits().is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn owner_view_requires_ownership() {
        let service = Admissions::new(InMemoryStore::new(), MockStatsClient::new());
        let owner = service.create_user("owner".to_string()).await.unwrap();
        let stranger = service.create_user("stranger".to_string()).await.unwrap();
        let event = service
            .create_event(new_event_input(owner.id, 10, true))
            .await
            .unwrap();

        let err = service
            .requests_for_event(stranger.id, event.id)
            .await
            .unwrap_err();
        assert!(matches!(err, GuestlistError::NotOwner { .. }));

        assert!(
            service
                .requests_for_event(owner.id, event.id)
                .await
                .unwrap()
                .is_empty()
        );
    }
}
