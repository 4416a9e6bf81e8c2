//! PostgreSQL implementation of the Storage trait.
//!
//! Every admission-critical operation executes inside one transaction that
//! takes the event row with `SELECT ... FOR UPDATE` before inspecting
//! `confirmed_requests`, so concurrent submissions and reconciliations
//! serialize per event. Confirmed-count increments are additionally guarded
//! in SQL, making the capacity check-and-increment a single conditional
//! write rather than a read followed by a write.
//!
//! Lock waits are bounded with `SET LOCAL lock_timeout`; SQLSTATE 55P03
//! (lock not available), 40001 (serialization failure) and 40P01 (deadlock)
//! surface as the transient `Contention` error.

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::Row;
use sqlx::postgres::{PgPool, PgRow};
use uuid::Uuid;

use super::Storage;
use crate::domain::event::{Event, EventId, EventStatus, NewEvent, UserId};
use crate::domain::request::state::{
    AnyParticipation, Canceled, Confirmed, Participation, ParticipationData, ParticipationState,
    ParticipationStatus, Pending, Rejected, RejectionReason, RequestId,
};
use crate::domain::user::User;
use crate::error::{GuestlistError, Result};
use crate::policy::{self, Decision};
use crate::reconcile::{self, Disposition, ReconcileResult};

/// Default bound on waiting for the event row lock, in milliseconds.
const DEFAULT_LOCK_WAIT_MS: u64 = 2_000;

/// PostgreSQL-backed store.
///
/// # Example
/// ```ignore
/// use guestlist::PostgresStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgresql://localhost/guestlist").await?;
/// guestlist::migrator().run(&pool).await?;
/// let store = PostgresStore::new(pool);
/// ```
pub struct PostgresStore {
    pool: PgPool,
    lock_wait_ms: u64,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            lock_wait_ms: DEFAULT_LOCK_WAIT_MS,
        }
    }

    /// Set the bound on row-lock waits. Builder method chained after `new()`.
    pub fn with_lock_wait_ms(mut self, lock_wait_ms: u64) -> Self {
        self.lock_wait_ms = lock_wait_ms;
        self
    }

    /// Get the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Bound lock waits for the current transaction.
    async fn bound_lock_wait(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    ) -> Result<()> {
        // lock_timeout cannot be bound as a parameter.
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = '{}ms'",
            self.lock_wait_ms
        ))
        .execute(&mut **tx)
        .await
        .map_err(map_db_error)?;
        Ok(())
    }

    /// Read the event row under an exclusive row lock.
    async fn lock_event(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        id: EventId,
    ) -> Result<Event> {
        let row = sqlx::query(
            r#"
            SELECT id, initiator_id, title, event_date, created_on, published_on,
                   status, participant_limit, request_moderation, confirmed_requests
            FROM events
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(*id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(map_db_error)?
        .ok_or(GuestlistError::EventNotFound(id))?;
        event_from_row(&row)
    }
}

#[async_trait]
impl Storage for PostgresStore {
    async fn create_user(&self, name: String) -> Result<User> {
        let user = User {
            id: UserId(Uuid::new_v4()),
            name,
            created_on: Utc::now(),
        };
        sqlx::query("INSERT INTO users (id, name, created_on) VALUES ($1, $2, $3)")
            .bind(*user.id)
            .bind(&user.name)
            .bind(user.created_on)
            .execute(&self.pool)
            .await
            .map_err(map_db_error)?;
        Ok(user)
    }

    async fn user_exists(&self, id: UserId) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1) AS present")
            .bind(*id)
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_error)?;
        row.try_get("present").map_err(map_db_error)
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
        sqlx::query(
            r#"
            INSERT INTO events
                (id, initiator_id, title, event_date, created_on,
                 status, participant_limit, request_moderation, confirmed_requests)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, 0)
            "#,
        )
        .bind(*event.id)
        .bind(*event.initiator)
        .bind(&event.title)
        .bind(event.event_date)
        .bind(event.created_on)
        .bind(event.status.as_str())
        .bind(event.participant_limit as i32)
        .bind(event.request_moderation)
        .execute(&self.pool)
        .await
        .map_err(map_db_error)?;
        Ok(event)
    }

    async fn get_event(&self, id: EventId) -> Result<Event> {
        let row = sqlx::query(
            r#"
            SELECT id, initiator_id, title, event_date, created_on, published_on,
                   status, participant_limit, request_moderation, confirmed_requests
            FROM events
            WHERE id = $1
            "#,
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or(GuestlistError::EventNotFound(id))?;
        event_from_row(&row)
    }

    #[tracing::instrument(skip(self))]
    async fn update_event_status(&self, id: EventId, to: EventStatus) -> Result<Event> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        self.bound_lock_wait(&mut tx).await?;

        let mut event = self.lock_event(&mut tx, id).await?;
        event.check_transition(to)?;

        let published_on = if to == EventStatus::Published {
            Some(Utc::now())
        } else {
            event.published_on
        };
        sqlx::query("UPDATE events SET status = $2, published_on = $3 WHERE id = $1")
            .bind(*id)
            .bind(to.as_str())
            .bind(published_on)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?;
        tx.commit().await.map_err(map_db_error)?;

        event.status = to;
        event.published_on = published_on;
        tracing::info!(event_id = %id, status = %to.as_str(), "Event status updated");
        Ok(event)
    }

    #[tracing::instrument(skip(self))]
    async fn submit_request(&self, requester: UserId, event: EventId) -> Result<AnyParticipation> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        self.bound_lock_wait(&mut tx).await?;

        // The row lock pins confirmed_requests for the whole check-and-insert.
        let snapshot = self.lock_event(&mut tx, event).await?;

        let requester_present: bool =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM users WHERE id = $1) AS present")
                .bind(*requester)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_db_error)?
                .try_get("present")
                .map_err(map_db_error)?;
        if !requester_present {
            return Err(GuestlistError::UserNotFound(requester));
        }

        let duplicate: bool = sqlx::query(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM participation_requests
                WHERE requester_id = $1 AND event_id = $2 AND status <> 'canceled'
            ) AS present
            "#,
        )
        .bind(*requester)
        .bind(*event)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?
        .try_get("present")
        .map_err(map_db_error)?;
        if duplicate {
            return Err(GuestlistError::DuplicateRequest { requester, event });
        }

        let decision =
            policy::decide(&snapshot, requester).map_err(|denial| denial.into_error(&snapshot))?;

        let data = ParticipationData {
            id: RequestId(Uuid::new_v4()),
            event_id: event,
            requester,
            created: Utc::now(),
        };
        let (status, confirmed_at) = match decision {
            Decision::AutoConfirm => (ParticipationStatus::Confirmed, Some(Utc::now())),
            Decision::Queue => (ParticipationStatus::Pending, None),
        };

        sqlx::query(
            r#"
            INSERT INTO participation_requests
                (id, event_id, requester_id, status, created, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(*data.id)
        .bind(*event)
        .bind(*requester)
        .bind(status.as_str())
        .bind(data.created)
        .bind(confirmed_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            // The partial unique index is the authoritative duplicate guard.
            if is_unique_violation(&e) {
                GuestlistError::DuplicateRequest { requester, event }
            } else {
                map_db_error(e)
            }
        })?;

        if decision == Decision::AutoConfirm && !snapshot.is_unlimited() {
            let updated = sqlx::query(
                r#"
                UPDATE events
                SET confirmed_requests = confirmed_requests + 1
                WHERE id = $1
                  AND (participant_limit = 0 OR confirmed_requests < participant_limit)
                "#,
            )
            .bind(*event)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
            if updated == 0 {
                // Unreachable while the row lock is held; the guard keeps the
                // invariant even if locking is ever loosened.
                tx.rollback().await.ok();
                return Err(GuestlistError::CapacityReached(event));
            }
        }

        tx.commit().await.map_err(map_db_error)?;

        let created = match decision {
            Decision::AutoConfirm => AnyParticipation::Confirmed(Participation {
                data,
                state: Confirmed {
                    confirmed_at: confirmed_at.unwrap_or_else(Utc::now),
                },
            }),
            Decision::Queue => AnyParticipation::Pending(Participation {
                data,
                state: Pending,
            }),
        };
        tracing::info!(
            request_id = %created.id(),
            event_id = %event,
            status = %created.status(),
            "Participation request submitted"
        );
        Ok(created)
    }

    #[tracing::instrument(skip(self, ids), fields(batch = ids.len()))]
    async fn reconcile(
        &self,
        caller: UserId,
        event: EventId,
        ids: &[RequestId],
        disposition: Disposition,
    ) -> Result<ReconcileResult> {
        let mut tx = self.pool.begin().await.map_err(map_db_error)?;
        self.bound_lock_wait(&mut tx).await?;

        let snapshot = self.lock_event(&mut tx, event).await?;

        // Lock the targeted request rows too: a concurrent cancel now blocks
        // until this batch commits instead of racing the guarded updates.
        let uuids: Vec<Uuid> = ids.iter().map(|id| **id).collect();
        let rows = sqlx::query(
            r#"
            SELECT id, requester_id, status, created
            FROM participation_requests
            WHERE event_id = $1 AND id = ANY($2)
            FOR UPDATE
            "#,
        )
        .bind(*event)
        .bind(&uuids)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_error)?;

        let mut loaded = std::collections::HashMap::with_capacity(rows.len());
        for row in &rows {
            let id: Uuid = row.try_get("id").map_err(map_db_error)?;
            let requester: Uuid = row.try_get("requester_id").map_err(map_db_error)?;
            let status: ParticipationStatus = parse_enum(row, "status")?;
            let created: DateTime<Utc> = row.try_get("created").map_err(map_db_error)?;
            loaded.insert(RequestId(id), (UserId(requester), status, created));
        }

        // Caller order, every id resolved.
        let mut batch = Vec::with_capacity(ids.len());
        for id in ids {
            let (_, status, _) = loaded
                .get(id)
                .ok_or(GuestlistError::RequestNotFound(*id))?;
            batch.push((*id, *status));
        }

        let plan = reconcile::plan(&snapshot, caller, &batch, disposition)?;

        let now = Utc::now();
        if !plan.confirm.is_empty() {
            let confirm_uuids: Vec<Uuid> = plan.confirm.iter().map(|id| **id).collect();
            let updated = sqlx::query(
                r#"
                UPDATE participation_requests
                SET status = 'confirmed', confirmed_at = $2
                WHERE id = ANY($1) AND status = 'pending'
                "#,
            )
            .bind(&confirm_uuids)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
            if updated as usize != plan.confirm.len() {
                tx.rollback().await.ok();
                return Err(GuestlistError::Other(anyhow!(
                    "reconcile lost {} confirmations despite row locks",
                    plan.confirm.len() - updated as usize
                )));
            }

            if !snapshot.is_unlimited() {
                let bumped = sqlx::query(
                    r#"
                    UPDATE events
                    SET confirmed_requests = confirmed_requests + $2
                    WHERE id = $1
                      AND (participant_limit = 0
                           OR confirmed_requests + $2 <= participant_limit)
                    "#,
                )
                .bind(*event)
                .bind(plan.confirm.len() as i32)
                .execute(&mut *tx)
                .await
                .map_err(map_db_error)?
                .rows_affected();
                if bumped == 0 {
                    tx.rollback().await.ok();
                    return Err(GuestlistError::CapacityReached(event));
                }
            }
        }

        if !plan.reject.is_empty() {
            let reject_uuids: Vec<Uuid> = plan.reject.iter().map(|id| **id).collect();
            let updated = sqlx::query(
                r#"
                UPDATE participation_requests
                SET status = 'rejected', rejected_at = $2, rejection_reason = $3
                WHERE id = ANY($1) AND status = 'pending'
                "#,
            )
            .bind(&reject_uuids)
            .bind(now)
            .bind(plan.reject_reason.as_str())
            .execute(&mut *tx)
            .await
            .map_err(map_db_error)?
            .rows_affected();
            if updated as usize != plan.reject.len() {
                tx.rollback().await.ok();
                return Err(GuestlistError::Other(anyhow!(
                    "reconcile lost {} rejections despite row locks",
                    plan.reject.len() - updated as usize
                )));
            }
        }

        tx.commit().await.map_err(map_db_error)?;
        tracing::info!(
            event_id = %event,
            confirmed = plan.confirm.len(),
            rejected = plan.reject.len(),
            disposition = %disposition,
            "Reconciled participation batch"
        );

        let build_data = |id: &RequestId| -> Result<ParticipationData> {
            let (requester, _, created) = loaded
                .get(id)
                .ok_or(GuestlistError::RequestNotFound(*id))?;
            Ok(ParticipationData {
                id: *id,
                event_id: event,
                requester: *requester,
                created: *created,
            })
        };
        let mut confirmed = Vec::with_capacity(plan.confirm.len());
        for id in &plan.confirm {
            confirmed.push(AnyParticipation::Confirmed(Participation {
                data: build_data(id)?,
                state: Confirmed { confirmed_at: now },
            }));
        }
        let mut rejected = Vec::with_capacity(plan.reject.len());
        for id in &plan.reject {
            rejected.push(AnyParticipation::Rejected(Participation {
                data: build_data(id)?,
                state: Rejected {
                    rejected_at: now,
                    reason: plan.reject_reason,
                },
            }));
        }
        Ok(ReconcileResult {
            confirmed,
            rejected,
        })
    }

    async fn cancel_request(&self, requester: UserId, id: RequestId) -> Result<AnyParticipation> {
        let row = sqlx::query(
            r#"
            SELECT id, event_id, requester_id, status, created,
                   confirmed_at, rejected_at, rejection_reason, canceled_at
            FROM participation_requests
            WHERE id = $1 AND requester_id = $2
            "#,
        )
        .bind(*id)
        .bind(*requester)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or(GuestlistError::RequestNotFound(id))?;

        match participation_from_row(&row)? {
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
        let row = sqlx::query(
            r#"
            SELECT id, event_id, requester_id, status, created,
                   confirmed_at, rejected_at, rejection_reason, canceled_at
            FROM participation_requests
            WHERE id = $1
            "#,
        )
        .bind(*id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_error)?
        .ok_or(GuestlistError::RequestNotFound(id))?;
        participation_from_row(&row)
    }

    async fn requests_for_user(&self, user: UserId) -> Result<Vec<AnyParticipation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, requester_id, status, created,
                   confirmed_at, rejected_at, rejection_reason, canceled_at
            FROM participation_requests
            WHERE requester_id = $1
            ORDER BY created ASC
            "#,
        )
        .bind(*user)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(participation_from_row).collect()
    }

    async fn requests_for_event(&self, event: EventId) -> Result<Vec<AnyParticipation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, event_id, requester_id, status, created,
                   confirmed_at, rejected_at, rejection_reason, canceled_at
            FROM participation_requests
            WHERE event_id = $1
            ORDER BY created ASC
            "#,
        )
        .bind(*event)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_error)?;
        rows.iter().map(participation_from_row).collect()
    }

    async fn persist<T: ParticipationState + Clone>(&self, request: &Participation<T>) -> Result<()>
    where
        AnyParticipation: From<Participation<T>>,
    {
        let any = AnyParticipation::from(request.clone());
        let id = any.id();

        // Each write is guarded on the state the transition is legal from, so
        // a concurrent decision makes the late write miss instead of clobber.
        let (updated, expected) = match &any {
            AnyParticipation::Pending(_) => {
                let n = sqlx::query(
                    "UPDATE participation_requests SET status = 'pending' \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(*id)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?
                .rows_affected();
                (n, "pending")
            }
            AnyParticipation::Confirmed(req) => {
                let n = sqlx::query(
                    "UPDATE participation_requests \
                     SET status = 'confirmed', confirmed_at = $2 \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(*id)
                .bind(req.state.confirmed_at)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?
                .rows_affected();
                (n, "pending")
            }
            AnyParticipation::Rejected(req) => {
                let n = sqlx::query(
                    "UPDATE participation_requests \
                     SET status = 'rejected', rejected_at = $2, rejection_reason = $3 \
                     WHERE id = $1 AND status = 'pending'",
                )
                .bind(*id)
                .bind(req.state.rejected_at)
                .bind(req.state.reason.as_str())
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?
                .rows_affected();
                (n, "pending")
            }
            AnyParticipation::Canceled(req) => {
                let n = sqlx::query(
                    "UPDATE participation_requests \
                     SET status = 'canceled', canceled_at = $2 \
                     WHERE id = $1 AND status IN ('pending', 'confirmed')",
                )
                .bind(*id)
                .bind(req.state.canceled_at)
                .execute(&self.pool)
                .await
                .map_err(map_db_error)?
                .rows_affected();
                (n, "pending or confirmed")
            }
        };

        if updated == 0 {
            let current: Option<String> =
                sqlx::query("SELECT status FROM participation_requests WHERE id = $1")
                    .bind(*id)
                    .fetch_optional(&self.pool)
                    .await
                    .map_err(map_db_error)?
                    .map(|row| row.try_get("status"))
                    .transpose()
                    .map_err(map_db_error)?;
            return match current {
                Some(actual) => Err(GuestlistError::InvalidRequestState(
                    id,
                    actual,
                    expected.to_string(),
                )),
                None => Err(GuestlistError::RequestNotFound(id)),
            };
        }
        Ok(())
    }
}

// ============================================================================
// Row mapping and error classification
// ============================================================================

fn event_from_row(row: &PgRow) -> Result<Event> {
    Ok(Event {
        id: EventId(row.try_get("id").map_err(map_db_error)?),
        initiator: UserId(row.try_get("initiator_id").map_err(map_db_error)?),
        title: row.try_get("title").map_err(map_db_error)?,
        event_date: row.try_get("event_date").map_err(map_db_error)?,
        created_on: row.try_get("created_on").map_err(map_db_error)?,
        published_on: row.try_get("published_on").map_err(map_db_error)?,
        status: parse_enum(row, "status")?,
        participant_limit: row.try_get::<i32, _>("participant_limit").map_err(map_db_error)? as u32,
        request_moderation: row.try_get("request_moderation").map_err(map_db_error)?,
        confirmed_requests: row
            .try_get::<i32, _>("confirmed_requests")
            .map_err(map_db_error)? as u32,
    })
}

fn participation_from_row(row: &PgRow) -> Result<AnyParticipation> {
    let data = ParticipationData {
        id: RequestId(row.try_get("id").map_err(map_db_error)?),
        event_id: EventId(row.try_get("event_id").map_err(map_db_error)?),
        requester: UserId(row.try_get("requester_id").map_err(map_db_error)?),
        created: row.try_get("created").map_err(map_db_error)?,
    };
    let status: ParticipationStatus = parse_enum(row, "status")?;
    let fallback = data.created;

    Ok(match status {
        ParticipationStatus::Pending => AnyParticipation::Pending(Participation {
            data,
            state: Pending,
        }),
        ParticipationStatus::Confirmed => {
            let confirmed_at: Option<DateTime<Utc>> =
                row.try_get("confirmed_at").map_err(map_db_error)?;
            AnyParticipation::Confirmed(Participation {
                data,
                state: Confirmed {
                    confirmed_at: confirmed_at.unwrap_or(fallback),
                },
            })
        }
        ParticipationStatus::Rejected => {
            let rejected_at: Option<DateTime<Utc>> =
                row.try_get("rejected_at").map_err(map_db_error)?;
            let reason: Option<String> =
                row.try_get("rejection_reason").map_err(map_db_error)?;
            AnyParticipation::Rejected(Participation {
                data,
                state: Rejected {
                    rejected_at: rejected_at.unwrap_or(fallback),
                    reason: reason
                        .as_deref()
                        .map(str::parse)
                        .transpose()
                        .map_err(|e: String| GuestlistError::Other(anyhow!(e)))?
                        .unwrap_or(RejectionReason::OwnerDecision),
                },
            })
        }
        ParticipationStatus::Canceled => {
            let canceled_at: Option<DateTime<Utc>> =
                row.try_get("canceled_at").map_err(map_db_error)?;
            AnyParticipation::Canceled(Participation {
                data,
                state: Canceled {
                    canceled_at: canceled_at.unwrap_or(fallback),
                },
            })
        }
    })
}

fn parse_enum<T: std::str::FromStr<Err = String>>(row: &PgRow, column: &str) -> Result<T> {
    row.try_get::<String, _>(column)
        .map_err(map_db_error)?
        .parse()
        .map_err(|e: String| GuestlistError::Other(anyhow!(e)))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.code().as_deref() == Some("23505")
    )
}

/// Classify a database error: lock timeouts, serialization failures and
/// deadlocks are transient contention; everything else is internal.
fn map_db_error(e: sqlx::Error) -> GuestlistError {
    if let sqlx::Error::Database(db) = &e
        && let Some(code) = db.code()
        && matches!(code.as_ref(), "55P03" | "40001" | "40P01")
    {
        return GuestlistError::Contention(db.message().to_string());
    }
    GuestlistError::Other(anyhow!("database error: {e}"))
}
