use anyhow::Context;
use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{FailureAction, OutboxError, OutboxEvent, OutboxRepository, OutboxResult};

const EVENT_COLUMNS: &str = r#"
    id,
    aggregate_type,
    aggregate_id,
    event_type,
    payload,
    created_at,
    processed_at,
    retry_count,
    last_error,
    dead_lettered_at
"#;

/// SQLx-based implementation of [`OutboxRepository`] over the `outbox_events` table.
#[derive(Clone)]
pub struct SqlxOutboxRepository {
    pool: PgPool,
}

impl SqlxOutboxRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert an event inside the caller's transaction.
    ///
    /// Must share the transaction of the business write it describes; the
    /// row becomes visible to the relay only when that transaction commits.
    pub async fn insert(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &OutboxEvent,
    ) -> OutboxResult<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox_events (
                id,
                aggregate_type,
                aggregate_id,
                event_type,
                payload,
                created_at,
                retry_count
            ) VALUES ($1, $2, $3, $4, $5, $6, 0)
            "#,
        )
        .bind(event.id)
        .bind(&event.aggregate_type)
        .bind(event.aggregate_id)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .execute(&mut **tx)
        .await
        .context("Failed to insert event into outbox")?;

        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            aggregate_id = %event.aggregate_id,
            "Event inserted into outbox"
        );

        Ok(())
    }

    /// Rows flagged for dead-letter handling, oldest first.
    pub async fn dead_letters(&self, limit: i64) -> OutboxResult<Vec<OutboxEvent>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {EVENT_COLUMNS}
            FROM outbox_events
            WHERE dead_lettered_at IS NOT NULL
              AND processed_at IS NULL
            ORDER BY dead_lettered_at ASC
            LIMIT $1
            "#
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch dead-lettered events")?;

        rows.iter().map(event_from_row).collect()
    }

    /// Clear the dead-letter flag on one row so the relay retries it from scratch.
    pub async fn requeue(&self, event_id: Uuid) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET dead_lettered_at = NULL,
                retry_count = 0,
                locked_until = NULL
            WHERE id = $1
              AND dead_lettered_at IS NOT NULL
              AND processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to requeue dead-lettered event")?;

        Ok(res.rows_affected())
    }

    /// Clear the dead-letter flag on every flagged row.
    pub async fn requeue_all(&self) -> OutboxResult<u64> {
        let res = sqlx::query(
            r#"
            UPDATE outbox_events
            SET dead_lettered_at = NULL,
                retry_count = 0,
                locked_until = NULL
            WHERE dead_lettered_at IS NOT NULL
              AND processed_at IS NULL
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to requeue dead-lettered events")?;

        Ok(res.rows_affected())
    }
}

fn event_from_row(row: &PgRow) -> OutboxResult<OutboxEvent> {
    Ok(OutboxEvent {
        id: row.try_get("id")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        event_type: row.try_get("event_type")?,
        payload: row.try_get("payload")?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        retry_count: row.try_get("retry_count")?,
        last_error: row.try_get("last_error")?,
        dead_lettered_at: row.try_get("dead_lettered_at")?,
    })
}

#[async_trait]
impl OutboxRepository for SqlxOutboxRepository {
    async fn claim_batch(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEvent>> {
        // SKIP LOCKED keeps concurrent claimants off each other's rows; the
        // lease keeps them off until the claimant marks or fails the row.
        let rows = sqlx::query(&format!(
            r#"
            UPDATE outbox_events
            SET locked_until = NOW() + make_interval(secs => $2)
            WHERE id IN (
                SELECT id
                FROM outbox_events
                WHERE processed_at IS NULL
                  AND dead_lettered_at IS NULL
                  AND (locked_until IS NULL OR locked_until <= NOW())
                ORDER BY created_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {EVENT_COLUMNS}
            "#
        ))
        .bind(limit)
        .bind(lease.as_secs_f64())
        .fetch_all(&self.pool)
        .await
        .context("Failed to claim outbox events")?;

        let mut events = rows
            .iter()
            .map(event_from_row)
            .collect::<OutboxResult<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order
        events.sort_by_key(|e| e.created_at);

        debug!(count = events.len(), "Claimed outbox events");

        Ok(events)
    }

    async fn mark_processed(&self, event_id: Uuid) -> OutboxResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_events
            SET processed_at = NOW(),
                locked_until = NULL
            WHERE id = $1
              AND processed_at IS NULL
            "#,
        )
        .bind(event_id)
        .execute(&self.pool)
        .await
        .context("Failed to mark event as processed")?;

        if result.rows_affected() == 0 {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM outbox_events WHERE id = $1)")
                    .bind(event_id)
                    .fetch_one(&self.pool)
                    .await
                    .context("Failed to look up outbox event")?;
            if !exists {
                warn!(event_id = %event_id, "Event not found when marking as processed");
                return Err(OutboxError::EventNotFound(event_id));
            }
            return Ok(false);
        }

        debug!(event_id = %event_id, "Event marked as processed");

        Ok(true)
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        action: FailureAction,
    ) -> OutboxResult<()> {
        let result = match action {
            FailureAction::RetryAfter(delay) => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET retry_count = retry_count + 1,
                        last_error = $2,
                        locked_until = NOW() + make_interval(secs => $3)
                    WHERE id = $1
                      AND processed_at IS NULL
                    "#,
                )
                .bind(event_id)
                .bind(error)
                .bind(delay.as_secs_f64())
                .execute(&self.pool)
                .await
            }
            FailureAction::DeadLetter => {
                sqlx::query(
                    r#"
                    UPDATE outbox_events
                    SET retry_count = retry_count + 1,
                        last_error = $2,
                        locked_until = NULL,
                        dead_lettered_at = NOW()
                    WHERE id = $1
                      AND processed_at IS NULL
                    "#,
                )
                .bind(event_id)
                .bind(error)
                .execute(&self.pool)
                .await
            }
        }
        .context("Failed to mark event as failed")?;

        if result.rows_affected() == 0 {
            warn!(event_id = %event_id, "Event not pending when marking as failed");
            return Err(OutboxError::EventNotFound(event_id));
        }

        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let rec = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS pending,
                COALESCE(EXTRACT(EPOCH FROM (NOW() - MIN(created_at)))::BIGINT, 0) AS age_seconds
            FROM outbox_events
            WHERE processed_at IS NULL
              AND dead_lettered_at IS NULL
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("Failed to compute pending stats")?;

        let pending: i64 = rec.try_get("pending").unwrap_or(0);
        let age: i64 = rec.try_get("age_seconds").unwrap_or(0);
        Ok((pending, age))
    }
}
