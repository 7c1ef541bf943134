//! # Transactional Outbox
//!
//! Durable hand-off between a database write and the broadcast channel that
//! gateways listen on.
//!
//! 1. The business write and its outbox row commit in one transaction
//!    ([`SqlxOutboxRepository::insert`]).
//! 2. [`OutboxRelay`] claims unprocessed rows, wraps each in an
//!    [`OutboxEnvelope`] and hands it to an [`OutboxPublisher`].
//! 3. A row is marked processed only after the publisher accepted it.
//!
//! Delivery is **at-least-once**: a crash between publish and mark re-publishes
//! the row after restart, so consumers must tolerate a repeated `event_id`.
//!
//! Rows that keep failing are not retried forever. After `max_retries`
//! attempts the row is flagged `dead_lettered_at` and left in place for an
//! operator (see the `outbox-cli` binary). Rows are never deleted.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use transactional_outbox::{
//!     OutboxEvent, OutboxRelay, RedisOutboxPublisher, RelayConfig, SqlxOutboxRepository,
//! };
//! use sqlx::PgPool;
//! use std::sync::Arc;
//! use tokio::sync::watch;
//! use uuid::Uuid;
//!
//! # async fn example(pool: PgPool, redis: redis::aio::ConnectionManager) -> Result<(), Box<dyn std::error::Error>> {
//! let repository = SqlxOutboxRepository::new(pool.clone());
//!
//! let mut tx = pool.begin().await?;
//! let message_id = Uuid::new_v4();
//! // ... insert the business row with `&mut *tx` ...
//! let event = OutboxEvent::new(
//!     "message",
//!     message_id,
//!     "message.sent",
//!     serde_json::json!({ "event_type": "message.sent", "message_id": message_id }),
//!     chrono::Utc::now(),
//! );
//! repository.insert(&mut tx, &event).await?;
//! tx.commit().await?;
//!
//! let relay = OutboxRelay::new(
//!     Arc::new(repository),
//!     Arc::new(RedisOutboxPublisher::new(redis, "chat:events")),
//!     RelayConfig::default(),
//! );
//! let (_shutdown_tx, shutdown_rx) = watch::channel(false);
//! relay.run(shutdown_rx).await;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

mod error;
pub mod metrics;
mod publisher;
mod relay;
mod repository;

pub use error::{OutboxError, OutboxResult};
pub use publisher::RedisOutboxPublisher;
pub use relay::{BatchReport, OutboxRelay, RelayConfig};
pub use repository::SqlxOutboxRepository;

/// A row of the `outbox_events` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Unique identifier; becomes the envelope's `event_id`
    pub id: Uuid,

    /// Type of aggregate this event relates to (e.g. "message")
    pub aggregate_type: String,

    /// ID of the entity this event relates to
    pub aggregate_id: Uuid,

    /// Fully qualified event type (e.g. "message.sent")
    pub event_type: String,

    /// Structured payload; must be a JSON object carrying `event_type`
    pub payload: serde_json::Value,

    pub created_at: DateTime<Utc>,

    /// Set once, by the relay, after a successful publish
    pub processed_at: Option<DateTime<Utc>>,

    /// Number of failed publish attempts
    pub retry_count: i32,

    /// Last error message from a failed publish attempt
    pub last_error: Option<String>,

    /// Set when retries are exhausted; the relay no longer claims the row
    pub dead_lettered_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn new(
        aggregate_type: impl Into<String>,
        aggregate_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Value,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            event_type: event_type.into(),
            payload,
            created_at,
            processed_at: None,
            retry_count: 0,
            last_error: None,
            dead_lettered_at: None,
        }
    }

    /// Wrap the row for the broadcast channel, checking the payload shape first.
    pub fn envelope(&self) -> OutboxResult<OutboxEnvelope> {
        let object = self.payload.as_object().ok_or_else(|| {
            OutboxError::InvalidPayload(format!("event {} payload is not an object", self.id))
        })?;

        match object.get("event_type").and_then(|v| v.as_str()) {
            Some(kind) if kind == self.event_type => {}
            Some(kind) => {
                return Err(OutboxError::InvalidPayload(format!(
                    "event {} payload event_type {kind} does not match {}",
                    self.id, self.event_type
                )))
            }
            None => {
                return Err(OutboxError::InvalidPayload(format!(
                    "event {} payload is missing event_type",
                    self.id
                )))
            }
        }

        Ok(OutboxEnvelope {
            event_id: self.id,
            aggregate_type: self.aggregate_type.clone(),
            aggregate_id: self.aggregate_id,
            created_at: self.created_at,
            payload: self.payload.clone(),
        })
    }
}

/// Wire shape published on the broadcast channel.
///
/// `created_at` travels as unix milliseconds. The payload type defaults to raw
/// JSON; consumers decode it into their own schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEnvelope<P = serde_json::Value> {
    pub event_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub created_at: DateTime<Utc>,
    pub payload: P,
}

/// What to do with a row whose publish attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Leave the row unprocessed and hide it from claims for this long.
    RetryAfter(Duration),
    /// Flag the row for manual handling; it is never claimed again.
    DeadLetter,
}

/// Storage side of the outbox as seen by the relay.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Claim up to `limit` unprocessed rows, oldest first.
    ///
    /// A claimed row is hidden from every other claimant (in this process or
    /// another) for `lease`, so two workers never publish it concurrently.
    async fn claim_batch(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEvent>>;

    /// Set `processed_at`. Returns `false` if the row was already processed.
    async fn mark_processed(&self, event_id: Uuid) -> OutboxResult<bool>;

    /// Record a failed attempt: bump `retry_count`, keep the error text and
    /// apply `action`.
    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        action: FailureAction,
    ) -> OutboxResult<()>;

    /// Pending count and oldest pending age in seconds (0 when none pending).
    async fn pending_stats(&self) -> OutboxResult<(i64, i64)>;
}

/// Publisher for the broadcast channel.
///
/// Publishing the same envelope twice must be harmless for consumers.
#[async_trait]
pub trait OutboxPublisher: Send + Sync {
    async fn publish(&self, envelope: &OutboxEnvelope) -> OutboxResult<()>;
}
