//! Conversation Store: transactional persistence for conversations,
//! participants, messages and their outbox rows.
//!
//! `append_message` is the only write path for messages. It inserts the
//! message, maintains participants and the conversation summary, and writes
//! exactly one `message.sent` outbox row, all in one transaction.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, SecondsFormat, SubsecRound, Utc};
use thiserror::Error;
use transactional_outbox::OutboxError;
use uuid::Uuid;

use crate::models::{ConversationSummary, Message, Participant};

mod memory;
mod postgres;

pub use memory::InMemoryConversationStore;
pub use postgres::PgConversationStore;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("user {user_id} is not a participant of conversation {conversation_id}")]
    NotParticipant {
        conversation_id: Uuid,
        user_id: Uuid,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<OutboxError> for StoreError {
    fn from(e: OutboxError) -> Self {
        match e {
            OutboxError::SerializationError(e) => StoreError::Serialization(e.to_string()),
            other => StoreError::Database(other.to_string()),
        }
    }
}

/// Input to [`ConversationStore::append_message`].
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub conversation_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    /// Users to join to the conversation alongside the sender.
    pub receiver_ids: Vec<Uuid>,
    /// Defaults to now. Truncated to microseconds either way.
    pub created_at: Option<DateTime<Utc>>,
}

impl NewMessage {
    pub fn new(conversation_id: Uuid, sender_id: Uuid, content: impl Into<String>) -> Self {
        Self {
            conversation_id,
            sender_id,
            content: content.into(),
            receiver_ids: Vec::new(),
            created_at: None,
        }
    }

    pub fn with_receivers(mut self, receiver_ids: Vec<Uuid>) -> Self {
        self.receiver_ids = receiver_ids;
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Timestamp the message will be stored with.
    pub(crate) fn timestamp(&self) -> DateTime<Utc> {
        self.created_at.map_or_else(store_now, |at| at.trunc_subsecs(6))
    }

    /// Receivers other than the sender, deduplicated.
    pub(crate) fn other_receivers(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .receiver_ids
            .iter()
            .copied()
            .filter(|id| *id != self.sender_id)
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Current time at the precision the stores keep (microseconds). Every
/// timestamp a store writes comes from here, never from the database clock.
pub(crate) fn store_now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Read cursor for participants joined by a message append: one microsecond
/// before the message, so that message counts as unread for them.
pub(crate) fn implicit_join_at(message_at: DateTime<Utc>) -> DateTime<Utc> {
    message_at - ChronoDuration::microseconds(1)
}

/// Position in a descending `(timestamp, id)` listing.
///
/// Encoded as `<RFC3339 nanos>~<uuid>`. A bare timestamp (no id) means
/// "strictly older than this instant".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cursor {
    pub at: DateTime<Utc>,
    pub id: Option<Uuid>,
}

impl Cursor {
    pub fn new(at: DateTime<Utc>, id: Uuid) -> Self {
        Self { at, id: Some(id) }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        let (ts, id) = match raw.split_once('~') {
            Some((ts, id)) => {
                let id = Uuid::parse_str(id).map_err(|e| format!("invalid cursor id: {e}"))?;
                (ts, Some(id))
            }
            None => (raw, None),
        };
        let at = DateTime::parse_from_rfc3339(ts)
            .map_err(|e| format!("invalid cursor timestamp: {e}"))?
            .with_timezone(&Utc);
        Ok(Self { at, id })
    }

    pub fn encode(&self) -> String {
        let ts = self.at.to_rfc3339_opts(SecondsFormat::Nanos, true);
        match self.id {
            Some(id) => format!("{ts}~{id}"),
            None => ts,
        }
    }

    /// Whether a row sorted at `(at, id)` comes after this cursor in descending order.
    pub fn precedes(&self, at: DateTime<Utc>, id: Uuid) -> bool {
        match self.id {
            Some(cursor_id) => at < self.at || (at == self.at && id < cursor_id),
            None => at < self.at,
        }
    }
}

/// One page of a descending listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// `None` when no further rows exist.
    pub next_cursor: Option<Cursor>,
}

impl<T> Page<T> {
    /// Build a page from `limit + 1` fetched rows.
    pub(crate) fn from_overfetch(
        mut rows: Vec<T>,
        limit: usize,
        key: impl Fn(&T) -> Cursor,
    ) -> Self {
        let has_more = rows.len() > limit;
        rows.truncate(limit);
        let next_cursor = if has_more { rows.last().map(key) } else { None };
        Self {
            items: rows,
            next_cursor,
        }
    }
}

#[async_trait]
pub trait ConversationStore: Send + Sync {
    /// Atomically insert a message with its participants, summary update and
    /// outbox row. Any failure leaves no trace.
    async fn append_message(&self, new_message: NewMessage) -> StoreResult<Message>;

    /// Join `user_id` to the conversation (creating it if needed). Idempotent.
    async fn join_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Participant>;

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Participant>>;

    /// Advance the read cursor so every current message counts as read.
    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<()>;

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<i64>;

    /// Messages newest first. `limit` must already be within `1..=100`.
    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        before: Option<Cursor>,
    ) -> StoreResult<Page<Message>>;

    /// The user's conversations by most recent activity, with unread counts.
    async fn list_conversations(
        &self,
        user_id: Uuid,
        limit: i64,
        before: Option<Cursor>,
    ) -> StoreResult<Page<ConversationSummary>>;
}
