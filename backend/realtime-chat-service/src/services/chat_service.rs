//! # Chat Service
//!
//! The four operations exposed to the request façade. Ids arrive as strings
//! exactly as the façade received them; validation happens here, before any
//! side effect.
//!
//! | Failure | Error |
//! |---|---|
//! | empty caller id | `Unauthorized` (401) |
//! | malformed id, empty content/key, bad cursor | `BadRequest` (400) |
//! | duplicate idempotency key | `Conflict` (409) |
//! | caller is not a participant (reads, mark-as-read) | `NotFound` (404) |
//! | store or Redis failure | `Database` / `Internal` (500) |

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::models::{ConversationSummary, Message};
use crate::store::{ConversationStore, Cursor, NewMessage};
use idempotency_guard::{Guarded, IdempotencyGuard, IdempotencyStore};

pub const DEFAULT_PAGE_SIZE: i64 = 50;
pub const MAX_PAGE_SIZE: i64 = 100;

pub const STATUS_SENT: &str = "SENT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub user_id: String,
    pub conversation_id: String,
    pub content: String,
    pub idempotency_key: String,
    /// Other users to join to the conversation with this message.
    #[serde(default)]
    pub receiver_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageResponse {
    pub message_id: Uuid,
    pub status: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetMessagesRequest {
    pub user_id: String,
    pub conversation_id: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub before_cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetMessagesResponse {
    pub messages: Vec<Message>,
    /// Empty when there are no older messages.
    pub next_cursor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GetConversationsRequest {
    pub user_id: String,
    #[serde(default)]
    pub limit: i64,
    #[serde(default)]
    pub cursor: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetConversationsResponse {
    pub conversations: Vec<ConversationSummary>,
    pub next_cursor: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MarkAsReadRequest {
    pub user_id: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkAsReadResponse {
    pub success: bool,
}

/// Clamp a requested page size into `1..=MAX_PAGE_SIZE`.
pub fn sanitize_limit(limit: i64) -> i64 {
    if limit <= 0 {
        DEFAULT_PAGE_SIZE
    } else {
        limit.min(MAX_PAGE_SIZE)
    }
}

fn caller_id(raw: &str) -> AppResult<Uuid> {
    if raw.trim().is_empty() {
        return Err(AppError::Unauthorized);
    }
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest("user_id must be a valid UUID".to_string()))
}

fn parse_id(field: &str, raw: &str) -> AppResult<Uuid> {
    if raw.trim().is_empty() {
        return Err(AppError::BadRequest(format!("{field} is required")));
    }
    Uuid::parse_str(raw.trim())
        .map_err(|_| AppError::BadRequest(format!("{field} must be a valid UUID")))
}

fn parse_cursor(raw: &str) -> AppResult<Option<Cursor>> {
    if raw.is_empty() {
        return Ok(None);
    }
    Cursor::parse(raw).map(Some).map_err(AppError::BadRequest)
}

fn encode_cursor(cursor: Option<Cursor>) -> String {
    cursor.map(|c| c.encode()).unwrap_or_default()
}

pub struct ChatService<S: ConversationStore, I: IdempotencyStore> {
    store: Arc<S>,
    guard: IdempotencyGuard<I>,
}

impl<S: ConversationStore, I: IdempotencyStore> Clone for ChatService<S, I> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            guard: self.guard.clone(),
        }
    }
}

impl<S: ConversationStore, I: IdempotencyStore> ChatService<S, I> {
    pub fn new(store: Arc<S>, guard: IdempotencyGuard<I>) -> Self {
        Self { store, guard }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Persist a message exactly once per `(user_id, idempotency_key)`.
    ///
    /// A replayed key is rejected with `Conflict` without touching the store.
    /// If the write fails the key is released, so the client can retry with it.
    pub async fn send_message(&self, req: SendMessageRequest) -> AppResult<SendMessageResponse> {
        let sender_id = caller_id(&req.user_id)?;
        let conversation_id = parse_id("conversation_id", &req.conversation_id)?;
        if req.content.trim().is_empty() {
            return Err(AppError::BadRequest("content is required".to_string()));
        }
        if req.idempotency_key.is_empty() {
            return Err(AppError::BadRequest("idempotency_key is required".to_string()));
        }
        IdempotencyGuard::<I>::validate_key(&req.idempotency_key)?;
        let receiver_ids = req
            .receiver_ids
            .iter()
            .map(|raw| parse_id("receiver_ids", raw))
            .collect::<AppResult<Vec<_>>>()?;

        let new_message = NewMessage::new(conversation_id, sender_id, req.content)
            .with_receivers(receiver_ids);

        let outcome = self
            .guard
            .scoped(sender_id)
            .run_once(&req.idempotency_key, move || async move {
                self.store
                    .append_message(new_message)
                    .await
                    .map_err(AppError::from)
            })
            .await?;

        match outcome {
            Guarded::Completed(message) => {
                info!(
                    message_id = %message.id,
                    conversation_id = %conversation_id,
                    sender_id = %sender_id,
                    "Message sent"
                );
                Ok(SendMessageResponse {
                    message_id: message.id,
                    status: STATUS_SENT.to_string(),
                })
            }
            Guarded::Duplicate => {
                warn!(
                    conversation_id = %conversation_id,
                    sender_id = %sender_id,
                    idempotency_key = %req.idempotency_key,
                    "Duplicate send rejected"
                );
                Err(AppError::Conflict(
                    "idempotency key already used".to_string(),
                ))
            }
        }
    }

    pub async fn get_messages(&self, req: GetMessagesRequest) -> AppResult<GetMessagesResponse> {
        let user_id = caller_id(&req.user_id)?;
        let conversation_id = parse_id("conversation_id", &req.conversation_id)?;
        let before = parse_cursor(&req.before_cursor)?;

        self.require_participant(conversation_id, user_id).await?;

        let page = self
            .store
            .list_messages(conversation_id, sanitize_limit(req.limit), before)
            .await?;

        Ok(GetMessagesResponse {
            messages: page.items,
            next_cursor: encode_cursor(page.next_cursor),
        })
    }

    pub async fn get_conversations(
        &self,
        req: GetConversationsRequest,
    ) -> AppResult<GetConversationsResponse> {
        let user_id = caller_id(&req.user_id)?;
        let before = parse_cursor(&req.cursor)?;

        let page = self
            .store
            .list_conversations(user_id, sanitize_limit(req.limit), before)
            .await?;

        Ok(GetConversationsResponse {
            conversations: page.items,
            next_cursor: encode_cursor(page.next_cursor),
        })
    }

    pub async fn mark_as_read(&self, req: MarkAsReadRequest) -> AppResult<MarkAsReadResponse> {
        let user_id = caller_id(&req.user_id)?;
        let conversation_id = parse_id("conversation_id", &req.conversation_id)?;

        self.store.mark_read(conversation_id, user_id).await?;
        Ok(MarkAsReadResponse { success: true })
    }

    /// Explicitly join a conversation. Used by the façade when a user opens
    /// a conversation before anyone has messaged them in it.
    pub async fn join_conversation(&self, user_id: &str, conversation_id: &str) -> AppResult<()> {
        let user_id = caller_id(user_id)?;
        let conversation_id = parse_id("conversation_id", conversation_id)?;
        self.store
            .join_conversation(conversation_id, user_id)
            .await?;
        Ok(())
    }

    pub async fn unread_count(&self, user_id: &str, conversation_id: &str) -> AppResult<i64> {
        let user_id = caller_id(user_id)?;
        let conversation_id = parse_id("conversation_id", conversation_id)?;
        Ok(self.store.unread_count(conversation_id, user_id).await?)
    }

    async fn require_participant(&self, conversation_id: Uuid, user_id: Uuid) -> AppResult<()> {
        match self.store.get_participant(conversation_id, user_id).await? {
            Some(_) => Ok(()),
            None => Err(AppError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_limit() {
        assert_eq!(sanitize_limit(0), 50);
        assert_eq!(sanitize_limit(-5), 50);
        assert_eq!(sanitize_limit(1), 1);
        assert_eq!(sanitize_limit(100), 100);
        assert_eq!(sanitize_limit(1000), 100);
    }

    #[test]
    fn test_caller_id() {
        assert!(matches!(caller_id(""), Err(AppError::Unauthorized)));
        assert!(matches!(caller_id("   "), Err(AppError::Unauthorized)));
        assert!(matches!(caller_id("bob"), Err(AppError::BadRequest(_))));
        let id = Uuid::new_v4();
        assert_eq!(caller_id(&id.to_string()).unwrap(), id);
    }

    #[test]
    fn test_parse_cursor() {
        assert!(parse_cursor("").unwrap().is_none());
        assert!(parse_cursor("2024-01-15T10:30:00Z").unwrap().is_some());
        assert!(matches!(
            parse_cursor("page-2"),
            Err(AppError::BadRequest(_))
        ));
    }
}
