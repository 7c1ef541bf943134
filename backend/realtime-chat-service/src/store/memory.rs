use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use transactional_outbox::{
    FailureAction, OutboxError, OutboxEvent, OutboxRepository, OutboxResult,
};
use uuid::Uuid;

use super::{
    implicit_join_at, store_now, ConversationStore, Cursor, NewMessage, Page, StoreError,
    StoreResult,
};
use crate::models::{
    Conversation, ConversationSummary, Message, MessageSentPayload, Participant,
    MESSAGE_AGGREGATE, MESSAGE_SENT_EVENT,
};

#[derive(Clone)]
struct OutboxRow {
    event: OutboxEvent,
    locked_until: Option<DateTime<Utc>>,
}

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<Uuid, Conversation>,
    participants: HashMap<(Uuid, Uuid), Participant>,
    messages: Vec<Message>,
    outbox: Vec<OutboxRow>,
}

impl MemoryState {
    fn ensure_conversation(&mut self, conversation_id: Uuid, created_at: DateTime<Utc>) {
        self.conversations
            .entry(conversation_id)
            .or_insert_with(|| Conversation {
                id: conversation_id,
                created_at,
                last_message_content: None,
                last_message_at: None,
            });
    }

    fn unread(&self, participant: &Participant) -> i64 {
        self.messages
            .iter()
            .filter(|m| {
                m.conversation_id == participant.conversation_id
                    && m.created_at > participant.last_read_at
            })
            .count() as i64
    }

    fn newest_message_at(&self, conversation_id: Uuid) -> Option<DateTime<Utc>> {
        self.messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .map(|m| m.created_at)
            .max()
    }
}

/// Process-local [`ConversationStore`] that also serves as the outbox
/// repository, so the send → relay → router path runs without PostgreSQL.
///
/// An append finishes every fallible step before its first write, so a
/// failed append leaves no partial rows behind.
#[derive(Clone, Default)]
pub struct InMemoryConversationStore {
    state: Arc<Mutex<MemoryState>>,
    fail_outbox_writes: Arc<AtomicBool>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the outbox step of every subsequent append fail.
    pub fn fail_outbox_writes(&self, fail: bool) {
        self.fail_outbox_writes.store(fail, Ordering::SeqCst);
    }

    pub fn message_count(&self) -> usize {
        self.lock().messages.len()
    }

    pub fn conversation(&self, conversation_id: Uuid) -> Option<Conversation> {
        self.lock().conversations.get(&conversation_id).cloned()
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.lock().outbox.iter().map(|r| r.event.clone()).collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().expect("Mutex should not be poisoned")
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn append_message(&self, new_message: NewMessage) -> StoreResult<Message> {
        let created_at = new_message.timestamp();
        let conversation_id = new_message.conversation_id;
        let sender_id = new_message.sender_id;
        let joining = new_message.other_receivers();

        let mut state = self.lock();

        // Fallible steps first: nothing below the payload touches the state.
        let mut receiver_ids: Vec<Uuid> = state
            .participants
            .keys()
            .filter(|(cid, uid)| *cid == conversation_id && *uid != sender_id)
            .map(|(_, uid)| *uid)
            .chain(joining.iter().copied())
            .collect();
        receiver_ids.sort();
        receiver_ids.dedup();

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: new_message.content,
            created_at,
        };
        if self.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("outbox insert failed".to_string()));
        }
        let payload = serde_json::to_value(MessageSentPayload::new(&message, receiver_ids))?;

        state.ensure_conversation(conversation_id, created_at);
        state
            .participants
            .entry((conversation_id, sender_id))
            .and_modify(|p| p.last_read_at = p.last_read_at.max(created_at))
            .or_insert(Participant {
                conversation_id,
                user_id: sender_id,
                joined_at: created_at,
                last_read_at: created_at,
            });

        let joined_at = implicit_join_at(created_at);
        for receiver_id in joining {
            state
                .participants
                .entry((conversation_id, receiver_id))
                .or_insert(Participant {
                    conversation_id,
                    user_id: receiver_id,
                    joined_at,
                    last_read_at: joined_at,
                });
        }

        if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
            if conversation
                .last_message_at
                .map_or(true, |last| last <= created_at)
            {
                conversation.last_message_content = Some(message.content.clone());
                conversation.last_message_at = Some(created_at);
            }
        }

        state.messages.push(message.clone());
        state.outbox.push(OutboxRow {
            event: OutboxEvent::new(
                MESSAGE_AGGREGATE,
                message.id,
                MESSAGE_SENT_EVENT,
                payload,
                created_at,
            ),
            locked_until: None,
        });
        Ok(message)
    }

    async fn join_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Participant> {
        let now = store_now();
        let mut state = self.lock();
        state.ensure_conversation(conversation_id, now);
        Ok(state
            .participants
            .entry((conversation_id, user_id))
            .or_insert(Participant {
                conversation_id,
                user_id,
                joined_at: now,
                last_read_at: now,
            })
            .clone())
    }

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Participant>> {
        Ok(self
            .lock()
            .participants
            .get(&(conversation_id, user_id))
            .cloned())
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        let mut state = self.lock();
        let newest = state.newest_message_at(conversation_id);
        let participant = state
            .participants
            .get_mut(&(conversation_id, user_id))
            .ok_or(StoreError::NotParticipant {
                conversation_id,
                user_id,
            })?;

        let mut read_to = participant.last_read_at.max(store_now());
        if let Some(newest) = newest {
            read_to = read_to.max(newest);
        }
        participant.last_read_at = read_to;
        Ok(())
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<i64> {
        let state = self.lock();
        let participant = state
            .participants
            .get(&(conversation_id, user_id))
            .ok_or(StoreError::NotParticipant {
                conversation_id,
                user_id,
            })?;
        Ok(state.unread(participant))
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        before: Option<Cursor>,
    ) -> StoreResult<Page<Message>> {
        let state = self.lock();
        let mut messages: Vec<Message> = state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .filter(|m| before.map_or(true, |c| c.precedes(m.created_at, m.id)))
            .cloned()
            .collect();
        messages.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        messages.truncate(limit as usize + 1);

        Ok(Page::from_overfetch(messages, limit as usize, |m| {
            Cursor::new(m.created_at, m.id)
        }))
    }

    async fn list_conversations(
        &self,
        user_id: Uuid,
        limit: i64,
        before: Option<Cursor>,
    ) -> StoreResult<Page<ConversationSummary>> {
        let state = self.lock();
        let mut summaries: Vec<ConversationSummary> = state
            .participants
            .values()
            .filter(|p| p.user_id == user_id)
            .filter_map(|p| {
                let conversation = state.conversations.get(&p.conversation_id)?;
                Some(ConversationSummary {
                    id: conversation.id,
                    created_at: conversation.created_at,
                    last_message_content: conversation.last_message_content.clone(),
                    last_message_at: conversation.last_message_at,
                    unread_count: state.unread(p),
                })
            })
            .filter(|s| before.map_or(true, |c| c.precedes(s.activity_at(), s.id)))
            .collect();
        summaries.sort_by(|a, b| (b.activity_at(), b.id).cmp(&(a.activity_at(), a.id)));
        summaries.truncate(limit as usize + 1);

        Ok(Page::from_overfetch(summaries, limit as usize, |c| {
            Cursor::new(c.activity_at(), c.id)
        }))
    }
}

fn lease_until(now: DateTime<Utc>, lease: Duration) -> DateTime<Utc> {
    now + chrono::Duration::from_std(lease).unwrap_or_else(|_| chrono::Duration::seconds(30))
}

#[async_trait]
impl OutboxRepository for InMemoryConversationStore {
    async fn claim_batch(&self, limit: i64, lease: Duration) -> OutboxResult<Vec<OutboxEvent>> {
        let now = Utc::now();
        let mut state = self.lock();
        let mut eligible: Vec<&mut OutboxRow> = state
            .outbox
            .iter_mut()
            .filter(|r| {
                r.event.processed_at.is_none()
                    && r.event.dead_lettered_at.is_none()
                    && r.locked_until.map_or(true, |until| until <= now)
            })
            .collect();
        eligible.sort_by_key(|r| r.event.created_at);

        Ok(eligible
            .into_iter()
            .take(limit.max(0) as usize)
            .map(|row| {
                row.locked_until = Some(lease_until(now, lease));
                row.event.clone()
            })
            .collect())
    }

    async fn mark_processed(&self, event_id: Uuid) -> OutboxResult<bool> {
        let mut state = self.lock();
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.event.id == event_id)
            .ok_or(OutboxError::EventNotFound(event_id))?;
        row.locked_until = None;
        if row.event.processed_at.is_some() {
            return Ok(false);
        }
        row.event.processed_at = Some(Utc::now());
        Ok(true)
    }

    async fn mark_failed(
        &self,
        event_id: Uuid,
        error: &str,
        action: FailureAction,
    ) -> OutboxResult<()> {
        let now = Utc::now();
        let mut state = self.lock();
        let row = state
            .outbox
            .iter_mut()
            .find(|r| r.event.id == event_id && r.event.processed_at.is_none())
            .ok_or(OutboxError::EventNotFound(event_id))?;
        row.event.retry_count += 1;
        row.event.last_error = Some(error.to_string());
        match action {
            FailureAction::RetryAfter(delay) => row.locked_until = Some(lease_until(now, delay)),
            FailureAction::DeadLetter => {
                row.locked_until = None;
                row.event.dead_lettered_at = Some(now);
            }
        }
        Ok(())
    }

    async fn pending_stats(&self) -> OutboxResult<(i64, i64)> {
        let now = Utc::now();
        let state = self.lock();
        let pending: Vec<&OutboxRow> = state
            .outbox
            .iter()
            .filter(|r| r.event.processed_at.is_none() && r.event.dead_lettered_at.is_none())
            .collect();
        let oldest_age = pending
            .iter()
            .map(|r| (now - r.event.created_at).num_seconds())
            .max()
            .unwrap_or(0);
        Ok((pending.len() as i64, oldest_age.max(0)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[tokio::test]
    async fn append_creates_conversation_participants_and_outbox_row() {
        let store = InMemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        let message = store
            .append_message(
                NewMessage::new(conversation_id, alice, "Hello").with_receivers(vec![bob]),
            )
            .await
            .unwrap();

        let conversation = store.conversation(conversation_id).unwrap();
        assert_eq!(conversation.last_message_content.as_deref(), Some("Hello"));
        assert_eq!(conversation.last_message_at, Some(message.created_at));

        let events = store.outbox_events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].aggregate_id, message.id);
        assert!(events[0].processed_at.is_none());
        let payload = MessageSentPayload::from_value(events[0].payload.clone()).unwrap();
        assert_eq!(payload.receiver_ids, vec![bob]);

        assert_eq!(store.unread_count(conversation_id, bob).await.unwrap(), 1);
        assert_eq!(store.unread_count(conversation_id, alice).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_outbox_write_leaves_no_trace() {
        let store = InMemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        store.fail_outbox_writes(true);

        let result = store
            .append_message(NewMessage::new(conversation_id, Uuid::new_v4(), "lost"))
            .await;

        assert!(matches!(result, Err(StoreError::Database(_))));
        assert_eq!(store.message_count(), 0);
        assert!(store.outbox_events().is_empty());
        assert!(store.conversation(conversation_id).is_none());
    }

    #[tokio::test]
    async fn summary_never_moves_backwards() {
        let store = InMemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        let sender = Uuid::new_v4();
        let now = Utc::now();

        store
            .append_message(NewMessage::new(conversation_id, sender, "newer").at(now))
            .await
            .unwrap();
        store
            .append_message(
                NewMessage::new(conversation_id, sender, "older").at(now - ChronoDuration::seconds(5)),
            )
            .await
            .unwrap();

        let conversation = store.conversation(conversation_id).unwrap();
        assert_eq!(conversation.last_message_content.as_deref(), Some("newer"));
    }

    #[tokio::test]
    async fn mark_read_requires_participant() {
        let store = InMemoryConversationStore::new();
        let err = store
            .mark_read(Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotParticipant { .. }));
    }

    #[tokio::test]
    async fn mark_read_cursor_uses_message_precision() {
        let store = InMemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store
            .append_message(NewMessage::new(conversation_id, alice, "one").with_receivers(vec![bob]))
            .await
            .unwrap();
        store.mark_read(conversation_id, bob).await.unwrap();

        let read_to = store
            .get_participant(conversation_id, bob)
            .await
            .unwrap()
            .unwrap()
            .last_read_at;
        assert_eq!(read_to.timestamp_subsec_nanos() % 1_000, 0);

        store
            .append_message(
                NewMessage::new(conversation_id, alice, "two")
                    .at(read_to + ChronoDuration::microseconds(1)),
            )
            .await
            .unwrap();
        assert_eq!(store.unread_count(conversation_id, bob).await.unwrap(), 1);

        let joined = store
            .join_conversation(conversation_id, Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(joined.joined_at.timestamp_subsec_nanos() % 1_000, 0);
    }

    #[tokio::test]
    async fn join_is_idempotent_and_starts_cursor_at_join_time() {
        let store = InMemoryConversationStore::new();
        let conversation_id = Uuid::new_v4();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        store
            .append_message(NewMessage::new(conversation_id, alice, "before bob"))
            .await
            .unwrap();

        let first = store.join_conversation(conversation_id, bob).await.unwrap();
        let second = store.join_conversation(conversation_id, bob).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(store.unread_count(conversation_id, bob).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn claims_hide_rows_until_lease_expires() {
        let store = InMemoryConversationStore::new();
        store
            .append_message(NewMessage::new(Uuid::new_v4(), Uuid::new_v4(), "hi"))
            .await
            .unwrap();

        let lease = Duration::from_secs(30);
        assert_eq!(store.claim_batch(10, lease).await.unwrap().len(), 1);
        assert!(store.claim_batch(10, lease).await.unwrap().is_empty());

        let (pending, _) = store.pending_stats().await.unwrap();
        assert_eq!(pending, 1);
    }
}
