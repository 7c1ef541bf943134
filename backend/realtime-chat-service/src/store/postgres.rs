use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, info};
use transactional_outbox::{OutboxEvent, SqlxOutboxRepository};
use uuid::Uuid;

use super::{
    implicit_join_at, store_now, ConversationStore, Cursor, NewMessage, Page, StoreError,
    StoreResult,
};
use crate::models::{
    ConversationSummary, Message, MessageSentPayload, Participant, MESSAGE_AGGREGATE,
    MESSAGE_SENT_EVENT,
};

/// PostgreSQL-backed [`ConversationStore`].
#[derive(Clone)]
pub struct PgConversationStore {
    pool: PgPool,
    outbox: SqlxOutboxRepository,
}

impl PgConversationStore {
    pub fn new(pool: PgPool) -> Self {
        let outbox = SqlxOutboxRepository::new(pool.clone());
        Self { pool, outbox }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn ensure_conversation(
        tx: &mut Transaction<'_, Postgres>,
        conversation_id: Uuid,
        created_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conversations (id, created_at)
            VALUES ($1, $2)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn participant_from_row(row: &PgRow) -> Result<Participant, sqlx::Error> {
    Ok(Participant {
        conversation_id: row.try_get("conversation_id")?,
        user_id: row.try_get("user_id")?,
        joined_at: row.try_get("joined_at")?,
        last_read_at: row.try_get("last_read_at")?,
    })
}

fn message_from_row(row: &PgRow) -> Result<Message, sqlx::Error> {
    Ok(Message {
        id: row.try_get("id")?,
        conversation_id: row.try_get("conversation_id")?,
        sender_id: row.try_get("sender_id")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<ConversationSummary, sqlx::Error> {
    Ok(ConversationSummary {
        id: row.try_get("id")?,
        created_at: row.try_get("created_at")?,
        last_message_content: row.try_get("last_message_content")?,
        last_message_at: row.try_get("last_message_at")?,
        unread_count: row.try_get("unread_count")?,
    })
}

#[async_trait]
impl ConversationStore for PgConversationStore {
    async fn append_message(&self, new_message: NewMessage) -> StoreResult<Message> {
        let created_at = new_message.timestamp();
        let conversation_id = new_message.conversation_id;
        let sender_id = new_message.sender_id;

        let mut tx = self.pool.begin().await?;

        Self::ensure_conversation(&mut tx, conversation_id, created_at).await?;

        // Sending implies having read everything up to this message.
        sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, joined_at, last_read_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (conversation_id, user_id)
            DO UPDATE SET last_read_at = GREATEST(conversation_participants.last_read_at, EXCLUDED.last_read_at)
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .bind(created_at)
        .execute(&mut *tx)
        .await?;

        let receivers = new_message.other_receivers();
        if !receivers.is_empty() {
            let joined_at = implicit_join_at(created_at);
            sqlx::query(
                r#"
                INSERT INTO conversation_participants (conversation_id, user_id, joined_at, last_read_at)
                SELECT $1, receiver_id, $3, $3
                FROM UNNEST($2::uuid[]) AS receiver_id
                ON CONFLICT (conversation_id, user_id) DO NOTHING
                "#,
            )
            .bind(conversation_id)
            .bind(&receivers)
            .bind(joined_at)
            .execute(&mut *tx)
            .await?;
        }

        let message = Message {
            id: Uuid::new_v4(),
            conversation_id,
            sender_id,
            content: new_message.content,
            created_at,
        };

        sqlx::query(
            r#"
            INSERT INTO messages (id, conversation_id, sender_id, content, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(message.id)
        .bind(message.conversation_id)
        .bind(message.sender_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        // Never move the summary backwards when an older timestamp commits late.
        sqlx::query(
            r#"
            UPDATE conversations
            SET last_message_content = $2, last_message_at = $3
            WHERE id = $1 AND (last_message_at IS NULL OR last_message_at <= $3)
            "#,
        )
        .bind(conversation_id)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await?;

        let receiver_ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT user_id FROM conversation_participants
            WHERE conversation_id = $1 AND user_id <> $2
            ORDER BY user_id
            "#,
        )
        .bind(conversation_id)
        .bind(sender_id)
        .fetch_all(&mut *tx)
        .await?;

        let payload = serde_json::to_value(MessageSentPayload::new(&message, receiver_ids))?;
        let event = OutboxEvent::new(
            MESSAGE_AGGREGATE,
            message.id,
            MESSAGE_SENT_EVENT,
            payload,
            message.created_at,
        );
        self.outbox.insert(&mut tx, &event).await?;

        tx.commit().await?;

        info!(
            message_id = %message.id,
            conversation_id = %conversation_id,
            event_id = %event.id,
            "Message appended"
        );
        Ok(message)
    }

    async fn join_conversation(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Participant> {
        let now = store_now();
        let mut tx = self.pool.begin().await?;
        Self::ensure_conversation(&mut tx, conversation_id, now).await?;

        // The no-op update makes RETURNING yield the existing row on conflict.
        let row = sqlx::query(
            r#"
            INSERT INTO conversation_participants (conversation_id, user_id, joined_at, last_read_at)
            VALUES ($1, $2, $3, $3)
            ON CONFLICT (conversation_id, user_id)
            DO UPDATE SET user_id = EXCLUDED.user_id
            RETURNING conversation_id, user_id, joined_at, last_read_at
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        debug!(conversation_id = %conversation_id, user_id = %user_id, "Participant joined");
        Ok(participant_from_row(&row)?)
    }

    async fn get_participant(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
    ) -> StoreResult<Option<Participant>> {
        let row = sqlx::query(
            r#"
            SELECT conversation_id, user_id, joined_at, last_read_at
            FROM conversation_participants
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(participant_from_row).transpose()?)
    }

    async fn mark_read(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<()> {
        // Same clock as message timestamps. The newest message is covered too,
        // since callers may append with an explicit timestamp ahead of now.
        let result = sqlx::query(
            r#"
            UPDATE conversation_participants
            SET last_read_at = GREATEST(
                last_read_at,
                $3,
                COALESCE((SELECT MAX(created_at) FROM messages WHERE conversation_id = $1), last_read_at)
            )
            WHERE conversation_id = $1 AND user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .bind(store_now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotParticipant {
                conversation_id,
                user_id,
            });
        }
        Ok(())
    }

    async fn unread_count(&self, conversation_id: Uuid, user_id: Uuid) -> StoreResult<i64> {
        let count: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT (
                SELECT COUNT(*) FROM messages m
                WHERE m.conversation_id = p.conversation_id AND m.created_at > p.last_read_at
            )
            FROM conversation_participants p
            WHERE p.conversation_id = $1 AND p.user_id = $2
            "#,
        )
        .bind(conversation_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        count.ok_or(StoreError::NotParticipant {
            conversation_id,
            user_id,
        })
    }

    async fn list_messages(
        &self,
        conversation_id: Uuid,
        limit: i64,
        before: Option<Cursor>,
    ) -> StoreResult<Page<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT id, conversation_id, sender_id, content, created_at
            FROM messages
            WHERE conversation_id = $1
              AND (
                $2::timestamptz IS NULL
                OR created_at < $2
                OR ($3::uuid IS NOT NULL AND created_at = $2 AND id < $3)
              )
            ORDER BY created_at DESC, id DESC
            LIMIT $4
            "#,
        )
        .bind(conversation_id)
        .bind(before.map(|c| c.at))
        .bind(before.and_then(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let messages = rows
            .iter()
            .map(message_from_row)
            .collect::<Result<Vec<_>, _>>()?;

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
        let rows = sqlx::query(
            r#"
            SELECT
                c.id,
                c.created_at,
                c.last_message_content,
                c.last_message_at,
                (
                    SELECT COUNT(*) FROM messages m
                    WHERE m.conversation_id = c.id AND m.created_at > p.last_read_at
                ) AS unread_count
            FROM conversation_participants p
            JOIN conversations c ON c.id = p.conversation_id
            WHERE p.user_id = $1
              AND (
                $2::timestamptz IS NULL
                OR COALESCE(c.last_message_at, c.created_at) < $2
                OR ($3::uuid IS NOT NULL AND COALESCE(c.last_message_at, c.created_at) = $2 AND c.id < $3)
              )
            ORDER BY COALESCE(c.last_message_at, c.created_at) DESC, c.id DESC
            LIMIT $4
            "#,
        )
        .bind(user_id)
        .bind(before.map(|c| c.at))
        .bind(before.and_then(|c| c.id))
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        let summaries = rows
            .iter()
            .map(summary_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page::from_overfetch(summaries, limit as usize, |c| {
            Cursor::new(c.activity_at(), c.id)
        }))
    }
}
