use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::debug;

use crate::{OutboxEnvelope, OutboxPublisher, OutboxResult};

/// Publishes envelopes as JSON on a Redis pub/sub channel.
///
/// Pub/sub has no backlog: gateways that are offline when an envelope is
/// published never see it. Recipients catch up through the message list,
/// which is the durable copy.
#[derive(Clone)]
pub struct RedisOutboxPublisher {
    conn: ConnectionManager,
    channel: String,
}

impl RedisOutboxPublisher {
    pub const DEFAULT_CHANNEL: &'static str = "chat:events";

    pub fn new(conn: ConnectionManager, channel: impl Into<String>) -> Self {
        Self {
            conn,
            channel: channel.into(),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }
}

#[async_trait]
impl OutboxPublisher for RedisOutboxPublisher {
    async fn publish(&self, envelope: &OutboxEnvelope) -> OutboxResult<()> {
        let payload = serde_json::to_string(envelope)?;

        let mut conn = self.conn.clone();
        let receivers: i64 = conn.publish(&self.channel, payload).await?;

        debug!(
            event_id = %envelope.event_id,
            channel = %self.channel,
            receivers,
            "Envelope published"
        );

        Ok(())
    }
}
