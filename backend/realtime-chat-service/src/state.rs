use crate::{
    config::Config,
    redis_client::RedisClient,
    services::ChatService,
    store::PgConversationStore,
    websocket::ConnectionRegistry,
};
use idempotency_guard::RedisIdempotencyStore;
use sqlx::PgPool;
use std::sync::Arc;

pub type PgChatService = ChatService<PgConversationStore, RedisIdempotencyStore>;

/// Handles shared by the service façade and the gateway accept path.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub store: Arc<PgConversationStore>,
    pub chat: PgChatService,
    pub registry: ConnectionRegistry,
    pub redis: RedisClient,
    pub config: Arc<Config>,
}
