use idempotency_guard::{IdempotencyGuard, RedisIdempotencyStore};
use realtime_chat_service::{
    config, db, error, logging,
    metrics::GatewayMetrics,
    redis_client::RedisClient,
    services::ChatService,
    state::AppState,
    store::PgConversationStore,
    websocket::{BroadcastSubscriber, ConnectionRegistry, EventRouter, SubscriberConfig},
};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use transactional_outbox::{
    metrics::OutboxMetrics, OutboxRelay, RedisOutboxPublisher, SqlxOutboxRepository,
};

const SERVICE_NAME: &str = "realtime-chat-service";

#[tokio::main]
async fn main() -> Result<(), error::AppError> {
    logging::init_tracing();
    let cfg = Arc::new(config::Config::from_env()?);
    tracing::info!(config = ?cfg, "starting {}", SERVICE_NAME);

    let db = db::init_pool(&cfg)
        .await
        .map_err(|e| error::AppError::StartServer(format!("db: {e}")))?;

    let redis = RedisClient::from_url(&cfg.redis_url)
        .await
        .map_err(|e| error::AppError::StartServer(format!("redis: {e}")))?;

    let (pending_ttl, completed_ttl) = cfg.idempotency_ttls();
    let guard = IdempotencyGuard::new(Arc::new(RedisIdempotencyStore::new(redis.manager())))
        .with_ttls(pending_ttl, completed_ttl);
    let store = Arc::new(PgConversationStore::new(db.clone()));
    let registry = ConnectionRegistry::new(cfg.send_queue_capacity)
        .with_metrics(GatewayMetrics::new(SERVICE_NAME));

    let state = AppState {
        db: db.clone(),
        store: store.clone(),
        chat: ChatService::new(store, guard),
        registry: registry.clone(),
        redis: redis.clone(),
        config: cfg.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

    if cfg.outbox.enabled {
        let relay = OutboxRelay::new(
            Arc::new(SqlxOutboxRepository::new(db.clone())),
            Arc::new(RedisOutboxPublisher::new(
                redis.manager(),
                cfg.events_channel.clone(),
            )),
            cfg.outbox.relay_config(),
        )
        .with_metrics(OutboxMetrics::new(SERVICE_NAME));
        let shutdown = shutdown_rx.clone();
        tasks.push((
            "outbox relay",
            tokio::spawn(async move { relay.run(shutdown).await }),
        ));
    } else {
        tracing::info!("Outbox relay disabled on this instance");
    }

    let subscriber = BroadcastSubscriber::new(
        redis.client(),
        EventRouter::new(registry),
        SubscriberConfig {
            channel: cfg.events_channel.clone(),
            ..SubscriberConfig::default()
        },
    );
    let shutdown = shutdown_rx.clone();
    tasks.push((
        "broadcast subscriber",
        tokio::spawn(async move { subscriber.run(shutdown).await }),
    ));

    tracing::info!(
        instance_id = %state.config.instance_id,
        channel = %state.config.events_channel,
        "{} ready",
        SERVICE_NAME
    );

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested; draining background tasks");
    let _ = shutdown_tx.send(true);

    for (name, task) in tasks {
        if let Err(e) = task.await {
            tracing::error!(task = name, error = %e, "background task panicked");
        }
    }

    tracing::info!(
        open_connections = state.registry.total_connections().await,
        "{} stopped",
        SERVICE_NAME
    );
    Ok(())
}
