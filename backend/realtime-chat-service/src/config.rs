use dotenvy::dotenv;
use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use transactional_outbox::RelayConfig;

/// Outbox relay settings as read from the environment.
#[derive(Debug, Clone)]
pub struct OutboxConfig {
    pub enabled: bool,
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_retries: i32,
    pub worker_count: usize,
    pub base_backoff_ms: u64,
    pub claim_lease_secs: u64,
}

impl OutboxConfig {
    pub fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms.max(1)),
            batch_size: self.batch_size.max(1),
            max_retries: self.max_retries.max(1),
            worker_count: self.worker_count.max(1),
            base_backoff: Duration::from_millis(self.base_backoff_ms),
            claim_lease: Duration::from_secs(self.claim_lease_secs.max(1)),
        }
    }
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    pub redis_url: String,
    pub db_max_connections: u32,
    pub db_min_connections: u32,
    pub db_acquire_timeout_secs: u64,
    pub outbox: OutboxConfig,
    pub events_channel: String,
    pub idempotency_ttl_secs: u64,
    pub idempotency_pending_ttl_secs: u64,
    pub send_queue_capacity: usize,
    pub instance_id: String,
}

// Keeps credentials embedded in DATABASE_URL out of logs.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("database_url", &"<redacted>")
            .field("redis_url", &self.redis_url)
            .field("db_max_connections", &self.db_max_connections)
            .field("db_min_connections", &self.db_min_connections)
            .field("db_acquire_timeout_secs", &self.db_acquire_timeout_secs)
            .field("outbox", &self.outbox)
            .field("events_channel", &self.events_channel)
            .field("idempotency_ttl_secs", &self.idempotency_ttl_secs)
            .field(
                "idempotency_pending_ttl_secs",
                &self.idempotency_pending_ttl_secs,
            )
            .field("send_queue_capacity", &self.send_queue_capacity)
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, crate::error::AppError> {
        dotenv().ok();
        let database_url = env::var("DATABASE_URL")
            .map_err(|_| crate::error::AppError::Config("DATABASE_URL missing".into()))?;
        let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());

        let outbox = OutboxConfig {
            enabled: env_or("OUTBOX_ENABLED", true),
            poll_interval_ms: env_or("OUTBOX_POLL_INTERVAL_MS", 100),
            batch_size: env_or("OUTBOX_BATCH_SIZE", 100),
            max_retries: env_or("OUTBOX_MAX_RETRIES", 3),
            worker_count: env_or("OUTBOX_WORKER_COUNT", 10),
            base_backoff_ms: env_or("OUTBOX_BASE_BACKOFF_MS", 1000),
            claim_lease_secs: env_or("OUTBOX_CLAIM_LEASE_SECS", 30),
        };

        let instance_id = env::var("WS_GATEWAY_INSTANCE_ID")
            .or_else(|_| env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("gateway-{}", uuid::Uuid::new_v4().simple()));

        Ok(Self {
            database_url,
            redis_url,
            db_max_connections: env_or("DB_MAX_CONNECTIONS", 20),
            db_min_connections: env_or("DB_MIN_CONNECTIONS", 2),
            db_acquire_timeout_secs: env_or("DB_ACQUIRE_TIMEOUT_SECS", 10),
            outbox,
            events_channel: env::var("CHAT_EVENTS_CHANNEL")
                .unwrap_or_else(|_| transactional_outbox::RedisOutboxPublisher::DEFAULT_CHANNEL.into()),
            idempotency_ttl_secs: env_or("IDEMPOTENCY_TTL_SECS", 86_400),
            idempotency_pending_ttl_secs: env_or("IDEMPOTENCY_PENDING_TTL_SECS", 30),
            send_queue_capacity: env_or("WS_SEND_QUEUE_CAPACITY", 256usize).max(1),
            instance_id,
        })
    }

    pub fn idempotency_ttls(&self) -> (Duration, Duration) {
        (
            Duration::from_secs(self.idempotency_pending_ttl_secs.max(1)),
            Duration::from_secs(self.idempotency_ttl_secs.max(1)),
        )
    }
}
