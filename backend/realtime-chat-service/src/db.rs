use crate::config::Config;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::time::Duration;
use tracing::info;

pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn init_pool(config: &Config) -> Result<Pool<Postgres>, sqlx::Error> {
    info!(
        max_connections = config.db_max_connections,
        min_connections = config.db_min_connections,
        acquire_timeout_secs = config.db_acquire_timeout_secs,
        "Database pool configuration"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.db_max_connections.max(1))
        .min_connections(config.db_min_connections.min(config.db_max_connections))
        .acquire_timeout(Duration::from_secs(config.db_acquire_timeout_secs))
        .connect(&config.database_url)
        .await?;

    MIGRATOR.run(&pool).await?;
    Ok(pool)
}
