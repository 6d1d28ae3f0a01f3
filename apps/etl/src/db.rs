use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use tracing::info;

use crate::config::Config;

/// Creates a ClickHouse client and verifies connectivity with a ping query,
/// so a bad host or credentials fail the run before any stage starts.
pub async fn create_store_client(config: &Config) -> Result<clickhouse::Client> {
    info!("Connecting to ClickHouse at {}...", config.clickhouse_url());

    let client = clickhouse::Client::default()
        .with_url(config.clickhouse_url())
        .with_database(config.clickhouse_database.clone())
        .with_user(config.clickhouse_user.clone())
        .with_password(config.clickhouse_password.clone());

    client
        .query("SELECT 1")
        .fetch_one::<u8>()
        .await
        .context("ClickHouse connectivity check failed")?;

    info!("ClickHouse connection established");
    Ok(client)
}

/// Creates a managed Redis connection and verifies it with a PING.
pub async fn create_cache_connection(config: &Config) -> Result<ConnectionManager> {
    info!(
        "Connecting to Redis at {}:{}/{}...",
        config.redis_host, config.redis_port, config.redis_db
    );

    let client =
        redis::Client::open(config.redis_url()).context("Invalid Redis connection URL")?;
    let mut manager = client
        .get_connection_manager()
        .await
        .context("Redis connection failed")?;

    redis::cmd("PING")
        .query_async::<_, String>(&mut manager)
        .await
        .context("Redis connectivity check failed")?;

    info!("Redis connection established");
    Ok(manager)
}
