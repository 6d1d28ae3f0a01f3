use anyhow::{Context, Result};

/// Connection settings for the analytical store and the serving cache,
/// loaded from environment variables. Every field has a development
/// default, and the global CLI flags override whatever the environment
/// provided.
#[derive(Debug, Clone)]
pub struct Config {
    pub clickhouse_host: String,
    pub clickhouse_port: u16,
    pub clickhouse_database: String,
    pub clickhouse_user: String,
    pub clickhouse_password: String,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_db: u32,
    pub redis_password: Option<String>,
    pub rust_log: String,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            clickhouse_host: env_or("CLICKHOUSE_HOST", "localhost"),
            clickhouse_port: std::env::var("CLICKHOUSE_PORT")
                .unwrap_or_else(|_| "8123".to_string())
                .parse::<u16>()
                .context("CLICKHOUSE_PORT must be a valid port number")?,
            clickhouse_database: env_or("CLICKHOUSE_DATABASE", "feed"),
            clickhouse_user: env_or("CLICKHOUSE_USER", "default"),
            clickhouse_password: env_or("CLICKHOUSE_PASSWORD", ""),
            redis_host: env_or("REDIS_HOST", "localhost"),
            redis_port: std::env::var("REDIS_PORT")
                .unwrap_or_else(|_| "6379".to_string())
                .parse::<u16>()
                .context("REDIS_PORT must be a valid port number")?,
            redis_db: std::env::var("REDIS_DB")
                .unwrap_or_else(|_| "0".to_string())
                .parse::<u32>()
                .context("REDIS_DB must be a numeric database index")?,
            redis_password: std::env::var("REDIS_PASSWORD").ok(),
            rust_log: env_or("RUST_LOG", "info"),
        })
    }

    /// HTTP endpoint of the ClickHouse server.
    pub fn clickhouse_url(&self) -> String {
        format!("http://{}:{}", self.clickhouse_host, self.clickhouse_port)
    }

    pub fn redis_url(&self) -> String {
        match &self.redis_password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.redis_host, self.redis_port, self.redis_db
            ),
            None => format!(
                "redis://{}:{}/{}",
                self.redis_host, self.redis_port, self.redis_db
            ),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}
