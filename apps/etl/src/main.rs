mod config;
mod db;
mod errors;
mod models;
mod runner;
mod similarity;
mod training;

use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{Duration, NaiveDate, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_cache_connection, create_store_client};
use crate::runner::{run_pipeline, RunOptions, StageSelection};
use crate::similarity::computer::{
    ItemSimilarityParams, SimilarityComputer, UserSimilarityParams,
};
use crate::similarity::sync::SimilaritySync;
use crate::training::export::export_to_parquet;
use crate::training::pipeline::{dataset_stats, TrainingDataPipeline, DEFAULT_NEGATIVE_RATIO};

#[derive(Parser)]
#[command(
    name = "reco-etl",
    version,
    about = "Recommendation ETL: similarity compute, cache sync, training data export"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override CLICKHOUSE_HOST.
    #[arg(long, global = true)]
    clickhouse_host: Option<String>,
    /// Override CLICKHOUSE_PORT.
    #[arg(long, global = true)]
    clickhouse_port: Option<u16>,
    /// Override CLICKHOUSE_DATABASE.
    #[arg(long, global = true)]
    clickhouse_database: Option<String>,
    /// Override CLICKHOUSE_USER.
    #[arg(long, global = true)]
    clickhouse_user: Option<String>,
    /// Override CLICKHOUSE_PASSWORD.
    #[arg(long, global = true)]
    clickhouse_password: Option<String>,
    /// Override REDIS_HOST.
    #[arg(long, global = true)]
    redis_host: Option<String>,
    /// Override REDIS_PORT.
    #[arg(long, global = true)]
    redis_port: Option<u16>,
    /// Override REDIS_DB.
    #[arg(long, global = true)]
    redis_db: Option<u32>,
    /// Override REDIS_PASSWORD.
    #[arg(long, global = true)]
    redis_password: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Compute similarity generations in the analytical store.
    Compute {
        #[arg(long = "type", value_enum, default_value = "all")]
        target: Target,
        #[arg(long, default_value_t = 30)]
        lookback_days: u32,
        /// Minimum interactions an entity needs to participate.
        #[arg(long, default_value_t = 10)]
        min_interactions: u64,
        #[arg(long, default_value_t = 5)]
        min_co_interactions: u32,
        #[arg(long, default_value_t = 0.05)]
        min_jaccard: f64,
        #[arg(long, default_value_t = 100)]
        top_k: usize,
    },
    /// Push computed similarity and recent items into the serving cache.
    Sync {
        #[arg(long = "type", value_enum, default_value = "all")]
        target: Target,
        #[arg(long, default_value_t = 1000)]
        batch_size: u64,
        #[arg(long, default_value_t = 50)]
        top_k: usize,
        /// Recent-items window; similarity targets ignore it.
        #[arg(long, default_value_t = 7)]
        lookback_days: u32,
    },
    /// Extract training data and export it as Parquet.
    Extract {
        /// Single day to extract. Defaults to yesterday.
        #[arg(long, conflicts_with_all = ["start_date", "end_date"])]
        date: Option<NaiveDate>,
        #[arg(long, requires = "end_date")]
        start_date: Option<NaiveDate>,
        #[arg(long, requires = "start_date")]
        end_date: Option<NaiveDate>,
        #[arg(long, default_value = "./data/training")]
        output: PathBuf,
        #[arg(long, default_value_t = DEFAULT_NEGATIVE_RATIO)]
        negative_ratio: f64,
    },
    /// Run the full pipeline, or the stages selected by flags.
    Run {
        #[arg(long)]
        all: bool,
        #[arg(long)]
        similarity: bool,
        #[arg(long)]
        sync: bool,
        #[arg(long)]
        extract: bool,
        #[arg(long)]
        train: bool,
        #[arg(long, default_value_t = 30)]
        lookback_days: u32,
        #[arg(long, default_value_t = 30)]
        training_days: u32,
        #[arg(long, default_value = "./data")]
        data_output_dir: PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    Item,
    User,
    Recent,
    All,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load configuration first, then let CLI flags override it
    let mut config = Config::from_env()?;
    apply_overrides(&mut config, &cli);

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting reco-etl v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Commands::Compute {
            target,
            lookback_days,
            min_interactions,
            min_co_interactions,
            min_jaccard,
            top_k,
        } => {
            run_compute(
                &config,
                target,
                lookback_days,
                min_interactions,
                min_co_interactions,
                min_jaccard,
                top_k,
            )
            .await?;
        }
        Commands::Sync {
            target,
            batch_size,
            top_k,
            lookback_days,
        } => {
            run_sync(&config, target, batch_size, top_k, lookback_days).await?;
        }
        Commands::Extract {
            date,
            start_date,
            end_date,
            output,
            negative_ratio,
        } => {
            run_extract(&config, date, start_date, end_date, &output, negative_ratio).await?;
        }
        Commands::Run {
            all,
            similarity,
            sync,
            extract,
            train,
            lookback_days,
            training_days,
            data_output_dir,
        } => {
            let stages = StageSelection::from_flags(all, similarity, sync, extract, train);
            let opts = RunOptions {
                training_days,
                lookback_days,
                data_dir: data_output_dir,
            };
            let report = run_pipeline(&config, stages, &opts).await?;
            print_stats("Pipeline Run", &report)?;
        }
    }

    Ok(())
}

/// CLI connection flags win over whatever the environment provided.
fn apply_overrides(config: &mut Config, cli: &Cli) {
    if let Some(host) = &cli.clickhouse_host {
        config.clickhouse_host = host.clone();
    }
    if let Some(port) = cli.clickhouse_port {
        config.clickhouse_port = port;
    }
    if let Some(database) = &cli.clickhouse_database {
        config.clickhouse_database = database.clone();
    }
    if let Some(user) = &cli.clickhouse_user {
        config.clickhouse_user = user.clone();
    }
    if let Some(password) = &cli.clickhouse_password {
        config.clickhouse_password = password.clone();
    }
    if let Some(host) = &cli.redis_host {
        config.redis_host = host.clone();
    }
    if let Some(port) = cli.redis_port {
        config.redis_port = port;
    }
    if let Some(db) = cli.redis_db {
        config.redis_db = db;
    }
    if let Some(password) = &cli.redis_password {
        config.redis_password = Some(password.clone());
    }
}

async fn run_compute(
    config: &Config,
    target: Target,
    lookback_days: u32,
    min_interactions: u64,
    min_co_interactions: u32,
    min_jaccard: f64,
    top_k: usize,
) -> Result<()> {
    let store = create_store_client(config).await?;
    let computer = SimilarityComputer::new(store);

    if matches!(target, Target::Item | Target::All) {
        let params = ItemSimilarityParams {
            lookback_days,
            min_user_interactions: min_interactions,
            min_co_interactions,
            min_jaccard,
            top_k_per_item: top_k,
        };
        let stats = computer.compute_item_similarity(&params).await;
        print_stats("Item Similarity", &stats)?;
    }
    if matches!(target, Target::User | Target::All) {
        let params = UserSimilarityParams {
            lookback_days,
            min_item_interactions: min_interactions,
            min_common_items: min_co_interactions,
            min_jaccard,
            // The serving tier never reads more than 50 user neighbors.
            top_k_per_user: top_k.min(50),
        };
        let stats = computer.compute_user_similarity(&params).await;
        print_stats("User Similarity", &stats)?;
    }
    if matches!(target, Target::Recent | Target::All) {
        let stats = computer.update_user_recent_items(lookback_days).await;
        print_stats("Recent Items", &stats)?;
    }

    Ok(())
}

async fn run_sync(
    config: &Config,
    target: Target,
    batch_size: u64,
    top_k: usize,
    lookback_days: u32,
) -> Result<()> {
    let store = create_store_client(config).await?;
    let cache = create_cache_connection(config).await?;
    let sync = SimilaritySync::new(store, cache);

    if matches!(target, Target::Item | Target::All) {
        let stats = sync.sync_item_similarity(batch_size, top_k).await;
        print_stats("Item Similarity Sync", &stats)?;
    }
    if matches!(target, Target::User | Target::All) {
        let stats = sync.sync_user_similarity(batch_size, top_k.min(30)).await;
        print_stats("User Similarity Sync", &stats)?;
    }
    if matches!(target, Target::Recent | Target::All) {
        let stats = sync
            .sync_user_recent_items(batch_size, lookback_days, top_k)
            .await;
        print_stats("Recent Items Sync", &stats)?;
    }

    let cache_stats = sync.get_sync_stats().await?;
    print_stats("Cache State", &cache_stats)?;

    Ok(())
}

async fn run_extract(
    config: &Config,
    date: Option<NaiveDate>,
    start_date: Option<NaiveDate>,
    end_date: Option<NaiveDate>,
    output: &Path,
    negative_ratio: f64,
) -> Result<()> {
    let store = create_store_client(config).await?;
    let pipeline = TrainingDataPipeline::new(store);

    if let (Some(start), Some(end)) = (start_date, end_date) {
        let records = pipeline
            .build_training_dataset(start, end, negative_ratio)
            .await?;
        let stats = dataset_stats(&records);
        if records.is_empty() {
            warn!("No training data in {start}..={end}");
        } else {
            let path = export_to_parquet(&records, output, &[])?;
            println!("Exported to {}", path.display());
        }
        print_stats("Training Dataset", &stats)?;
    } else {
        let day = date.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
        let (path, stats) = pipeline.run_daily(day, output, negative_ratio).await?;
        if let Some(path) = path {
            println!("Exported to {}", path.display());
        }
        print_stats("Training Dataset", &stats)?;
    }

    Ok(())
}

fn print_stats<T: Serialize>(title: &str, stats: &T) -> Result<()> {
    println!("=== {title} Results ===");
    println!("{}", serde_json::to_string_pretty(stats)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env_config() -> Config {
        Config {
            clickhouse_host: "localhost".to_string(),
            clickhouse_port: 8123,
            clickhouse_database: "feed".to_string(),
            clickhouse_user: "default".to_string(),
            clickhouse_password: String::new(),
            redis_host: "localhost".to_string(),
            redis_port: 6379,
            redis_db: 0,
            redis_password: None,
            rust_log: "info".to_string(),
        }
    }

    #[test]
    fn test_connection_flags_override_env_config() {
        let cli = Cli::parse_from([
            "reco-etl",
            "--clickhouse-host",
            "ch.prod",
            "--clickhouse-port",
            "9000",
            "--clickhouse-database",
            "feed_prod",
            "--clickhouse-user",
            "etl",
            "--clickhouse-password",
            "s3cret",
            "--redis-host",
            "cache.prod",
            "--redis-port",
            "6380",
            "--redis-db",
            "3",
            "--redis-password",
            "hunter2",
            "sync",
        ]);
        let mut config = env_config();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.clickhouse_host, "ch.prod");
        assert_eq!(config.clickhouse_port, 9000);
        assert_eq!(config.clickhouse_database, "feed_prod");
        assert_eq!(config.clickhouse_user, "etl");
        assert_eq!(config.clickhouse_password, "s3cret");
        assert_eq!(config.redis_host, "cache.prod");
        assert_eq!(config.redis_port, 6380);
        assert_eq!(config.redis_db, 3);
        assert_eq!(config.redis_password.as_deref(), Some("hunter2"));
    }

    #[test]
    fn test_absent_flags_keep_env_config() {
        let cli = Cli::parse_from(["reco-etl", "compute"]);
        let mut config = env_config();
        apply_overrides(&mut config, &cli);
        assert_eq!(config.clickhouse_host, "localhost");
        assert_eq!(config.clickhouse_port, 8123);
        assert_eq!(config.redis_port, 6379);
        assert!(config.redis_password.is_none());
    }
}
