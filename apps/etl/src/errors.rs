use thiserror::Error;

/// Component-level error type for the ETL stages.
/// Stage entry points catch these into their returned stats; everything
/// that escapes aborts the run with a nonzero exit.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Store error: {0}")]
    Store(#[from] clickhouse::error::Error),

    #[error("Cache error: {0}")]
    Cache(#[from] redis::RedisError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow_schema::ArrowError),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid partition column: {0}")]
    InvalidPartitionColumn(String),
}
