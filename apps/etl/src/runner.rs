//! Full pipeline orchestration for the `run` subcommand.
//!
//! Stages execute in a fixed order: similarity, sync, extract, train
//! handoff. Each stage builds its own clients, so a run that only extracts
//! never needs Redis. Compute and sync failures are carried inside their
//! stats; extraction and export failures abort the run.

use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use chrono::Utc;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::db::{create_cache_connection, create_store_client};
use crate::similarity::computer::{
    ItemSimilarityParams, RecentItemsStats, SimilarityComputeStats, SimilarityComputer,
    UserSimilarityParams,
};
use crate::similarity::sync::{SimilaritySync, SyncStats};
use crate::training::export::export_to_parquet;
use crate::training::pipeline::{
    dataset_stats, DatasetStats, TrainingDataPipeline, DEFAULT_NEGATIVE_RATIO,
};

const RECENT_ITEMS_LOOKBACK_DAYS: u32 = 7;

const ITEM_SYNC_BATCH: u64 = 1000;
const ITEM_SYNC_TOP_K: usize = 50;
const USER_SYNC_BATCH: u64 = 500;
const USER_SYNC_TOP_K: usize = 30;
const RECENT_SYNC_BATCH: u64 = 1000;
const RECENT_SYNC_MAX_ITEMS: usize = 50;

/// Which stages a `run` invocation executes. No flags means everything.
#[derive(Debug, Clone, Copy)]
pub struct StageSelection {
    pub similarity: bool,
    pub sync: bool,
    pub extract: bool,
    pub train: bool,
}

impl StageSelection {
    pub fn from_flags(all: bool, similarity: bool, sync: bool, extract: bool, train: bool) -> Self {
        if all || !(similarity || sync || extract || train) {
            return StageSelection {
                similarity: true,
                sync: true,
                extract: true,
                train: true,
            };
        }
        StageSelection {
            similarity,
            sync,
            extract,
            train,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub training_days: u32,
    pub lookback_days: u32,
    pub data_dir: PathBuf,
}

#[derive(Debug, Default, Serialize)]
pub struct RunReport {
    pub similarity: Option<SimilarityStageReport>,
    pub sync: Option<SyncStageReport>,
    pub extract: Option<ExtractStageReport>,
    pub train: Option<TrainStageReport>,
}

#[derive(Debug, Serialize)]
pub struct SimilarityStageReport {
    pub items: SimilarityComputeStats,
    pub users: SimilarityComputeStats,
    pub recent_items: RecentItemsStats,
}

#[derive(Debug, Serialize)]
pub struct SyncStageReport {
    pub items: SyncStats,
    pub users: SyncStats,
    pub recent_items: SyncStats,
}

#[derive(Debug, Serialize)]
pub struct ExtractStageReport {
    pub output_path: Option<String>,
    pub dataset: DatasetStats,
}

#[derive(Debug, Serialize)]
pub struct TrainStageReport {
    pub dataset_path: String,
}

pub async fn run_pipeline(
    config: &Config,
    stages: StageSelection,
    opts: &RunOptions,
) -> anyhow::Result<RunReport> {
    let started = Instant::now();
    info!(
        "Pipeline run starting (similarity={}, sync={}, extract={}, train={})",
        stages.similarity, stages.sync, stages.extract, stages.train
    );

    let mut report = RunReport::default();
    if stages.similarity {
        report.similarity = Some(run_similarity_stage(config, opts.lookback_days).await?);
    }
    if stages.sync {
        report.sync = Some(run_sync_stage(config).await?);
    }
    if stages.extract {
        report.extract = Some(run_extract_stage(config, opts).await?);
    }
    if stages.train {
        report.train = Some(resolve_train_stage(&opts.data_dir)?);
    }

    info!("Pipeline run finished in {:.2?}", started.elapsed());
    Ok(report)
}

async fn run_similarity_stage(
    config: &Config,
    lookback_days: u32,
) -> anyhow::Result<SimilarityStageReport> {
    let store = create_store_client(config).await?;
    let computer = SimilarityComputer::new(store);

    let items = computer
        .compute_item_similarity(&ItemSimilarityParams {
            lookback_days,
            ..Default::default()
        })
        .await;
    let users = computer
        .compute_user_similarity(&UserSimilarityParams {
            lookback_days,
            ..Default::default()
        })
        .await;
    let recent_items = computer
        .update_user_recent_items(RECENT_ITEMS_LOOKBACK_DAYS)
        .await;

    Ok(SimilarityStageReport {
        items,
        users,
        recent_items,
    })
}

async fn run_sync_stage(config: &Config) -> anyhow::Result<SyncStageReport> {
    let store = create_store_client(config).await?;
    let cache = create_cache_connection(config).await?;
    let sync = SimilaritySync::new(store, cache);

    let items = sync
        .sync_item_similarity(ITEM_SYNC_BATCH, ITEM_SYNC_TOP_K)
        .await;
    let users = sync
        .sync_user_similarity(USER_SYNC_BATCH, USER_SYNC_TOP_K)
        .await;
    let recent_items = sync
        .sync_user_recent_items(
            RECENT_SYNC_BATCH,
            RECENT_ITEMS_LOOKBACK_DAYS,
            RECENT_SYNC_MAX_ITEMS,
        )
        .await;

    Ok(SyncStageReport {
        items,
        users,
        recent_items,
    })
}

async fn run_extract_stage(
    config: &Config,
    opts: &RunOptions,
) -> anyhow::Result<ExtractStageReport> {
    let store = create_store_client(config).await?;
    let pipeline = TrainingDataPipeline::new(store);

    let end_date = Utc::now().date_naive();
    let start_date = end_date - chrono::Duration::days(i64::from(opts.training_days));
    let records = pipeline
        .build_training_dataset(start_date, end_date, DEFAULT_NEGATIVE_RATIO)
        .await?;
    let stats = dataset_stats(&records);

    if records.is_empty() {
        warn!("Extract stage produced no records, nothing exported");
        return Ok(ExtractStageReport {
            output_path: None,
            dataset: stats,
        });
    }
    let path = export_to_parquet(&records, &opts.data_dir, &[])?;
    Ok(ExtractStageReport {
        output_path: Some(path.display().to_string()),
        dataset: stats,
    })
}

/// The trainer itself runs outside this pipeline; this stage only resolves
/// which dataset it should pick up.
fn resolve_train_stage(data_dir: &Path) -> anyhow::Result<TrainStageReport> {
    let newest = newest_dataset(data_dir)
        .with_context(|| format!("scanning {} for datasets", data_dir.display()))?;
    let Some(path) = newest else {
        bail!("No training dataset found under {}", data_dir.display());
    };
    info!("Training handoff dataset: {}", path.display());
    Ok(TrainStageReport {
        dataset_path: path.display().to_string(),
    })
}

fn newest_dataset(data_dir: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut newest: Option<PathBuf> = None;
    for entry in std::fs::read_dir(data_dir)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !(name.starts_with("training_data_") && name.ends_with(".parquet")) {
            continue;
        }
        // The embedded timestamp makes names sort chronologically.
        let newer = newest
            .as_ref()
            .and_then(|p| p.file_name())
            .and_then(|n| n.to_str())
            .map_or(true, |best| name > best);
        if newer {
            newest = Some(path);
        }
    }
    Ok(newest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_selection_defaults_to_all() {
        let none = StageSelection::from_flags(false, false, false, false, false);
        assert!(none.similarity && none.sync && none.extract && none.train);

        let all = StageSelection::from_flags(true, false, true, false, false);
        assert!(all.similarity && all.sync && all.extract && all.train);

        let only_sync = StageSelection::from_flags(false, false, true, false, false);
        assert!(!only_sync.similarity && only_sync.sync);
        assert!(!only_sync.extract && !only_sync.train);
    }

    #[test]
    fn test_newest_dataset_picks_latest_by_name() {
        let dir = tempfile::tempdir().unwrap();
        for name in [
            "training_data_20240101_120000.parquet",
            "training_data_20240315_090000.parquet",
            "training_data_20240214_000000.parquet",
            "notes.txt",
            "training_data_20990101.csv",
        ] {
            std::fs::File::create(dir.path().join(name)).unwrap();
        }

        let newest = newest_dataset(dir.path()).unwrap().unwrap();
        assert_eq!(
            newest.file_name().unwrap(),
            "training_data_20240315_090000.parquet"
        );
    }

    #[test]
    fn test_newest_dataset_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(newest_dataset(dir.path()).unwrap().is_none());
    }
}
