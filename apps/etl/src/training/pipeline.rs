//! Training dataset assembly.
//!
//! Positives are taken whole; negatives are random-sampled in the store at
//! `round(positives * negative_ratio)`. The assembled set is shuffled with a
//! fixed seed so repeated runs over the same rows produce the same row order.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use clickhouse::Client;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::EtlError;
use crate::models::training::{TrainingRecord, TrainingSampleRow};
use crate::training::derive::derive_features;
use crate::training::export::export_to_parquet;
use crate::training::features::FeatureExtractor;

pub const DEFAULT_NEGATIVE_RATIO: f64 = 4.0;

const SHUFFLE_SEED: u64 = 42;

const SAMPLE_SELECT: &str = "\
    SELECT user_id, \
           post_id, \
           author_id, \
           toUInt8(label) AS label, \
           label_type, \
           toUnixTimestamp(impression_time) AS impression_time, \
           toNullable(toUnixTimestamp(click_time)) AS click_time, \
           toUInt64(watch_duration_ms) AS watch_duration_ms, \
           toUInt64(content_duration_ms) AS content_duration_ms, \
           toFloat64(completion_rate) AS completion_rate, \
           recall_source, \
           toUInt32(position_in_feed) AS position_in_feed, \
           session_id, \
           device_type, \
           toUInt8(hour_of_day) AS hour_of_day, \
           toUInt8(day_of_week) AS day_of_week, \
           toString(event_date) AS event_date \
    FROM training_interactions \
    WHERE event_date >= toDate(?) AND event_date <= toDate(?) AND label = ?";

/// How many negatives to draw for `positive_count` positives. `None` means
/// there is nothing to balance against and extraction should stop.
pub fn negative_sample_limit(positive_count: u64, negative_ratio: f64) -> Option<u64> {
    if positive_count == 0 {
        return None;
    }
    Some((positive_count as f64 * negative_ratio).round() as u64)
}

#[derive(Debug, Default, Serialize)]
pub struct DatasetStats {
    pub total_samples: u64,
    pub positive_samples: u64,
    pub negative_samples: u64,
    pub unique_users: u64,
    pub unique_posts: u64,
    pub date_start: Option<String>,
    pub date_end: Option<String>,
    pub label_distribution: BTreeMap<String, u64>,
    pub recall_source_distribution: BTreeMap<String, u64>,
    pub avg_completion_rate: f64,
    pub avg_position_in_feed: f64,
    pub error: Option<String>,
}

pub fn dataset_stats(records: &[TrainingRecord]) -> DatasetStats {
    if records.is_empty() {
        return DatasetStats {
            error: Some("Empty dataset".to_string()),
            ..DatasetStats::default()
        };
    }

    let mut stats = DatasetStats {
        total_samples: records.len() as u64,
        ..DatasetStats::default()
    };
    let mut users = HashSet::new();
    let mut posts = HashSet::new();
    let mut completion_sum = 0.0;
    let mut position_sum = 0.0;

    for record in records {
        let sample = &record.sample;
        if sample.label == 1 {
            stats.positive_samples += 1;
        } else {
            stats.negative_samples += 1;
        }
        users.insert(sample.user_id.as_str());
        posts.insert(sample.post_id.as_str());
        *stats
            .label_distribution
            .entry(sample.label_type.clone())
            .or_insert(0) += 1;
        *stats
            .recall_source_distribution
            .entry(sample.recall_source.clone())
            .or_insert(0) += 1;
        completion_sum += sample.completion_rate;
        position_sum += sample.position_in_feed as f64;

        // ISO dates compare correctly as strings.
        if stats
            .date_start
            .as_deref()
            .map_or(true, |d| sample.event_date.as_str() < d)
        {
            stats.date_start = Some(sample.event_date.clone());
        }
        if stats
            .date_end
            .as_deref()
            .map_or(true, |d| sample.event_date.as_str() > d)
        {
            stats.date_end = Some(sample.event_date.clone());
        }
    }

    stats.unique_users = users.len() as u64;
    stats.unique_posts = posts.len() as u64;
    stats.avg_completion_rate = completion_sum / records.len() as f64;
    stats.avg_position_in_feed = position_sum / records.len() as f64;
    stats
}

fn shuffle_records(records: &mut [TrainingRecord]) {
    let mut rng = ChaCha8Rng::seed_from_u64(SHUFFLE_SEED);
    records.shuffle(&mut rng);
}

pub struct TrainingDataPipeline {
    store: Client,
    features: FeatureExtractor,
}

impl TrainingDataPipeline {
    pub fn new(store: Client) -> Self {
        let features = FeatureExtractor::new(store.clone());
        Self { store, features }
    }

    /// Extracts labeled samples for the date range, joins feature snapshots
    /// and derived columns onto them, and shuffles the result.
    pub async fn build_training_dataset(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        negative_ratio: f64,
    ) -> Result<Vec<TrainingRecord>, EtlError> {
        info!(
            "Building training dataset for {start_date}..={end_date} (negative ratio {negative_ratio})"
        );

        // 1. All positives in range.
        let positives = self.extract_samples(start_date, end_date, 1, None).await?;

        // 2. Negatives proportional to the positives actually found.
        let Some(limit) = negative_sample_limit(positives.len() as u64, negative_ratio) else {
            warn!("No positive samples in {start_date}..={end_date}, skipping extraction");
            return Ok(Vec::new());
        };
        let negatives = self
            .extract_samples(start_date, end_date, 0, Some(limit))
            .await?;
        info!(
            "Extracted {} positive and {} negative samples",
            positives.len(),
            negatives.len()
        );

        // 3. One feature lookup for every (user, post) pair in the set.
        let pairs: Vec<(String, String)> = positives
            .iter()
            .chain(negatives.iter())
            .map(|s| (s.user_id.clone(), s.post_id.clone()))
            .collect();
        let feature_map = self.features.features_batch(&pairs).await;

        // 4. Assemble and shuffle.
        let mut records: Vec<TrainingRecord> = positives
            .into_iter()
            .chain(negatives)
            .map(|sample| {
                let features = feature_map
                    .get(&(sample.user_id.clone(), sample.post_id.clone()))
                    .cloned();
                let derived = derive_features(&sample);
                TrainingRecord {
                    sample,
                    features,
                    derived,
                }
            })
            .collect();
        shuffle_records(&mut records);

        info!("Assembled {} training records", records.len());
        Ok(records)
    }

    /// Builds one day's dataset and exports it under
    /// `output_dir/date=<date>/`. An empty day is reported in the stats, not
    /// treated as a failure.
    pub async fn run_daily(
        &self,
        date: NaiveDate,
        output_dir: &Path,
        negative_ratio: f64,
    ) -> Result<(Option<PathBuf>, DatasetStats), EtlError> {
        let records = self
            .build_training_dataset(date, date, negative_ratio)
            .await?;
        if records.is_empty() {
            warn!("No training data for {date}");
            let mut stats = dataset_stats(&records);
            stats.error = Some(format!("No training data for {date}"));
            return Ok((None, stats));
        }

        let day_dir = output_dir.join(format!("date={date}"));
        let path = export_to_parquet(&records, &day_dir, &[])?;
        Ok((Some(path), dataset_stats(&records)))
    }

    async fn extract_samples(
        &self,
        start_date: NaiveDate,
        end_date: NaiveDate,
        label: u8,
        limit: Option<u64>,
    ) -> Result<Vec<TrainingSampleRow>, EtlError> {
        let start = start_date.format("%Y-%m-%d").to_string();
        let end = end_date.format("%Y-%m-%d").to_string();

        let rows = match limit {
            // Random draw, bounded. Used for negatives.
            Some(limit) => {
                let sql = format!("{SAMPLE_SELECT} ORDER BY rand() LIMIT ?");
                self.store
                    .query(&sql)
                    .bind(start)
                    .bind(end)
                    .bind(label)
                    .bind(limit)
                    .fetch_all::<TrainingSampleRow>()
                    .await?
            }
            None => {
                self.store
                    .query(SAMPLE_SELECT)
                    .bind(start)
                    .bind(end)
                    .bind(label)
                    .fetch_all::<TrainingSampleRow>()
                    .await?
            }
        };
        Ok(rows)
    }
}
