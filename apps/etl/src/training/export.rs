//! Parquet export of assembled training records.
//!
//! The flat column layout (raw sample, then joined features, then derived
//! columns) is the dataset contract with the model trainer. Feature columns
//! are nullable: a record without a snapshot exports nulls there.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow_array::{
    ArrayRef, Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array, UInt8Array,
};
use arrow_schema::{DataType, Field, Schema};
use chrono::Utc;
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use tracing::info;
use uuid::Uuid;

use crate::errors::EtlError;
use crate::models::training::TrainingRecord;

/// Writes records as Snappy-compressed Parquet and returns the written
/// path. With partition columns: hive-style `col=value/` directories under
/// `output_dir`, one UUID-named part file per group, and the partition
/// columns dropped from the file contents. Without: a single timestamped
/// `training_data_*.parquet` in `output_dir`.
pub fn export_to_parquet(
    records: &[TrainingRecord],
    output_dir: &Path,
    partition_cols: &[String],
) -> Result<PathBuf, EtlError> {
    std::fs::create_dir_all(output_dir)?;

    if partition_cols.is_empty() {
        let filename = format!(
            "training_data_{}.parquet",
            Utc::now().format("%Y%m%d_%H%M%S")
        );
        let path = output_dir.join(filename);
        let refs: Vec<&TrainingRecord> = records.iter().collect();
        write_batch(&path, &to_record_batch(&refs)?)?;
        info!("Exported {} rows to {}", records.len(), path.display());
        return Ok(path);
    }

    let mut groups: BTreeMap<Vec<String>, Vec<&TrainingRecord>> = BTreeMap::new();
    for record in records {
        let mut segments = Vec::with_capacity(partition_cols.len());
        for column in partition_cols {
            segments.push(format!("{column}={}", partition_value(record, column)?));
        }
        groups.entry(segments).or_default().push(record);
    }

    let partitions = groups.len();
    for (segments, group) in groups {
        let mut dir = output_dir.to_path_buf();
        for segment in &segments {
            dir.push(segment);
        }
        std::fs::create_dir_all(&dir)?;

        let batch = to_record_batch(&group)?;
        let keep: Vec<usize> = batch
            .schema()
            .fields()
            .iter()
            .enumerate()
            .filter(|(_, field)| !partition_cols.iter().any(|c| c == field.name()))
            .map(|(idx, _)| idx)
            .collect();
        let trimmed = batch.project(&keep)?;
        write_batch(&dir.join(format!("{}.parquet", Uuid::new_v4())), &trimmed)?;
    }
    info!(
        "Exported {} rows across {partitions} partitions to {}",
        records.len(),
        output_dir.display()
    );
    Ok(output_dir.to_path_buf())
}

fn write_batch(path: &Path, batch: &RecordBatch) -> Result<(), EtlError> {
    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props))?;
    writer.write(batch)?;
    writer.close()?;
    Ok(())
}

/// Stringifies the column used as a hive partition key. Only columns that
/// are stable, low-cardinality strings on the sample side qualify.
fn partition_value(record: &TrainingRecord, column: &str) -> Result<String, EtlError> {
    let sample = &record.sample;
    match column {
        "event_date" => Ok(sample.event_date.clone()),
        "label" => Ok(sample.label.to_string()),
        "label_type" => Ok(sample.label_type.clone()),
        "recall_source" => Ok(sample.recall_source.clone()),
        "device_type" => Ok(sample.device_type.clone()),
        _ => Err(EtlError::InvalidPartitionColumn(column.to_string())),
    }
}

fn to_record_batch(records: &[&TrainingRecord]) -> Result<RecordBatch, EtlError> {
    let columns: Vec<(Field, ArrayRef)> = vec![
        // Raw sample.
        (
            Field::new("user_id", DataType::Utf8, false),
            utf8(records, |r| r.sample.user_id.as_str()),
        ),
        (
            Field::new("post_id", DataType::Utf8, false),
            utf8(records, |r| r.sample.post_id.as_str()),
        ),
        (
            Field::new("author_id", DataType::Utf8, false),
            utf8(records, |r| r.sample.author_id.as_str()),
        ),
        (
            Field::new("label", DataType::UInt8, false),
            u8s(records, |r| r.sample.label),
        ),
        (
            Field::new("label_type", DataType::Utf8, false),
            utf8(records, |r| r.sample.label_type.as_str()),
        ),
        (
            Field::new("impression_time", DataType::UInt32, false),
            u32s(records, |r| r.sample.impression_time),
        ),
        (
            Field::new("click_time", DataType::UInt32, true),
            opt_u32(records, |r| r.sample.click_time),
        ),
        (
            Field::new("watch_duration_ms", DataType::UInt64, false),
            u64s(records, |r| r.sample.watch_duration_ms),
        ),
        (
            Field::new("content_duration_ms", DataType::UInt64, false),
            u64s(records, |r| r.sample.content_duration_ms),
        ),
        (
            Field::new("completion_rate", DataType::Float64, false),
            f64s(records, |r| r.sample.completion_rate),
        ),
        (
            Field::new("recall_source", DataType::Utf8, false),
            utf8(records, |r| r.sample.recall_source.as_str()),
        ),
        (
            Field::new("position_in_feed", DataType::UInt32, false),
            u32s(records, |r| r.sample.position_in_feed),
        ),
        (
            Field::new("session_id", DataType::Utf8, false),
            utf8(records, |r| r.sample.session_id.as_str()),
        ),
        (
            Field::new("device_type", DataType::Utf8, false),
            utf8(records, |r| r.sample.device_type.as_str()),
        ),
        (
            Field::new("hour_of_day", DataType::UInt8, false),
            u8s(records, |r| r.sample.hour_of_day),
        ),
        (
            Field::new("day_of_week", DataType::UInt8, false),
            u8s(records, |r| r.sample.day_of_week),
        ),
        (
            Field::new("event_date", DataType::Utf8, false),
            utf8(records, |r| r.sample.event_date.as_str()),
        ),
        // Joined feature snapshot (nullable).
        (
            Field::new("user_follower_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.user_follower_count)),
        ),
        (
            Field::new("user_following_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.user_following_count)),
        ),
        (
            Field::new("user_post_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.user_post_count)),
        ),
        (
            Field::new("user_avg_session_length", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.user_avg_session_length)
            }),
        ),
        (
            Field::new("user_active_days_30d", DataType::UInt32, true),
            opt_u32(records, |r| r.features.as_ref().map(|f| f.user_active_days_30d)),
        ),
        (
            Field::new("post_age_hours", DataType::Float64, true),
            opt_f64(records, |r| r.features.as_ref().map(|f| f.post_age_hours)),
        ),
        (
            Field::new("post_like_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.post_like_count)),
        ),
        (
            Field::new("post_comment_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.post_comment_count)),
        ),
        (
            Field::new("post_view_count", DataType::UInt64, true),
            opt_u64(records, |r| r.features.as_ref().map(|f| f.post_view_count)),
        ),
        (
            Field::new("post_completion_rate", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.post_completion_rate)
            }),
        ),
        (
            Field::new("post_engagement_rate", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.post_engagement_rate)
            }),
        ),
        (
            Field::new("has_music", DataType::UInt8, true),
            opt_u8(records, |r| r.features.as_ref().map(|f| f.has_music)),
        ),
        (
            Field::new("is_original", DataType::UInt8, true),
            opt_u8(records, |r| r.features.as_ref().map(|f| f.is_original)),
        ),
        (
            Field::new("author_follower_count", DataType::UInt64, true),
            opt_u64(records, |r| {
                r.features.as_ref().map(|f| f.author_follower_count)
            }),
        ),
        (
            Field::new("author_avg_engagement", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.author_avg_engagement)
            }),
        ),
        (
            Field::new("author_post_frequency", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.author_post_frequency)
            }),
        ),
        (
            Field::new("user_author_affinity", DataType::Float64, true),
            opt_f64(records, |r| {
                r.features.as_ref().map(|f| f.user_author_affinity)
            }),
        ),
        (
            Field::new("user_author_interaction_count", DataType::UInt64, true),
            opt_u64(records, |r| {
                r.features.as_ref().map(|f| f.user_author_interaction_count)
            }),
        ),
        (
            Field::new("recall_weight", DataType::Float64, true),
            opt_f64(records, |r| r.features.as_ref().map(|f| f.recall_weight)),
        ),
        (
            Field::new("extra_features", DataType::Utf8, true),
            opt_utf8(records, |r| {
                r.features.as_ref().map(|f| f.extra_features.as_str())
            }),
        ),
        // Derived columns.
        (
            Field::new("is_weekend", DataType::UInt8, false),
            u8s(records, |r| r.derived.is_weekend),
        ),
        (
            Field::new("is_morning", DataType::UInt8, false),
            u8s(records, |r| r.derived.is_morning),
        ),
        (
            Field::new("is_evening", DataType::UInt8, false),
            u8s(records, |r| r.derived.is_evening),
        ),
        (
            Field::new("is_night", DataType::UInt8, false),
            u8s(records, |r| r.derived.is_night),
        ),
        (
            Field::new("position_bucket", DataType::UInt8, false),
            u8s(records, |r| r.derived.position_bucket),
        ),
        (
            Field::new("completion_bucket", DataType::UInt8, false),
            u8s(records, |r| r.derived.completion_bucket),
        ),
        (
            Field::new("recall_source_encoded", DataType::UInt8, false),
            u8s(records, |r| r.derived.recall_source_encoded),
        ),
    ];

    let (fields, arrays): (Vec<Field>, Vec<ArrayRef>) = columns.into_iter().unzip();
    let schema = Arc::new(Schema::new(fields));
    Ok(RecordBatch::try_new(schema, arrays)?)
}

fn utf8<'a>(
    records: &[&'a TrainingRecord],
    get: impl Fn(&'a TrainingRecord) -> &'a str,
) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(
        records.iter().copied().map(get),
    ))
}

fn opt_utf8<'a>(
    records: &[&'a TrainingRecord],
    get: impl Fn(&'a TrainingRecord) -> Option<&'a str>,
) -> ArrayRef {
    Arc::new(StringArray::from(
        records.iter().copied().map(get).collect::<Vec<Option<&str>>>(),
    ))
}

fn u8s(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> u8) -> ArrayRef {
    Arc::new(UInt8Array::from_iter_values(
        records.iter().copied().map(get),
    ))
}

fn u32s(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> u32) -> ArrayRef {
    Arc::new(UInt32Array::from_iter_values(
        records.iter().copied().map(get),
    ))
}

fn u64s(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> u64) -> ArrayRef {
    Arc::new(UInt64Array::from_iter_values(
        records.iter().copied().map(get),
    ))
}

fn f64s(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> f64) -> ArrayRef {
    Arc::new(Float64Array::from_iter_values(
        records.iter().copied().map(get),
    ))
}

fn opt_u8(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> Option<u8>) -> ArrayRef {
    Arc::new(UInt8Array::from(
        records.iter().copied().map(get).collect::<Vec<_>>(),
    ))
}

fn opt_u32(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> Option<u32>) -> ArrayRef {
    Arc::new(UInt32Array::from(
        records.iter().copied().map(get).collect::<Vec<_>>(),
    ))
}

fn opt_u64(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> Option<u64>) -> ArrayRef {
    Arc::new(UInt64Array::from(
        records.iter().copied().map(get).collect::<Vec<_>>(),
    ))
}

fn opt_f64(records: &[&TrainingRecord], get: impl Fn(&TrainingRecord) -> Option<f64>) -> ArrayRef {
    Arc::new(Float64Array::from(
        records.iter().copied().map(get).collect::<Vec<_>>(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::training::{FeatureSnapshot, TrainingSampleRow};
    use crate::training::derive::derive_features;
    use arrow_array::Array;
    use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;

    fn make_record(user: &str, date: &str, label: u8, with_features: bool) -> TrainingRecord {
        let sample = TrainingSampleRow {
            user_id: user.to_string(),
            post_id: format!("post-{user}"),
            author_id: "author-1".to_string(),
            label,
            label_type: if label == 1 { "click" } else { "impression" }.to_string(),
            impression_time: 1_700_000_000,
            click_time: (label == 1).then_some(1_700_000_042),
            watch_duration_ms: 9_000,
            content_duration_ms: 30_000,
            completion_rate: 0.3,
            recall_source: "trending".to_string(),
            position_in_feed: 7,
            session_id: "sess-1".to_string(),
            device_type: "android".to_string(),
            hour_of_day: 20,
            day_of_week: 2,
            event_date: date.to_string(),
        };
        let derived = derive_features(&sample);
        let features = with_features.then(|| FeatureSnapshot {
            user_id: sample.user_id.clone(),
            post_id: sample.post_id.clone(),
            user_follower_count: 120,
            user_following_count: 80,
            user_post_count: 14,
            user_avg_session_length: 310.5,
            user_active_days_30d: 22,
            post_age_hours: 6.5,
            post_like_count: 40,
            post_comment_count: 4,
            post_view_count: 900,
            post_completion_rate: 0.41,
            post_engagement_rate: 0.05,
            has_music: 1,
            is_original: 1,
            author_follower_count: 5_000,
            author_avg_engagement: 0.07,
            author_post_frequency: 1.4,
            user_author_affinity: 0.2,
            user_author_interaction_count: 3,
            recall_weight: 0.8,
            extra_features: "{}".to_string(),
        });
        TrainingRecord {
            sample,
            features,
            derived,
        }
    }

    fn read_parquet(path: &Path) -> (usize, Vec<String>, Vec<RecordBatch>) {
        let file = File::open(path).unwrap();
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).unwrap();
        let columns: Vec<String> = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let batches: Vec<RecordBatch> =
            builder.build().unwrap().map(|b| b.unwrap()).collect();
        let rows = batches.iter().map(|b| b.num_rows()).sum();
        (rows, columns, batches)
    }

    #[test]
    fn test_single_file_export_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            make_record("u1", "2024-01-15", 1, true),
            make_record("u2", "2024-01-15", 0, true),
            make_record("u3", "2024-01-16", 0, false),
        ];

        let path = export_to_parquet(&records, dir.path(), &[]).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with("training_data_") && name.ends_with(".parquet"));

        let (rows, columns, _) = read_parquet(&path);
        assert_eq!(rows, 3);
        assert_eq!(columns.len(), 44);
        for expected in ["user_id", "label", "recall_weight", "position_bucket"] {
            assert!(columns.contains(&expected.to_string()), "missing {expected}");
        }
    }

    #[test]
    fn test_missing_features_export_as_nulls() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            make_record("u1", "2024-01-15", 1, true),
            make_record("u2", "2024-01-15", 0, false),
        ];

        let path = export_to_parquet(&records, dir.path(), &[]).unwrap();
        let (_, columns, batches) = read_parquet(&path);
        let idx = columns.iter().position(|c| c == "user_follower_count").unwrap();
        let nulls: usize = batches.iter().map(|b| b.column(idx).null_count()).sum();
        assert_eq!(nulls, 1, "exactly the snapshot-less record must be null");
    }

    #[test]
    fn test_partitioned_export_layout() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![
            make_record("u1", "2024-01-15", 1, true),
            make_record("u2", "2024-01-15", 0, true),
            make_record("u3", "2024-01-16", 1, true),
        ];

        let root =
            export_to_parquet(&records, dir.path(), &["event_date".to_string()]).unwrap();
        assert_eq!(root, dir.path());

        let mut total_rows = 0;
        for (partition, expected_rows) in [("event_date=2024-01-15", 2), ("event_date=2024-01-16", 1)]
        {
            let part_dir = root.join(partition);
            let files: Vec<_> = std::fs::read_dir(&part_dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .filter(|p| p.extension().is_some_and(|ext| ext == "parquet"))
                .collect();
            assert_eq!(files.len(), 1, "one part file per partition");

            let (rows, columns, _) = read_parquet(&files[0]);
            assert_eq!(rows, expected_rows);
            assert!(
                !columns.contains(&"event_date".to_string()),
                "partition column must be dropped from the file"
            );
            total_rows += rows;
        }
        assert_eq!(total_rows, 3);
    }

    #[test]
    fn test_unknown_partition_column_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let records = vec![make_record("u1", "2024-01-15", 1, true)];
        let result = export_to_parquet(&records, dir.path(), &["completion_rate".to_string()]);
        assert!(matches!(result, Err(EtlError::InvalidPartitionColumn(_))));
    }
}
