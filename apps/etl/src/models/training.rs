use clickhouse::Row;
use serde::Deserialize;

/// One labeled impression from `training_interactions`. Timestamps arrive as
/// Unix seconds (`click_time` is null for impressions that were never
/// clicked) and `event_date` as an ISO date string.
#[derive(Debug, Clone, Row, Deserialize)]
pub struct TrainingSampleRow {
    pub user_id: String,
    pub post_id: String,
    pub author_id: String,
    pub label: u8,
    pub label_type: String,
    pub impression_time: u32,
    pub click_time: Option<u32>,
    pub watch_duration_ms: u64,
    pub content_duration_ms: u64,
    pub completion_rate: f64,
    pub recall_source: String,
    pub position_in_feed: u32,
    pub session_id: String,
    pub device_type: String,
    pub hour_of_day: u8,
    pub day_of_week: u8,
    pub event_date: String,
}

/// Most recent precomputed feature snapshot for one (user, post) pair from
/// `training_features`. The table's `recall_source` and
/// `content_duration_ms` columns are not read: the impression sample
/// carries both and wins. `extra_features` is an opaque JSON string passed
/// through to the export.
#[derive(Debug, Clone, Row, Deserialize)]
pub struct FeatureSnapshot {
    pub user_id: String,
    pub post_id: String,
    pub user_follower_count: u64,
    pub user_following_count: u64,
    pub user_post_count: u64,
    pub user_avg_session_length: f64,
    pub user_active_days_30d: u32,
    pub post_age_hours: f64,
    pub post_like_count: u64,
    pub post_comment_count: u64,
    pub post_view_count: u64,
    pub post_completion_rate: f64,
    pub post_engagement_rate: f64,
    pub has_music: u8,
    pub is_original: u8,
    pub author_follower_count: u64,
    pub author_avg_engagement: f64,
    pub author_post_frequency: f64,
    pub user_author_affinity: f64,
    pub user_author_interaction_count: u64,
    pub recall_weight: f64,
    pub extra_features: String,
}

/// Columns computed in-process from the sample itself; always present.
#[derive(Debug, Clone)]
pub struct DerivedFeatures {
    pub is_weekend: u8,
    pub is_morning: u8,
    pub is_evening: u8,
    pub is_night: u8,
    pub position_bucket: u8,
    pub completion_bucket: u8,
    pub recall_source_encoded: u8,
}

/// One fully-assembled dataset row. `features` is None when no snapshot
/// exists for the pair; the export writes nulls for those columns rather
/// than dropping the row.
#[derive(Debug, Clone)]
pub struct TrainingRecord {
    pub sample: TrainingSampleRow,
    pub features: Option<FeatureSnapshot>,
    pub derived: DerivedFeatures,
}
