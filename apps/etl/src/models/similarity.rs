use clickhouse::Row;
use serde::{Deserialize, Serialize};

/// One qualifying entity with its distinct interactor set, as aggregated by
/// the store. For item similarity the entity is an item and the interactors
/// are users; for user similarity the roles are swapped.
#[derive(Debug, Row, Deserialize)]
pub struct EntityInteractors {
    pub entity_id: String,
    pub interactors: Vec<String>,
}

/// One directed pair in the `item_similarity` table. A compute cycle inserts
/// a full generation of these sharing a single `version`; the table merges
/// duplicates by latest version, so readers query with FINAL.
///
/// ```sql
/// CREATE TABLE item_similarity (
///     item_id String,
///     similar_item_id String,
///     similarity_score Float64,
///     similarity_type String,
///     co_interaction_count UInt32,
///     jaccard_score Float64,
///     cosine_score Float64,
///     computed_at DateTime,
///     version UInt64
/// ) ENGINE = ReplacingMergeTree(version)
/// ORDER BY (item_id, similar_item_id);
/// ```
#[derive(Debug, Clone, Row, Serialize)]
pub struct ItemSimilarityRow {
    pub item_id: String,
    pub similar_item_id: String,
    pub similarity_score: f64,
    pub similarity_type: String,
    pub co_interaction_count: u32,
    pub jaccard_score: f64,
    pub cosine_score: f64,
    pub computed_at: u32,
    pub version: u64,
}

/// One directed pair in the `user_similarity` table.
/// `common_authors_count` is reserved and always written as zero.
///
/// ```sql
/// CREATE TABLE user_similarity (
///     user_id String,
///     similar_user_id String,
///     similarity_score Float64,
///     similarity_type String,
///     common_items_count UInt32,
///     common_authors_count UInt32,
///     jaccard_score Float64,
///     cosine_score Float64,
///     computed_at DateTime,
///     version UInt64
/// ) ENGINE = ReplacingMergeTree(version)
/// ORDER BY (user_id, similar_user_id);
/// ```
#[derive(Debug, Clone, Row, Serialize)]
pub struct UserSimilarityRow {
    pub user_id: String,
    pub similar_user_id: String,
    pub similarity_score: f64,
    pub similarity_type: String,
    pub common_items_count: u32,
    pub common_authors_count: u32,
    pub jaccard_score: f64,
    pub cosine_score: f64,
    pub computed_at: u32,
    pub version: u64,
}

/// One page row of the sync read: every stored neighbor of one entity,
/// unranked. Ranking and the top-K cap happen in-process before the
/// cache write.
#[derive(Debug, Row, Deserialize)]
pub struct NeighborPage {
    pub entity_id: String,
    pub neighbor_ids: Vec<String>,
    pub scores: Vec<f64>,
}

/// Aggregate counts over `user_recent_items` within the lookback window.
#[derive(Debug, Row, Deserialize)]
pub struct RecentActivityCounts {
    pub total_interactions: u64,
    pub unique_users: u64,
    pub unique_posts: u64,
}
