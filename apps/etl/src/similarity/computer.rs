//! Similarity computation against the analytical store.
//!
//! Each compute cycle purges the 2-day retention window (best-effort),
//! pulls qualifying interactor sets, runs the in-process co-occurrence
//! engine, and inserts one fresh generation of directed pairs.

use chrono::Utc;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::EtlError;
use crate::models::similarity::{
    EntityInteractors, ItemSimilarityRow, RecentActivityCounts, UserSimilarityRow,
};
use crate::similarity::cooccur::{self, CooccurrenceParams, ScoredNeighbor};

/// Similarity rows older than this are purged before each compute cycle.
const RETENTION_DAYS: u32 = 2;

const ITEM_SIMILARITY_TYPE: &str = "co_interaction";
const USER_SIMILARITY_TYPE: &str = "behavior";

/// Thresholds for one item-similarity compute cycle.
#[derive(Debug, Clone, Copy)]
pub struct ItemSimilarityParams {
    pub lookback_days: u32,
    pub min_user_interactions: u64,
    pub min_co_interactions: u32,
    pub min_jaccard: f64,
    pub top_k_per_item: usize,
}

impl Default for ItemSimilarityParams {
    fn default() -> Self {
        ItemSimilarityParams {
            lookback_days: 30,
            min_user_interactions: 10,
            min_co_interactions: 5,
            min_jaccard: 0.05,
            top_k_per_item: 100,
        }
    }
}

/// Thresholds for one user-similarity compute cycle.
#[derive(Debug, Clone, Copy)]
pub struct UserSimilarityParams {
    pub lookback_days: u32,
    pub min_item_interactions: u64,
    pub min_common_items: u32,
    pub min_jaccard: f64,
    pub top_k_per_user: usize,
}

impl Default for UserSimilarityParams {
    fn default() -> Self {
        UserSimilarityParams {
            lookback_days: 30,
            min_item_interactions: 10,
            min_common_items: 5,
            min_jaccard: 0.05,
            top_k_per_user: 50,
        }
    }
}

/// Outcome of one compute cycle, derived from the generation just built.
/// A failed cycle carries the error message and zero counts.
#[derive(Debug, Serialize)]
pub struct SimilarityComputeStats {
    pub pairs_inserted: u64,
    pub unique_entities: u64,
    pub avg_similarity: f64,
    pub max_similarity: f64,
    pub error: Option<String>,
}

impl SimilarityComputeStats {
    fn from_ranked(ranked: &[ScoredNeighbor]) -> Self {
        let unique_entities = ranked
            .iter()
            .map(|n| n.source_id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as u64;
        let max_similarity = ranked.iter().map(|n| n.combined).fold(0.0, f64::max);
        let avg_similarity = if ranked.is_empty() {
            0.0
        } else {
            ranked.iter().map(|n| n.combined).sum::<f64>() / ranked.len() as f64
        };
        SimilarityComputeStats {
            pairs_inserted: ranked.len() as u64,
            unique_entities,
            avg_similarity,
            max_similarity,
            error: None,
        }
    }

    fn failed(message: String) -> Self {
        SimilarityComputeStats {
            pairs_inserted: 0,
            unique_entities: 0,
            avg_similarity: 0.0,
            max_similarity: 0.0,
            error: Some(message),
        }
    }
}

/// Outcome of a recent-items refresh, counted over the lookback window.
#[derive(Debug, Serialize)]
pub struct RecentItemsStats {
    pub total_interactions: u64,
    pub unique_users: u64,
    pub unique_posts: u64,
    pub error: Option<String>,
}

impl RecentItemsStats {
    fn failed(message: String) -> Self {
        RecentItemsStats {
            total_interactions: 0,
            unique_users: 0,
            unique_posts: 0,
            error: Some(message),
        }
    }
}

/// Computes item-item and user-user similarity generations and refreshes
/// the per-user recent-interaction log.
pub struct SimilarityComputer {
    store: clickhouse::Client,
}

impl SimilarityComputer {
    pub fn new(store: clickhouse::Client) -> Self {
        SimilarityComputer { store }
    }

    /// Runs one item-similarity cycle. Query failures are caught and
    /// surfaced in the returned stats; the caller decides whether to go on.
    pub async fn compute_item_similarity(
        &self,
        params: &ItemSimilarityParams,
    ) -> SimilarityComputeStats {
        match self.try_compute_item_similarity(params).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Item similarity computation failed: {e}");
                SimilarityComputeStats::failed(e.to_string())
            }
        }
    }

    async fn try_compute_item_similarity(
        &self,
        params: &ItemSimilarityParams,
    ) -> Result<SimilarityComputeStats, EtlError> {
        // 1. Best-effort retention purge.
        self.purge_stale("item_similarity").await;

        // 2. Qualifying per-item user sets.
        let sets = self
            .fetch_interactor_sets(
                r#"
                SELECT
                    content_id AS entity_id,
                    groupUniqArray(user_id) AS interactors
                FROM watch_events
                WHERE event_date >= today() - ?
                  AND completion_rate >= 0.5
                GROUP BY content_id
                HAVING uniqExact(user_id) >= ?
                "#,
                params.lookback_days,
                params.min_user_interactions,
            )
            .await?;
        info!("Loaded {} qualifying items", sets.len());

        // 3. Pairwise scores, both directions, top-K per item.
        let ranked = cooccur::rank_co_occurrence(
            &sets,
            &CooccurrenceParams {
                min_co_interactions: params.min_co_interactions,
                min_jaccard: params.min_jaccard,
                top_k: params.top_k_per_item,
            },
        );
        if ranked.is_empty() {
            warn!("No item pairs met the similarity thresholds");
            return Ok(SimilarityComputeStats::from_ranked(&ranked));
        }

        // 4. Insert the new generation under a single version stamp.
        let stats = SimilarityComputeStats::from_ranked(&ranked);
        let now = Utc::now().timestamp();
        let rows = item_rows(ranked, now as u32, now as u64);
        let mut insert = self.store.insert("item_similarity")?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        info!("Inserted {} item similarity pairs (version {now})", rows.len());

        Ok(stats)
    }

    /// Runs one user-similarity cycle; same shape as the item cycle with
    /// the entity/interactor roles swapped.
    pub async fn compute_user_similarity(
        &self,
        params: &UserSimilarityParams,
    ) -> SimilarityComputeStats {
        match self.try_compute_user_similarity(params).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("User similarity computation failed: {e}");
                SimilarityComputeStats::failed(e.to_string())
            }
        }
    }

    async fn try_compute_user_similarity(
        &self,
        params: &UserSimilarityParams,
    ) -> Result<SimilarityComputeStats, EtlError> {
        self.purge_stale("user_similarity").await;

        let sets = self
            .fetch_interactor_sets(
                r#"
                SELECT
                    user_id AS entity_id,
                    groupUniqArray(content_id) AS interactors
                FROM watch_events
                WHERE event_date >= today() - ?
                  AND completion_rate >= 0.5
                GROUP BY user_id
                HAVING uniqExact(content_id) >= ?
                "#,
                params.lookback_days,
                params.min_item_interactions,
            )
            .await?;
        info!("Loaded {} qualifying users", sets.len());

        let ranked = cooccur::rank_co_occurrence(
            &sets,
            &CooccurrenceParams {
                min_co_interactions: params.min_common_items,
                min_jaccard: params.min_jaccard,
                top_k: params.top_k_per_user,
            },
        );
        if ranked.is_empty() {
            warn!("No user pairs met the similarity thresholds");
            return Ok(SimilarityComputeStats::from_ranked(&ranked));
        }

        let stats = SimilarityComputeStats::from_ranked(&ranked);
        let now = Utc::now().timestamp();
        let rows = user_rows(ranked, now as u32, now as u64);
        let mut insert = self.store.insert("user_similarity")?;
        for row in &rows {
            insert.write(row).await?;
        }
        insert.end().await?;
        info!("Inserted {} user similarity pairs (version {now})", rows.len());

        Ok(stats)
    }

    /// Appends qualifying watch events from the lookback window to the
    /// per-user recent-interaction log. Append-only: the cache sync caps
    /// what readers ever see, and the table merges on its own schedule.
    pub async fn update_user_recent_items(&self, lookback_days: u32) -> RecentItemsStats {
        match self.try_update_user_recent_items(lookback_days).await {
            Ok(stats) => stats,
            Err(e) => {
                error!("Recent items update failed: {e}");
                RecentItemsStats::failed(e.to_string())
            }
        }
    }

    async fn try_update_user_recent_items(
        &self,
        lookback_days: u32,
    ) -> Result<RecentItemsStats, EtlError> {
        self.store
            .query(
                r#"
                INSERT INTO user_recent_items
                    (user_id, post_id, interaction_type, interaction_time,
                     interaction_weight, version)
                SELECT
                    user_id,
                    content_id AS post_id,
                    if(completion_rate >= 0.9, 'complete', 'view') AS interaction_type,
                    event_time AS interaction_time,
                    completion_rate AS interaction_weight,
                    toUnixTimestamp(event_time) AS version
                FROM watch_events
                WHERE event_date >= today() - ?
                  AND completion_rate >= 0.5
                "#,
            )
            .bind(lookback_days)
            .execute()
            .await?;

        let counts = self
            .store
            .query(
                r#"
                SELECT
                    count() AS total_interactions,
                    uniqExact(user_id) AS unique_users,
                    uniqExact(post_id) AS unique_posts
                FROM user_recent_items
                WHERE interaction_time >= now() - INTERVAL ? DAY
                "#,
            )
            .bind(lookback_days)
            .fetch_one::<RecentActivityCounts>()
            .await?;
        info!(
            "Recent items refreshed: {} interactions across {} users",
            counts.total_interactions, counts.unique_users
        );

        Ok(RecentItemsStats {
            total_interactions: counts.total_interactions,
            unique_users: counts.unique_users,
            unique_posts: counts.unique_posts,
            error: None,
        })
    }

    async fn fetch_interactor_sets(
        &self,
        sql: &str,
        lookback_days: u32,
        min_interactions: u64,
    ) -> Result<Vec<(String, Vec<String>)>, EtlError> {
        let mut cursor = self
            .store
            .query(sql)
            .bind(lookback_days)
            .bind(min_interactions)
            .fetch::<EntityInteractors>()?;
        let mut sets = Vec::new();
        while let Some(row) = cursor.next().await? {
            sets.push((row.entity_id, row.interactors));
        }
        Ok(sets)
    }

    /// Deletes similarity rows past the retention window. Failures are
    /// logged and swallowed so a slow mutation never blocks the compute.
    async fn purge_stale(&self, table: &str) {
        let sql = format!(
            "ALTER TABLE {table} DELETE WHERE computed_at < now() - INTERVAL {RETENTION_DAYS} DAY"
        );
        if let Err(e) = self.store.query(&sql).execute().await {
            warn!("Retention purge on {table} failed: {e}");
        }
    }
}

fn item_rows(ranked: Vec<ScoredNeighbor>, computed_at: u32, version: u64) -> Vec<ItemSimilarityRow> {
    ranked
        .into_iter()
        .map(|n| ItemSimilarityRow {
            item_id: n.source_id,
            similar_item_id: n.neighbor_id,
            similarity_score: n.combined,
            similarity_type: ITEM_SIMILARITY_TYPE.to_string(),
            co_interaction_count: n.co_count,
            jaccard_score: n.jaccard,
            cosine_score: n.cosine,
            computed_at,
            version,
        })
        .collect()
}

fn user_rows(ranked: Vec<ScoredNeighbor>, computed_at: u32, version: u64) -> Vec<UserSimilarityRow> {
    ranked
        .into_iter()
        .map(|n| UserSimilarityRow {
            user_id: n.source_id,
            similar_user_id: n.neighbor_id,
            similarity_score: n.combined,
            similarity_type: USER_SIMILARITY_TYPE.to_string(),
            common_items_count: n.co_count,
            common_authors_count: 0,
            jaccard_score: n.jaccard,
            cosine_score: n.cosine,
            computed_at,
            version,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(source: &str, neighbor: &str, combined: f64) -> ScoredNeighbor {
        ScoredNeighbor {
            source_id: source.to_string(),
            neighbor_id: neighbor.to_string(),
            combined,
            jaccard: combined / 2.0,
            cosine: combined / 3.0,
            co_count: 7,
        }
    }

    #[test]
    fn test_item_rows_stamp_generation() {
        let ranked = vec![neighbor("a", "b", 0.9), neighbor("b", "a", 0.9)];
        let rows = item_rows(ranked, 1_700_000_000, 1_700_000_000);
        assert_eq!(rows.len(), 2);
        for row in &rows {
            assert_eq!(row.similarity_type, "co_interaction");
            assert_eq!(row.version, 1_700_000_000);
            assert_eq!(row.computed_at, 1_700_000_000);
            assert_eq!(row.co_interaction_count, 7);
        }
        assert_eq!(rows[0].item_id, "a");
        assert_eq!(rows[0].similar_item_id, "b");
    }

    #[test]
    fn test_user_rows_reserve_author_count() {
        let rows = user_rows(vec![neighbor("u1", "u2", 0.5)], 1, 1);
        assert_eq!(rows[0].similarity_type, "behavior");
        assert_eq!(rows[0].common_items_count, 7);
        assert_eq!(rows[0].common_authors_count, 0);
    }

    #[test]
    fn test_stats_from_ranked() {
        let ranked = vec![
            neighbor("a", "b", 0.8),
            neighbor("a", "c", 0.4),
            neighbor("b", "a", 0.8),
        ];
        let stats = SimilarityComputeStats::from_ranked(&ranked);
        assert_eq!(stats.pairs_inserted, 3);
        assert_eq!(stats.unique_entities, 2);
        assert!((stats.avg_similarity - 2.0 / 3.0).abs() < 1e-9);
        assert!((stats.max_similarity - 0.8).abs() < 1e-12);
        assert!(stats.error.is_none());
    }

    #[test]
    fn test_stats_from_empty_generation() {
        let stats = SimilarityComputeStats::from_ranked(&[]);
        assert_eq!(stats.pairs_inserted, 0);
        assert_eq!(stats.unique_entities, 0);
        assert_eq!(stats.avg_similarity, 0.0);
        assert_eq!(stats.max_similarity, 0.0);
    }
}
