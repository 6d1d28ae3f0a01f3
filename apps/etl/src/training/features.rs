//! Batch feature-snapshot lookup for training samples.

use std::collections::HashMap;

use tracing::{info, warn};

use crate::errors::EtlError;
use crate::models::training::FeatureSnapshot;

/// Reads precomputed per-(user, post) feature snapshots.
pub struct FeatureExtractor {
    store: clickhouse::Client,
}

impl FeatureExtractor {
    pub fn new(store: clickhouse::Client) -> Self {
        FeatureExtractor { store }
    }

    /// Most recent snapshot per requested (user, post) pair, keyed for the
    /// join. Pairs without a snapshot are simply absent. A store failure
    /// degrades to an empty map with a warning; affected samples keep null
    /// feature values instead of being dropped.
    pub async fn features_batch(
        &self,
        pairs: &[(String, String)],
    ) -> HashMap<(String, String), FeatureSnapshot> {
        if pairs.is_empty() {
            return HashMap::new();
        }

        let mut user_ids: Vec<String> = pairs.iter().map(|(u, _)| u.clone()).collect();
        user_ids.sort_unstable();
        user_ids.dedup();
        let mut post_ids: Vec<String> = pairs.iter().map(|(_, p)| p.clone()).collect();
        post_ids.sort_unstable();
        post_ids.dedup();

        match self.try_features_batch(user_ids, post_ids).await {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Feature lookup failed, continuing without features: {e}");
                HashMap::new()
            }
        }
    }

    // The WHERE clause is a superset filter (any requested user crossed
    // with any requested post); the caller joins on exact pairs.
    async fn try_features_batch(
        &self,
        user_ids: Vec<String>,
        post_ids: Vec<String>,
    ) -> Result<HashMap<(String, String), FeatureSnapshot>, EtlError> {
        let rows = self
            .store
            .query(
                r#"
                SELECT
                    user_id,
                    post_id,
                    toUInt64(user_follower_count) AS user_follower_count,
                    toUInt64(user_following_count) AS user_following_count,
                    toUInt64(user_post_count) AS user_post_count,
                    toFloat64(user_avg_session_length) AS user_avg_session_length,
                    toUInt32(user_active_days_30d) AS user_active_days_30d,
                    toFloat64(post_age_hours) AS post_age_hours,
                    toUInt64(post_like_count) AS post_like_count,
                    toUInt64(post_comment_count) AS post_comment_count,
                    toUInt64(post_view_count) AS post_view_count,
                    toFloat64(post_completion_rate) AS post_completion_rate,
                    toFloat64(post_engagement_rate) AS post_engagement_rate,
                    toUInt8(has_music) AS has_music,
                    toUInt8(is_original) AS is_original,
                    toUInt64(author_follower_count) AS author_follower_count,
                    toFloat64(author_avg_engagement) AS author_avg_engagement,
                    toFloat64(author_post_frequency) AS author_post_frequency,
                    toFloat64(user_author_affinity) AS user_author_affinity,
                    toUInt64(user_author_interaction_count) AS user_author_interaction_count,
                    toFloat64(recall_weight) AS recall_weight,
                    extra_features
                FROM training_features
                WHERE has(?, user_id)
                  AND has(?, post_id)
                ORDER BY snapshot_time DESC
                LIMIT 1 BY user_id, post_id
                "#,
            )
            .bind(user_ids)
            .bind(post_ids)
            .fetch_all::<FeatureSnapshot>()
            .await?;
        info!("Fetched {} feature snapshots", rows.len());

        Ok(rows
            .into_iter()
            .map(|row| ((row.user_id.clone(), row.post_id.clone()), row))
            .collect())
    }
}
