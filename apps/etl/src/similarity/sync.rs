//! Cache synchronization: similarity tables → Redis sorted sets.
//!
//! Key layout and TTLs are a contract with the serving tier; the prefixes
//! below must match it byte-for-byte. Every key is rewritten wholesale
//! (DEL, ZADD, EXPIRE in one pipeline per page), so cached lists never mix
//! generations.

use redis::aio::ConnectionManager;
use serde::Serialize;
use tracing::{error, info, warn};

use crate::errors::EtlError;
use crate::models::similarity::NeighborPage;

pub const ITEM_SIMILAR_PREFIX: &str = "item:similar:";
pub const USER_SIMILAR_PREFIX: &str = "user:similar:";
pub const USER_RECENT_ITEMS_PREFIX: &str = "user:recent_items:";

const ITEM_SIMILAR_TTL_SECS: u64 = 86_400 * 7;
const USER_SIMILAR_TTL_SECS: u64 = 86_400 * 7;
const RECENT_ITEMS_TTL_SECS: u64 = 86_400 * 30;

/// Pairs members with scores, ranks by score descending, and caps at
/// `top_k`. Duplicate members keep their highest score. The write path
/// never trusts store-side ordering, so a cache key ends up holding exactly
/// the top K regardless of its prior contents.
pub fn rank_neighbors(
    members: Vec<String>,
    scores: Vec<f64>,
    top_k: usize,
) -> Vec<(String, f64)> {
    let mut paired: Vec<(String, f64)> = members.into_iter().zip(scores).collect();
    paired.sort_by(|a, b| b.1.total_cmp(&a.1));
    let mut seen = std::collections::HashSet::new();
    paired.retain(|(member, _)| seen.insert(member.clone()));
    paired.truncate(top_k);
    paired
}

/// Outcome of one sync pass over a namespace. A page failure bumps
/// `errors` and the pass moves on; `error` is set only when the pass could
/// not start at all.
#[derive(Debug, Default, Serialize)]
pub struct SyncStats {
    pub entities_processed: u64,
    pub members_synced: u64,
    pub errors: u64,
    pub error: Option<String>,
}

impl SyncStats {
    fn failed(message: String) -> Self {
        SyncStats {
            error: Some(message),
            ..SyncStats::default()
        }
    }
}

/// Advisory cache diagnostics, printed after a sync run.
#[derive(Debug, Serialize)]
pub struct CacheStats {
    pub item_similarity_keys: u64,
    pub user_similarity_keys: u64,
    pub user_recent_items_keys: u64,
    pub sample_item_neighbors: Option<u64>,
    pub sample_user_neighbors: Option<u64>,
}

/// Pushes similarity and recent-interaction data into the serving cache.
pub struct SimilaritySync {
    store: clickhouse::Client,
    cache: ConnectionManager,
}

impl SimilaritySync {
    pub fn new(store: clickhouse::Client, cache: ConnectionManager) -> Self {
        SimilaritySync { store, cache }
    }

    pub async fn sync_item_similarity(&self, batch_size: u64, top_k: usize) -> SyncStats {
        info!("Syncing item similarity to cache (top {top_k} per item)");
        match self
            .try_sync_namespace(
                "SELECT count(DISTINCT item_id) FROM item_similarity FINAL",
                r#"
                SELECT
                    item_id AS entity_id,
                    groupArray(similar_item_id) AS neighbor_ids,
                    groupArray(similarity_score) AS scores
                FROM item_similarity FINAL
                GROUP BY item_id
                ORDER BY item_id
                LIMIT ? OFFSET ?
                "#,
                ITEM_SIMILAR_PREFIX,
                ITEM_SIMILAR_TTL_SECS,
                batch_size,
                top_k,
            )
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                error!("Item similarity sync failed: {e}");
                SyncStats::failed(e.to_string())
            }
        }
    }

    pub async fn sync_user_similarity(&self, batch_size: u64, top_k: usize) -> SyncStats {
        info!("Syncing user similarity to cache (top {top_k} per user)");
        match self
            .try_sync_namespace(
                "SELECT count(DISTINCT user_id) FROM user_similarity FINAL",
                r#"
                SELECT
                    user_id AS entity_id,
                    groupArray(similar_user_id) AS neighbor_ids,
                    groupArray(similarity_score) AS scores
                FROM user_similarity FINAL
                GROUP BY user_id
                ORDER BY user_id
                LIMIT ? OFFSET ?
                "#,
                USER_SIMILAR_PREFIX,
                USER_SIMILAR_TTL_SECS,
                batch_size,
                top_k,
            )
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                error!("User similarity sync failed: {e}");
                SyncStats::failed(e.to_string())
            }
        }
    }

    /// Mirrors each user's recent qualifying interactions into the cache,
    /// scored by interaction timestamp so the newest win the cap.
    pub async fn sync_user_recent_items(
        &self,
        batch_size: u64,
        lookback_days: u32,
        max_items_per_user: usize,
    ) -> SyncStats {
        info!("Syncing recent items to cache ({lookback_days}d lookback)");
        match self
            .try_sync_recent(batch_size, lookback_days, max_items_per_user)
            .await
        {
            Ok(stats) => stats,
            Err(e) => {
                error!("Recent items sync failed: {e}");
                SyncStats::failed(e.to_string())
            }
        }
    }

    async fn try_sync_namespace(
        &self,
        count_sql: &str,
        page_sql: &str,
        prefix: &str,
        ttl_secs: u64,
        batch_size: u64,
        top_k: usize,
    ) -> Result<SyncStats, EtlError> {
        let batch_size = batch_size.max(1);
        let total = self.store.query(count_sql).fetch_one::<u64>().await?;
        info!("{total} entities to sync under {prefix}");

        let mut stats = SyncStats::default();
        let mut conn = self.cache.clone();
        let mut offset = 0u64;
        while offset < total {
            let page = self
                .store
                .query(page_sql)
                .bind(batch_size)
                .bind(offset)
                .fetch_all::<NeighborPage>()
                .await;
            match page {
                Ok(page) => match write_page(&mut conn, prefix, ttl_secs, top_k, page).await {
                    Ok((entities, members)) => {
                        stats.entities_processed += entities;
                        stats.members_synced += members;
                    }
                    Err(e) => {
                        warn!("Cache write failed at offset {offset} under {prefix}: {e}");
                        stats.errors += 1;
                    }
                },
                Err(e) => {
                    warn!("Page fetch failed at offset {offset} under {prefix}: {e}");
                    stats.errors += 1;
                }
            }
            offset += batch_size;
        }
        Ok(stats)
    }

    async fn try_sync_recent(
        &self,
        batch_size: u64,
        lookback_days: u32,
        max_items_per_user: usize,
    ) -> Result<SyncStats, EtlError> {
        let batch_size = batch_size.max(1);
        let total = self
            .store
            .query(
                r#"
                SELECT count(DISTINCT user_id)
                FROM user_recent_items
                WHERE interaction_time >= now() - INTERVAL ? DAY
                "#,
            )
            .bind(lookback_days)
            .fetch_one::<u64>()
            .await?;
        info!("{total} users with recent interactions to sync");

        let mut stats = SyncStats::default();
        let mut conn = self.cache.clone();
        let mut offset = 0u64;
        while offset < total {
            let page = self
                .store
                .query(
                    r#"
                    SELECT
                        user_id AS entity_id,
                        groupArray(post_id) AS neighbor_ids,
                        groupArray(toFloat64(toUnixTimestamp(interaction_time))) AS scores
                    FROM user_recent_items
                    WHERE interaction_time >= now() - INTERVAL ? DAY
                    GROUP BY user_id
                    ORDER BY user_id
                    LIMIT ? OFFSET ?
                    "#,
                )
                .bind(lookback_days)
                .bind(batch_size)
                .bind(offset)
                .fetch_all::<NeighborPage>()
                .await;
            match page {
                Ok(page) => {
                    match write_page(
                        &mut conn,
                        USER_RECENT_ITEMS_PREFIX,
                        RECENT_ITEMS_TTL_SECS,
                        max_items_per_user,
                        page,
                    )
                    .await
                    {
                        Ok((entities, members)) => {
                            stats.entities_processed += entities;
                            stats.members_synced += members;
                        }
                        Err(e) => {
                            warn!("Cache write failed at offset {offset} for recent items: {e}");
                            stats.errors += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!("Page fetch failed at offset {offset} for recent items: {e}");
                    stats.errors += 1;
                }
            }
            offset += batch_size;
        }
        Ok(stats)
    }

    /// Live key counts per namespace plus one sampled set cardinality each.
    /// KEYS walks the whole keyspace; this is for post-run inspection, not
    /// the serving path.
    pub async fn get_sync_stats(&self) -> Result<CacheStats, EtlError> {
        let mut conn = self.cache.clone();

        let item_keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{ITEM_SIMILAR_PREFIX}*"))
            .query_async(&mut conn)
            .await?;
        let user_keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{USER_SIMILAR_PREFIX}*"))
            .query_async(&mut conn)
            .await?;
        let recent_keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{USER_RECENT_ITEMS_PREFIX}*"))
            .query_async(&mut conn)
            .await?;

        let sample_item_neighbors = match item_keys.first() {
            Some(key) => Some(
                redis::cmd("ZCARD")
                    .arg(key)
                    .query_async::<_, u64>(&mut conn)
                    .await?,
            ),
            None => None,
        };
        let sample_user_neighbors = match user_keys.first() {
            Some(key) => Some(
                redis::cmd("ZCARD")
                    .arg(key)
                    .query_async::<_, u64>(&mut conn)
                    .await?,
            ),
            None => None,
        };

        Ok(CacheStats {
            item_similarity_keys: item_keys.len() as u64,
            user_similarity_keys: user_keys.len() as u64,
            user_recent_items_keys: recent_keys.len() as u64,
            sample_item_neighbors,
            sample_user_neighbors,
        })
    }
}

/// Assembles the rewrite commands for a page of (key, ranked neighbors)
/// in execution order: DEL first for every key, then ZADD with the
/// (score, member) pairs and an EXPIRE for keys that ranked anything.
/// Keys with nothing ranked are still cleared.
fn page_commands(page: &[(String, Vec<(String, f64)>)], ttl_secs: u64) -> Vec<Vec<String>> {
    let mut commands = Vec::new();
    for (key, ranked) in page {
        commands.push(vec!["DEL".to_string(), key.clone()]);
        if ranked.is_empty() {
            continue;
        }
        let mut zadd = vec!["ZADD".to_string(), key.clone()];
        for (member, score) in ranked {
            zadd.push(score.to_string());
            zadd.push(member.clone());
        }
        commands.push(zadd);
        commands.push(vec![
            "EXPIRE".to_string(),
            key.clone(),
            ttl_secs.to_string(),
        ]);
    }
    commands
}

/// Rewrites every entity on the page in one pipelined round-trip and
/// returns (entities written, members written). Nothing is counted if the
/// pipeline fails; the whole page is retried on the next run.
async fn write_page(
    conn: &mut ConnectionManager,
    prefix: &str,
    ttl_secs: u64,
    top_k: usize,
    page: Vec<NeighborPage>,
) -> Result<(u64, u64), EtlError> {
    let ranked_page: Vec<(String, Vec<(String, f64)>)> = page
        .into_iter()
        .map(|row| {
            let key = format!("{prefix}{}", row.entity_id);
            (key, rank_neighbors(row.neighbor_ids, row.scores, top_k))
        })
        .collect();
    let entities = ranked_page.len() as u64;
    let members: u64 = ranked_page.iter().map(|(_, ranked)| ranked.len() as u64).sum();

    let mut pipe = redis::pipe();
    for command in page_commands(&ranked_page, ttl_secs) {
        if let Some((name, args)) = command.split_first() {
            pipe.cmd(name).arg(args).ignore();
        }
    }
    pipe.query_async::<_, ()>(conn).await?;
    Ok((entities, members))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_neighbors_caps_at_top_k() {
        // Input order deliberately scrambled; only the two best survive.
        let members = vec!["c".into(), "a".into(), "d".into(), "b".into()];
        let scores = vec![0.5, 0.9, 0.3, 0.7];
        let ranked = rank_neighbors(members, scores, 2);
        assert_eq!(
            ranked,
            vec![("a".to_string(), 0.9), ("b".to_string(), 0.7)]
        );
    }

    #[test]
    fn test_rank_neighbors_under_cap() {
        let ranked = rank_neighbors(vec!["x".into()], vec![0.4], 50);
        assert_eq!(ranked, vec![("x".to_string(), 0.4)]);
    }

    #[test]
    fn test_rank_neighbors_duplicate_keeps_highest() {
        let members = vec!["p".into(), "q".into(), "p".into()];
        let scores = vec![3.0, 2.0, 5.0];
        let ranked = rank_neighbors(members, scores, 10);
        assert_eq!(
            ranked,
            vec![("p".to_string(), 5.0), ("q".to_string(), 2.0)]
        );
    }

    #[test]
    fn test_rank_neighbors_mismatched_lengths() {
        // Zip stops at the shorter side rather than inventing scores.
        let ranked = rank_neighbors(vec!["a".into(), "b".into()], vec![1.0], 10);
        assert_eq!(ranked, vec![("a".to_string(), 1.0)]);
    }

    #[test]
    fn test_key_prefixes_match_serving_contract() {
        assert_eq!(ITEM_SIMILAR_PREFIX, "item:similar:");
        assert_eq!(USER_SIMILAR_PREFIX, "user:similar:");
        assert_eq!(USER_RECENT_ITEMS_PREFIX, "user:recent_items:");
    }

    #[test]
    fn test_page_commands_rewrite_is_wholesale() {
        // Four scored rows capped at two: the key is cleared first, then
        // exactly the two best members land, whatever the key held before.
        let ranked = rank_neighbors(
            vec!["a".into(), "b".into(), "c".into(), "d".into()],
            vec![0.9, 0.7, 0.5, 0.3],
            2,
        );
        let page = vec![("item:similar:9".to_string(), ranked)];
        let commands = page_commands(&page, 604_800);
        assert_eq!(
            commands,
            vec![
                vec!["DEL".to_string(), "item:similar:9".to_string()],
                vec![
                    "ZADD".to_string(),
                    "item:similar:9".to_string(),
                    "0.9".to_string(),
                    "a".to_string(),
                    "0.7".to_string(),
                    "b".to_string(),
                ],
                vec![
                    "EXPIRE".to_string(),
                    "item:similar:9".to_string(),
                    "604800".to_string(),
                ],
            ]
        );
    }

    #[test]
    fn test_page_commands_del_first_for_every_key() {
        let page = vec![
            (
                "item:similar:1".to_string(),
                vec![("2".to_string(), 0.9), ("3".to_string(), 0.7)],
            ),
            ("item:similar:4".to_string(), vec![]),
            ("item:similar:5".to_string(), vec![("6".to_string(), 0.4)]),
        ];
        let commands = page_commands(&page, 604_800);
        for (key, ranked) in &page {
            let del = commands
                .iter()
                .position(|c| c[0] == "DEL" && c[1] == *key)
                .unwrap();
            let zadd = commands.iter().position(|c| c[0] == "ZADD" && c[1] == *key);
            if ranked.is_empty() {
                // A key with no surviving neighbors is still cleared.
                assert!(zadd.is_none());
            } else {
                assert!(del < zadd.unwrap());
            }
        }
    }

    #[test]
    fn test_page_commands_repeat_assembly_identical() {
        // Two sync passes over the same similarity rows assemble the same
        // rewrite, so a second run leaves the cache contents unchanged.
        let build = || {
            let page = vec![
                (
                    "user:similar:7".to_string(),
                    rank_neighbors(vec!["1".into(), "2".into()], vec![0.6, 0.8], 10),
                ),
                ("user:similar:8".to_string(), vec![]),
            ];
            page_commands(&page, 604_800)
        };
        assert_eq!(build(), build());
    }
}
