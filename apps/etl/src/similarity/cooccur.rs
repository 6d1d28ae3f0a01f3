//! In-process co-occurrence similarity.
//!
//! The store only aggregates per-entity interactor sets; everything pairwise
//! happens here: inverted index, candidate enumeration over shared
//! interactors, jaccard/cosine scoring, and a bounded top-K per source.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap, HashSet};

/// Weight of the jaccard term in the combined score.
pub const JACCARD_WEIGHT: f64 = 0.6;
/// Weight of the cosine term in the combined score.
pub const COSINE_WEIGHT: f64 = 0.4;

// ────────────────────────────────────────────────────────────────────────────
// Parameters and output
// ────────────────────────────────────────────────────────────────────────────

/// Thresholds and caps for one co-occurrence run.
#[derive(Debug, Clone, Copy)]
pub struct CooccurrenceParams {
    /// Minimum shared interactors for a pair to be scored at all.
    pub min_co_interactions: u32,
    /// Jaccard floor, applied after the combined score is computed.
    pub min_jaccard: f64,
    /// Outgoing neighbors kept per source entity.
    pub top_k: usize,
}

/// One directed scored neighbor, ranked within its source entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredNeighbor {
    pub source_id: String,
    pub neighbor_id: String,
    pub combined: f64,
    pub jaccard: f64,
    pub cosine: f64,
    pub co_count: u32,
}

/// Combined relevance score: 0.6*jaccard + 0.4*cosine.
pub fn combined_score(jaccard: f64, cosine: f64) -> f64 {
    JACCARD_WEIGHT * jaccard + COSINE_WEIGHT * cosine
}

// ────────────────────────────────────────────────────────────────────────────
// Engine
// ────────────────────────────────────────────────────────────────────────────

/// Scores every entity pair sharing at least `min_co_interactions`
/// interactors and returns, per source entity, the top `top_k` neighbors by
/// combined score descending. Pairs are emitted in both directions.
///
/// 1. Build an inverted interactor → entities index (duplicate interactors
///    within one entity are ignored).
/// 2. Count shared interactors per unordered entity pair; only pairs that
///    actually share someone ever materialize, never a full cross join.
/// 3. jaccard = |∩|/|∪|, cosine = |∩|/sqrt(|A||B|), combined as above.
///    The jaccard floor is the only score filter; combined is never
///    thresholded.
/// 4. A bounded min-heap per source keeps memory proportional to K.
///
/// Output is grouped by source in input order, neighbors descending; ties
/// break on input position, which callers must not rely on.
pub fn rank_co_occurrence(
    entities: &[(String, Vec<String>)],
    params: &CooccurrenceParams,
) -> Vec<ScoredNeighbor> {
    if params.top_k == 0 || entities.len() < 2 {
        return Vec::new();
    }

    // 1. Inverted index over deduplicated interactor sets.
    let mut set_sizes = vec![0usize; entities.len()];
    let mut inverted: HashMap<&str, Vec<u32>> = HashMap::new();
    for (idx, (_, interactors)) in entities.iter().enumerate() {
        let mut seen: HashSet<&str> = HashSet::with_capacity(interactors.len());
        for interactor in interactors {
            if seen.insert(interactor.as_str()) {
                inverted
                    .entry(interactor.as_str())
                    .or_default()
                    .push(idx as u32);
            }
        }
        set_sizes[idx] = seen.len();
    }

    // 2. Shared-interactor counts per unordered pair. Entity lists inside the
    //    index are in input order, so (a, b) always has a < b.
    let mut co_counts: HashMap<(u32, u32), u32> = HashMap::new();
    for sharers in inverted.values() {
        for (pos, &a) in sharers.iter().enumerate() {
            for &b in &sharers[pos + 1..] {
                *co_counts.entry((a, b)).or_insert(0) += 1;
            }
        }
    }

    // 3 + 4. Score qualifying pairs and feed both directions through the
    //        per-source heaps.
    let mut rankings: Vec<TopK> = (0..entities.len()).map(|_| TopK::new(params.top_k)).collect();
    for (&(a, b), &co_count) in &co_counts {
        if co_count < params.min_co_interactions {
            continue;
        }
        let size_a = set_sizes[a as usize] as f64;
        let size_b = set_sizes[b as usize] as f64;
        let intersection = f64::from(co_count);
        let jaccard = intersection / (size_a + size_b - intersection);
        let cosine = intersection / (size_a * size_b).sqrt();
        let combined = combined_score(jaccard, cosine);
        if jaccard < params.min_jaccard {
            continue;
        }
        let entry = HeapEntry {
            combined,
            jaccard,
            cosine,
            co_count,
            neighbor: b,
        };
        rankings[a as usize].push(entry);
        rankings[b as usize].push(HeapEntry { neighbor: a, ..entry });
    }

    let mut ranked = Vec::new();
    for (idx, ranking) in rankings.into_iter().enumerate() {
        let source_id = &entities[idx].0;
        for entry in ranking.into_sorted_desc() {
            ranked.push(ScoredNeighbor {
                source_id: source_id.clone(),
                neighbor_id: entities[entry.neighbor as usize].0.clone(),
                combined: entry.combined,
                jaccard: entry.jaccard,
                cosine: entry.cosine,
                co_count: entry.co_count,
            });
        }
    }
    ranked
}

// ────────────────────────────────────────────────────────────────────────────
// Bounded top-K accumulator
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
struct HeapEntry {
    combined: f64,
    jaccard: f64,
    cosine: f64,
    co_count: u32,
    neighbor: u32,
}

impl Eq for HeapEntry {}

// Scores are never NaN here: co_count >= 1 and both set sizes >= 1.
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.combined
            .total_cmp(&other.combined)
            .then_with(|| other.neighbor.cmp(&self.neighbor))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Min-heap of the best `cap` entries seen so far.
struct TopK {
    cap: usize,
    heap: BinaryHeap<Reverse<HeapEntry>>,
}

impl TopK {
    fn new(cap: usize) -> Self {
        TopK {
            cap,
            heap: BinaryHeap::new(),
        }
    }

    fn push(&mut self, entry: HeapEntry) {
        if self.heap.len() < self.cap {
            self.heap.push(Reverse(entry));
        } else if let Some(Reverse(weakest)) = self.heap.peek() {
            if entry > *weakest {
                self.heap.pop();
                self.heap.push(Reverse(entry));
            }
        }
    }

    fn into_sorted_desc(self) -> Vec<HeapEntry> {
        let mut entries: Vec<HeapEntry> =
            self.heap.into_iter().map(|Reverse(entry)| entry).collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users(range: std::ops::RangeInclusive<u32>) -> Vec<String> {
        range.map(|u| format!("u{u}")).collect()
    }

    fn params(min_co: u32, min_jaccard: f64, top_k: usize) -> CooccurrenceParams {
        CooccurrenceParams {
            min_co_interactions: min_co,
            min_jaccard,
            top_k,
        }
    }

    #[test]
    fn test_overlapping_pair_scores() {
        // A = {1..10}, B = {5..14}: |∩| = 6, |∪| = 14
        let entities = vec![
            ("A".to_string(), users(1..=10)),
            ("B".to_string(), users(5..=14)),
        ];
        let ranked = rank_co_occurrence(&entities, &params(5, 0.05, 100));
        assert_eq!(ranked.len(), 2, "pair must be emitted in both directions");

        let ab = ranked.iter().find(|n| n.source_id == "A").unwrap();
        assert_eq!(ab.neighbor_id, "B");
        assert_eq!(ab.co_count, 6);
        assert!((ab.jaccard - 6.0 / 14.0).abs() < 1e-9, "jaccard was {}", ab.jaccard);
        assert!((ab.cosine - 0.6).abs() < 1e-9, "cosine was {}", ab.cosine);
        let expected = 0.6 * (6.0 / 14.0) + 0.4 * 0.6;
        assert!((ab.combined - expected).abs() < 1e-9, "combined was {}", ab.combined);

        let ba = ranked.iter().find(|n| n.source_id == "B").unwrap();
        assert_eq!(ba.neighbor_id, "A");
        assert!(
            (ba.combined - ab.combined).abs() < 1e-12,
            "direction must not change the score"
        );
    }

    #[test]
    fn test_min_co_interactions_filter() {
        // Only 4 shared users; the floor of 5 keeps the pair out entirely.
        let entities = vec![
            ("A".to_string(), users(1..=10)),
            ("B".to_string(), users(7..=16)),
        ];
        assert!(rank_co_occurrence(&entities, &params(5, 0.0, 100)).is_empty());
    }

    #[test]
    fn test_jaccard_floor_applies_after_scoring() {
        // |∩| = 2, |A| = 2, |B| = 40: jaccard = 0.05 but cosine ≈ 0.22, so a
        // combined-score floor would behave differently from the jaccard one.
        let entities = vec![
            ("A".to_string(), users(1..=2)),
            ("B".to_string(), users(1..=40)),
        ];
        let kept = rank_co_occurrence(&entities, &params(2, 0.05, 100));
        assert_eq!(kept.len(), 2, "jaccard exactly at the floor is retained");

        let dropped = rank_co_occurrence(&entities, &params(2, 0.1, 100));
        assert!(dropped.is_empty(), "jaccard below the floor is dropped");
    }

    #[test]
    fn test_top_k_cap_keeps_strongest() {
        // Hub overlaps n1 completely, n2 on 8 users, n3 on 6.
        let entities = vec![
            ("hub".to_string(), users(1..=10)),
            ("n1".to_string(), users(1..=10)),
            ("n2".to_string(), [users(1..=8), users(90..=91)].concat()),
            ("n3".to_string(), [users(1..=6), users(80..=83)].concat()),
        ];
        let ranked = rank_co_occurrence(&entities, &params(5, 0.0, 2));

        let hub: Vec<_> = ranked.iter().filter(|n| n.source_id == "hub").collect();
        assert_eq!(hub.len(), 2);
        assert_eq!(hub[0].neighbor_id, "n1");
        assert_eq!(hub[1].neighbor_id, "n2");
        assert!(hub[0].combined >= hub[1].combined, "neighbors must rank descending");

        for source in ["hub", "n1", "n2", "n3"] {
            let outgoing = ranked.iter().filter(|n| n.source_id == source).count();
            assert!(outgoing <= 2, "{source} has {outgoing} neighbors, cap is 2");
        }
    }

    #[test]
    fn test_duplicate_interactors_ignored() {
        let mut with_dupes = users(1..=5);
        with_dupes.push("u1".to_string());
        with_dupes.push("u3".to_string());
        let entities = vec![
            ("A".to_string(), with_dupes),
            ("B".to_string(), users(1..=5)),
        ];
        let ranked = rank_co_occurrence(&entities, &params(5, 0.05, 10));
        let ab = ranked.iter().find(|n| n.source_id == "A").unwrap();
        assert_eq!(ab.co_count, 5);
        assert!((ab.combined - 1.0).abs() < 1e-9, "identical sets must score 1.0");
    }

    #[test]
    fn test_empty_and_degenerate_inputs() {
        assert!(rank_co_occurrence(&[], &params(1, 0.0, 10)).is_empty());

        let single = vec![("A".to_string(), users(1..=10))];
        assert!(rank_co_occurrence(&single, &params(1, 0.0, 10)).is_empty());

        let pair = vec![
            ("A".to_string(), users(1..=10)),
            ("B".to_string(), users(1..=10)),
        ];
        assert!(rank_co_occurrence(&pair, &params(1, 0.0, 0)).is_empty());
    }
}
