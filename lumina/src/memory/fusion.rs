//! Reciprocal Rank Fusion of the vector and full-text result lists.

use super::store::MemoryHit;

/// RRF rank constant.
pub const RRF_K: f64 = 60.0;

/// Fuses two ranked lists. Each item's score is
/// `Σ weight / (k + rank + 1)` across the lists it appears in; the vector list
/// contributes `vector_weight`, the text list `1 - vector_weight`. Returns the
/// top `limit` items by fused score, each carrying `hybrid_score`.
pub fn rrf_fuse(
    vector_hits: Vec<MemoryHit>,
    text_hits: Vec<MemoryHit>,
    vector_weight: f32,
    limit: usize,
) -> Vec<MemoryHit> {
    let mut scores: std::collections::HashMap<i64, f64> = std::collections::HashMap::new();
    let mut items: std::collections::HashMap<i64, MemoryHit> = std::collections::HashMap::new();

    let mut absorb = |list: Vec<MemoryHit>, weight: f64| {
        for (rank, hit) in list.into_iter().enumerate() {
            let entry = scores.entry(hit.id).or_insert(0.0);
            *entry += weight / (RRF_K + rank as f64 + 1.0);
            items.entry(hit.id).or_insert(hit);
        }
    };
    absorb(vector_hits, vector_weight as f64);
    absorb(text_hits, (1.0 - vector_weight) as f64);

    let mut ranked: Vec<(i64, f64)> = scores.into_iter().collect();
    ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    ranked
        .into_iter()
        .take(limit)
        .filter_map(|(id, score)| {
            items.remove(&id).map(|mut hit| {
                hit.hybrid_score = score;
                hit
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: i64, content: &str) -> MemoryHit {
        MemoryHit {
            id,
            content: content.to_string(),
            created_at: String::new(),
            status: None,
            hit_count: None,
            similarity: None,
            hybrid_score: 0.0,
        }
    }

    #[test]
    fn item_in_both_lists_outranks_single_list_items() {
        let vector = vec![hit(1, "a"), hit(2, "b")];
        let text = vec![hit(2, "b"), hit(3, "c")];
        let fused = rrf_fuse(vector, text, 0.4, 10);
        assert_eq!(fused[0].id, 2);
        assert_eq!(fused.len(), 3);
        assert!(fused[0].hybrid_score > fused[1].hybrid_score);
    }

    #[test]
    fn weight_split_favours_the_heavier_list() {
        // With all weight on the text list, its top item wins.
        let vector = vec![hit(1, "a")];
        let text = vec![hit(2, "b")];
        let fused = rrf_fuse(vector, text, 0.0, 10);
        assert_eq!(fused[0].id, 2);

        let fused = rrf_fuse(vec![hit(1, "a")], vec![hit(2, "b")], 1.0, 10);
        assert_eq!(fused[0].id, 1);
    }

    #[test]
    fn limit_truncates_fused_list() {
        let vector = vec![hit(1, "a"), hit(2, "b"), hit(3, "c")];
        let fused = rrf_fuse(vector, Vec::new(), 0.5, 2);
        assert_eq!(fused.len(), 2);
    }

    #[test]
    fn exact_rrf_score() {
        // Single list, weight 0.4, rank 0: score = 0.4 / (60 + 0 + 1).
        let fused = rrf_fuse(vec![hit(1, "a")], Vec::new(), 0.4, 10);
        let expected = 0.4 / (RRF_K + 1.0);
        assert!((fused[0].hybrid_score - expected).abs() < 1e-9);
    }
}
