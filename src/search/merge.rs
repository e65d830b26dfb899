//! Deterministic top-K selection.
//!
//! Ranking is similarity descending, then vector ID ascending, so equal
//! scores always come out in the same order no matter how the scan was
//! partitioned or which batch finished first.

use std::cmp::Ordering;

use crate::vector::SearchResult;

/// Total order used for every ranking in the engine.
pub fn rank(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.similarity
        .total_cmp(&a.similarity)
        .then_with(|| a.id().cmp(b.id()))
}

/// Keeps the `k` best results, sorted by [`rank`].
pub fn top_k(mut results: Vec<SearchResult>, k: usize) -> Vec<SearchResult> {
    if k == 0 {
        return Vec::new();
    }
    if results.len() > k {
        results.select_nth_unstable_by(k - 1, rank);
        results.truncate(k);
    }
    results.sort_unstable_by(rank);
    results
}

/// Merges batch-local rankings into the global top `k`.
pub fn merge_top_k<I>(batches: I, k: usize) -> Vec<SearchResult>
where
    I: IntoIterator<Item = Vec<SearchResult>>,
{
    top_k(batches.into_iter().flatten().collect(), k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::Vector;
    use std::sync::Arc;

    fn result(id: &str, similarity: f64) -> SearchResult {
        SearchResult::new(Arc::new(Vector::new(id, vec![1.0])), similarity)
    }

    fn ids(results: &[SearchResult]) -> Vec<&str> {
        results.iter().map(SearchResult::id).collect()
    }

    #[test]
    fn test_top_k_orders_and_truncates() {
        let results = vec![
            result("a", 0.1),
            result("b", 0.9),
            result("c", 0.5),
            result("d", -0.3),
        ];
        assert_eq!(ids(&top_k(results.clone(), 2)), vec!["b", "c"]);
        assert_eq!(ids(&top_k(results.clone(), 10)), vec!["b", "c", "a", "d"]);
        assert!(top_k(results, 0).is_empty());
    }

    #[test]
    fn test_ties_break_by_id() {
        let results = vec![
            result("zeta", 0.5),
            result("alpha", 0.5),
            result("mid", 0.5),
            result("best", 0.8),
        ];
        assert_eq!(ids(&top_k(results, 3)), vec!["best", "alpha", "mid"]);
    }

    #[test]
    fn test_merge_is_independent_of_batch_order() {
        let first = vec![result("a", 0.7), result("b", 0.2)];
        let second = vec![result("c", 0.9), result("d", 0.7)];
        let third = vec![result("e", 0.1)];

        let forward = merge_top_k(vec![first.clone(), second.clone(), third.clone()], 3);
        let backward = merge_top_k(vec![third, second, first], 3);
        assert_eq!(forward, backward);
        assert_eq!(ids(&forward), vec!["c", "a", "d"]);
    }
}
