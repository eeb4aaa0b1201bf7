//! Score combination and multi-query result merging.
//!
//! The researcher stage issues one retrieval per sub-question and unions
//! the results here: dedup by chunk id (keeping the best score), total
//! deterministic descending-score order, then a hard cap.

use std::collections::HashMap;

use super::{RetrievalResult, ScoredChunk};

/// Convex combination of semantic and lexical relevance.
///
/// `weight_semantic` is clamped to `[0, 1]`; the lexical side receives
/// the complement.
#[must_use]
pub fn combine_score(semantic: f64, lexical: f64, weight_semantic: f64) -> f64 {
    let w = weight_semantic.clamp(0.0, 1.0);
    w * semantic + (1.0 - w) * lexical
}

/// Unions per-sub-question results into one ranked list.
///
/// Duplicate chunk ids keep their maximum score. Ordering is total and
/// deterministic: descending score, ties broken by ascending chunk id.
/// The merged list is truncated to `cap` elements (`0` means unlimited).
#[must_use]
pub fn merge_results(results: Vec<RetrievalResult>, cap: usize) -> RetrievalResult {
    let mut best: HashMap<String, ScoredChunk> = HashMap::new();
    for result in results {
        for scored in result.chunks() {
            match best.get(&scored.chunk.id) {
                Some(existing) if existing.score >= scored.score => {}
                _ => {
                    best.insert(scored.chunk.id.clone(), scored.clone());
                }
            }
        }
    }

    let mut merged: Vec<ScoredChunk> = best.into_values().collect();
    merged.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.chunk.id.cmp(&b.chunk.id))
    });
    if cap > 0 {
        merged.truncate(cap);
    }
    RetrievalResult::new(merged)
}
