//! Maximal Marginal Relevance reranking.
//!
//! Raw embeddings are not available at this layer, so inter-result
//! similarity is approximated by Euclidean distance in the
//! (vector_score, keyword_score) plane, normalized to [0, 1].

/// Relevance/diversity trade-off. 1.0 = pure relevance.
pub const MMR_LAMBDA: f64 = 0.7;

/// A candidate as the reranker sees it: combined score plus the two signal
/// scores that position it in the similarity plane.
pub trait MmrCandidate {
    fn score(&self) -> f64;
    fn vector_score(&self) -> f64;
    fn keyword_score(&self) -> f64;
}

/// Similarity of two candidates in the (vector, keyword) plane:
/// `1 − ‖Δ‖ / √2`.
fn plane_similarity<C: MmrCandidate>(a: &C, b: &C) -> f64 {
    let dv = a.vector_score() - b.vector_score();
    let dk = a.keyword_score() - b.keyword_score();
    1.0 - (dv * dv + dk * dk).sqrt() / std::f64::consts::SQRT_2
}

/// Select up to `k` results balancing relevance against similarity to the
/// already-selected set. The incoming list must be sorted by score
/// descending; the top hit is always kept.
pub fn mmr_rerank<C: MmrCandidate>(mut candidates: Vec<C>, k: usize, lambda: f64) -> Vec<C> {
    if candidates.len() <= k || candidates.is_empty() {
        return candidates;
    }

    let mut selected: Vec<C> = vec![candidates.remove(0)];
    while selected.len() < k && !candidates.is_empty() {
        let mut best_idx = 0;
        let mut best_mmr = f64::NEG_INFINITY;
        for (i, candidate) in candidates.iter().enumerate() {
            let max_sim = selected
                .iter()
                .map(|s| plane_similarity(candidate, s))
                .fold(f64::NEG_INFINITY, f64::max);
            let mmr = lambda * candidate.score() - (1.0 - lambda) * max_sim;
            if mmr > best_mmr {
                best_mmr = mmr;
                best_idx = i;
            }
        }
        selected.push(candidates.remove(best_idx));
    }
    selected
}
