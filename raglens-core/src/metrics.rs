//! Ranking-quality metrics for retrieval.
//!
//! All functions here are pure and total: empty inputs produce zeros, never
//! errors. The ranked list is deduplicated (first occurrence wins) before any
//! metric is computed, which keeps every value inside `[0, 1]`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::types::RetrievedDocument;

/// Cutoffs used when none are requested explicitly.
pub const DEFAULT_K_VALUES: [usize; 4] = [1, 3, 5, 10];

/// Metrics bundle for one ranked list against one relevance ground truth.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalMetrics {
    pub precision_at_k: BTreeMap<usize, f64>,
    pub recall_at_k: BTreeMap<usize, f64>,
    pub f1_at_k: BTreeMap<usize, f64>,
    pub mrr: f64,
    pub average_precision: f64,
    pub total_retrieved: usize,
    pub total_relevant: usize,
}

/// Summary statistics over the retriever's own similarity scores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreDistribution {
    pub count: usize,
    pub mean: Option<f64>,
    pub median: Option<f64>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub above_threshold: usize,
}

/// Computes precision, recall, F1, MRR and average precision.
#[derive(Debug, Clone)]
pub struct RetrievalMetricsCalculator {
    k_values: Vec<usize>,
}

impl Default for RetrievalMetricsCalculator {
    fn default() -> Self {
        Self::new(DEFAULT_K_VALUES)
    }
}

impl RetrievalMetricsCalculator {
    /// Create a calculator for the given cutoffs. Zero cutoffs are ignored.
    pub fn new(k_values: impl IntoIterator<Item = usize>) -> Self {
        let mut k_values: Vec<usize> = k_values.into_iter().filter(|&k| k > 0).collect();
        k_values.sort_unstable();
        k_values.dedup();
        Self { k_values }
    }

    pub fn k_values(&self) -> &[usize] {
        &self.k_values
    }

    /// Compute the full bundle for a ranked list of document ids.
    pub fn calculate<S: AsRef<str>>(&self, ranked: &[S], relevant: &HashSet<String>) -> RetrievalMetrics {
        let ranked = dedup_ranked(ranked);
        let mut precision_at_k = BTreeMap::new();
        let mut recall_at_k = BTreeMap::new();
        let mut f1_at_k = BTreeMap::new();

        for &k in &self.k_values {
            let p = precision_at_k_of(&ranked, relevant, k);
            let r = recall_at_k_of(&ranked, relevant, k);
            precision_at_k.insert(k, p);
            recall_at_k.insert(k, r);
            f1_at_k.insert(k, f1(p, r));
        }

        RetrievalMetrics {
            precision_at_k,
            recall_at_k,
            f1_at_k,
            mrr: reciprocal_rank(&ranked, relevant),
            average_precision: average_precision(&ranked, relevant),
            total_retrieved: ranked.len(),
            total_relevant: relevant.len(),
        }
    }

    /// Convenience wrapper over [`calculate`](Self::calculate) for retrieved documents.
    pub fn calculate_for_documents(
        &self,
        documents: &[RetrievedDocument],
        relevant: &HashSet<String>,
    ) -> RetrievalMetrics {
        let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
        self.calculate(&ids, relevant)
    }
}

fn dedup_ranked<S: AsRef<str>>(ranked: &[S]) -> Vec<&str> {
    let mut seen = HashSet::new();
    ranked
        .iter()
        .map(|id| id.as_ref())
        .filter(|id| seen.insert(*id))
        .collect()
}

fn hits_in_top_k(ranked: &[&str], relevant: &HashSet<String>, k: usize) -> usize {
    ranked
        .iter()
        .take(k)
        .filter(|id| relevant.contains(**id))
        .count()
}

/// `|relevant ∩ top_k| / k`.
pub fn precision_at_k<S: AsRef<str>>(ranked: &[S], relevant: &HashSet<String>, k: usize) -> f64 {
    precision_at_k_of(&dedup_ranked(ranked), relevant, k)
}

fn precision_at_k_of(ranked: &[&str], relevant: &HashSet<String>, k: usize) -> f64 {
    if k == 0 {
        return 0.0;
    }
    hits_in_top_k(ranked, relevant, k) as f64 / k as f64
}

/// `|relevant ∩ top_k| / |relevant|`, zero when nothing is relevant.
pub fn recall_at_k<S: AsRef<str>>(ranked: &[S], relevant: &HashSet<String>, k: usize) -> f64 {
    recall_at_k_of(&dedup_ranked(ranked), relevant, k)
}

fn recall_at_k_of(ranked: &[&str], relevant: &HashSet<String>, k: usize) -> f64 {
    if relevant.is_empty() {
        return 0.0;
    }
    hits_in_top_k(ranked, relevant, k) as f64 / relevant.len() as f64
}

/// Harmonic mean of precision and recall, zero when both are zero.
pub fn f1(precision: f64, recall: f64) -> f64 {
    if precision + recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    }
}

/// `1 / rank` of the first relevant item (1-indexed), zero if none appears.
pub fn mrr<S: AsRef<str>>(ranked: &[S], relevant: &HashSet<String>) -> f64 {
    reciprocal_rank(&dedup_ranked(ranked), relevant)
}

fn reciprocal_rank(ranked: &[&str], relevant: &HashSet<String>) -> f64 {
    ranked
        .iter()
        .position(|id| relevant.contains(*id))
        .map(|idx| 1.0 / (idx + 1) as f64)
        .unwrap_or(0.0)
}

/// Sum of precision at each relevant rank, divided by `|relevant|`.
pub fn average_precision<S: AsRef<str>>(ranked: &[S], relevant: &HashSet<String>) -> f64 {
    let ranked = dedup_ranked(ranked);
    if relevant.is_empty() {
        return 0.0;
    }
    let mut hits = 0usize;
    let mut precision_sum = 0.0;
    for (idx, id) in ranked.iter().enumerate() {
        if relevant.contains(*id) {
            hits += 1;
            precision_sum += hits as f64 / (idx + 1) as f64;
        }
    }
    precision_sum / relevant.len() as f64
}

/// Distribution of retriever similarity scores; `threshold` counts "relevant enough" hits.
pub fn score_distribution(documents: &[RetrievedDocument], threshold: f64) -> ScoreDistribution {
    if documents.is_empty() {
        return ScoreDistribution {
            count: 0,
            mean: None,
            median: None,
            min: None,
            max: None,
            above_threshold: 0,
        };
    }
    let mut scores: Vec<f64> = documents.iter().map(|d| d.relevance_score).collect();
    scores.sort_by(f64::total_cmp);
    let count = scores.len();
    ScoreDistribution {
        count,
        mean: Some(scores.iter().sum::<f64>() / count as f64),
        median: Some(scores[count / 2]),
        min: scores.first().copied(),
        max: scores.last().copied(),
        above_threshold: scores.iter().filter(|&&s| s >= threshold).count(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(ids: &[&str]) -> HashSet<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn test_ranked_list_with_two_relevant() {
        let relevant = set(&["d1", "d3"]);
        let ranked = ["d2", "d1", "d4", "d3", "d5"];
        let metrics = RetrievalMetricsCalculator::new([3]).calculate(&ranked, &relevant);

        assert!(approx(metrics.precision_at_k[&3], 1.0 / 3.0));
        assert!(approx(metrics.recall_at_k[&3], 0.5));
        assert!(approx(metrics.mrr, 0.5));
        // relevant at ranks 2 and 4: (1/2 + 2/4) / 2
        assert!(approx(metrics.average_precision, 0.5));
        assert!(approx(metrics.f1_at_k[&3], 0.4));
    }

    #[test]
    fn test_empty_relevant_set_yields_zero() {
        let relevant = HashSet::new();
        let ranked = ["d1", "d2", "d3"];
        let metrics = RetrievalMetricsCalculator::default().calculate(&ranked, &relevant);

        for k in DEFAULT_K_VALUES {
            assert_eq!(metrics.recall_at_k[&k], 0.0);
            assert_eq!(metrics.precision_at_k[&k], 0.0);
            assert_eq!(metrics.f1_at_k[&k], 0.0);
        }
        assert_eq!(metrics.average_precision, 0.0);
        assert_eq!(metrics.mrr, 0.0);
        assert_eq!(metrics.total_relevant, 0);
    }

    #[test]
    fn test_empty_ranked_list_yields_zero() {
        let relevant = set(&["d1"]);
        let empty: [&str; 0] = [];
        let metrics = RetrievalMetricsCalculator::default().calculate(&empty, &relevant);
        assert_eq!(metrics.mrr, 0.0);
        assert_eq!(metrics.average_precision, 0.0);
        assert_eq!(metrics.recall_at_k[&10], 0.0);
        assert_eq!(metrics.total_retrieved, 0);
    }

    #[test]
    fn test_short_list_divides_by_k() {
        let relevant = set(&["d1"]);
        assert!(approx(precision_at_k(&["d1"], &relevant, 5), 0.2));
        assert!(approx(recall_at_k(&["d1"], &relevant, 5), 1.0));
    }

    #[test]
    fn test_duplicates_are_ignored() {
        let relevant = set(&["d1"]);
        let ranked = ["d1", "d1", "d1"];
        assert!(approx(precision_at_k(&ranked, &relevant, 3), 1.0 / 3.0));
        assert!(approx(recall_at_k(&ranked, &relevant, 3), 1.0));
        assert!(approx(average_precision(&ranked, &relevant), 1.0));
    }

    #[test]
    fn test_no_relevant_in_list() {
        let relevant = set(&["x"]);
        let ranked = ["a", "b"];
        assert_eq!(mrr(&ranked, &relevant), 0.0);
        assert_eq!(average_precision(&ranked, &relevant), 0.0);
    }

    #[test]
    fn test_f1_zero_division() {
        assert_eq!(f1(0.0, 0.0), 0.0);
        assert!(approx(f1(1.0, 1.0), 1.0));
    }

    #[test]
    fn test_calculator_normalizes_k_values() {
        let calc = RetrievalMetricsCalculator::new([5, 0, 1, 5, 3]);
        assert_eq!(calc.k_values(), &[1, 3, 5]);
    }

    #[test]
    fn test_calculate_for_documents() {
        let docs = vec![
            RetrievedDocument::new("d2", "b", 0.9),
            RetrievedDocument::new("d1", "a", 0.8),
        ];
        let metrics =
            RetrievalMetricsCalculator::new([1, 2]).calculate_for_documents(&docs, &set(&["d1"]));
        assert_eq!(metrics.precision_at_k[&1], 0.0);
        assert!(approx(metrics.precision_at_k[&2], 0.5));
    }

    #[test]
    fn test_score_distribution() {
        let docs = vec![
            RetrievedDocument::new("a", "", 0.2),
            RetrievedDocument::new("b", "", 0.9),
            RetrievedDocument::new("c", "", 0.6),
        ];
        let dist = score_distribution(&docs, 0.5);
        assert_eq!(dist.count, 3);
        assert_eq!(dist.median, Some(0.6));
        assert_eq!(dist.min, Some(0.2));
        assert_eq!(dist.max, Some(0.9));
        assert_eq!(dist.above_threshold, 2);

        let empty = score_distribution(&[], 0.5);
        assert_eq!(empty.count, 0);
        assert!(empty.mean.is_none());
    }

    #[test]
    fn test_metrics_serialize_with_integer_keys() {
        let metrics = RetrievalMetricsCalculator::new([1]).calculate(&["d1"], &set(&["d1"]));
        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["precision_at_k"]["1"], 1.0);
        let back: RetrievalMetrics = serde_json::from_value(json).unwrap();
        assert_eq!(back, metrics);
    }
}
