//! Property-based tests for retrieval metrics and score normalization.

use proptest::prelude::*;
use std::collections::HashSet;

use raglens_core::metrics::{RetrievalMetricsCalculator, average_precision, mrr, precision_at_k, recall_at_k};
use raglens_core::types::{CriterionScores, EvaluationScores};

fn ids(raw: &[u8]) -> Vec<String> {
    raw.iter().map(|n| format!("d{n}")).collect()
}

fn relevant(raw: &[u8]) -> HashSet<String> {
    ids(raw).into_iter().collect()
}

// --- Bounds ---

proptest! {
    #[test]
    fn metrics_stay_in_unit_interval(
        ranked in prop::collection::vec(0u8..20, 0..30),
        truth in prop::collection::vec(0u8..20, 0..10),
        k in 1usize..15,
    ) {
        let ranked = ids(&ranked);
        let truth = relevant(&truth);
        for value in [
            precision_at_k(&ranked, &truth, k),
            recall_at_k(&ranked, &truth, k),
            mrr(&ranked, &truth),
            average_precision(&ranked, &truth),
        ] {
            prop_assert!((0.0..=1.0).contains(&value), "out of range: {}", value);
        }
    }

    #[test]
    fn recall_never_decreases_with_k(
        ranked in prop::collection::vec(0u8..20, 0..30),
        truth in prop::collection::vec(0u8..20, 1..10),
        k in 1usize..15,
    ) {
        let ranked = ids(&ranked);
        let truth = relevant(&truth);
        prop_assert!(recall_at_k(&ranked, &truth, k) <= recall_at_k(&ranked, &truth, k + 1));
    }

    #[test]
    fn empty_truth_zeroes_recall_and_ap(
        ranked in prop::collection::vec(0u8..20, 1..30),
        k in 1usize..15,
    ) {
        let ranked = ids(&ranked);
        let truth = HashSet::new();
        prop_assert_eq!(recall_at_k(&ranked, &truth, k), 0.0);
        prop_assert_eq!(average_precision(&ranked, &truth), 0.0);
        prop_assert_eq!(mrr(&ranked, &truth), 0.0);
    }

    #[test]
    fn calculator_reports_every_requested_k(
        ranked in prop::collection::vec(0u8..20, 0..30),
        truth in prop::collection::vec(0u8..20, 0..10),
        ks in prop::collection::vec(1usize..20, 1..6),
    ) {
        let calculator = RetrievalMetricsCalculator::new(ks.clone());
        let metrics = calculator.calculate(&ids(&ranked), &relevant(&truth));
        for k in ks {
            prop_assert!(metrics.precision_at_k.contains_key(&k));
            prop_assert!(metrics.recall_at_k.contains_key(&k));
            let f1 = metrics.f1_at_k[&k];
            prop_assert!((0.0..=1.0).contains(&f1));
        }
    }

    #[test]
    fn overall_score_is_normalized(
        values in prop::collection::vec(1u8..=5, 6),
    ) {
        let criteria = CriterionScores {
            accuracy: values[0],
            completeness: values[1],
            faithfulness: values[2],
            tone: values[3],
            relevance: values[4],
            clarity: values[5],
        };
        let overall = EvaluationScores::from_criteria(criteria).overall_score().unwrap();
        let mean = values.iter().map(|&v| f64::from(v)).sum::<f64>() / 6.0;
        prop_assert!((0.2..=1.0).contains(&overall));
        prop_assert!((overall - mean / 5.0).abs() < 1e-9);
    }
}

// --- Worked examples ---

#[test]
fn test_two_relevant_documents_in_five() {
    let ranked = ["d2", "d1", "d4", "d3", "d5"];
    let truth = relevant(&[1, 3]);
    let metrics = RetrievalMetricsCalculator::new([3]).calculate(&ranked, &truth);
    assert!((metrics.precision_at_k[&3] - 1.0 / 3.0).abs() < 1e-12);
    assert_eq!(metrics.recall_at_k[&3], 0.5);
    assert_eq!(metrics.mrr, 0.5);
    assert_eq!(metrics.total_retrieved, 5);
    assert_eq!(metrics.total_relevant, 2);
}

#[test]
fn test_empty_relevant_set_is_not_an_error() {
    let ranked = ["d1", "d2", "d3"];
    let metrics = RetrievalMetricsCalculator::default().calculate(&ranked, &HashSet::new());
    assert!(metrics.recall_at_k.values().all(|&r| r == 0.0));
    assert_eq!(metrics.average_precision, 0.0);
}
