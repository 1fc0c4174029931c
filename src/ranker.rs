use std::{
    cmp::{Ordering, Reverse},
    collections::BinaryHeap,
};

use rayon::prelude::*;
use serde::Serialize;

use crate::{
    policy::ComparabilityPolicy,
    scan::Candidate,
    target::Target,
};

/// A scored file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedResult {
    pub identifier: String,
    pub score: f32,
}

/// Scores candidates against a target and keeps the best `k`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SimilarityRanker {
    policy: ComparabilityPolicy,
}

impl SimilarityRanker {
    pub fn new(policy: ComparabilityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ComparabilityPolicy {
        self.policy
    }

    pub fn score(&self, target: &Target, candidate: &Candidate) -> f32 {
        self.policy.score(target, &candidate.vector)
    }

    /// Rank `candidates` and return at most `k` results, best first.
    pub fn rank(
        &self,
        target: &Target,
        candidates: &[Candidate],
        k: usize,
    ) -> Vec<RankedResult> {
        // Scores are computed in parallel but collected in scan order, which
        // the tie-break depends on.
        let scores: Vec<f32> = candidates
            .par_iter()
            .map(|c| self.score(target, c))
            .collect();

        top_k(
            candidates
                .iter()
                .zip(scores)
                .map(|(c, score)| (c.identifier.as_str(), score)),
            k,
        )
    }
}

struct HeapEntry<'a> {
    score: f32,
    seq: usize,
    identifier: &'a str,
}

impl HeapEntry<'_> {
    /// NaN sorts below every real score.
    fn key(&self) -> f32 {
        if self.score.is_nan() {
            f32::NEG_INFINITY
        } else {
            self.score
        }
    }
}

impl Ord for HeapEntry<'_> {
    /// Greater means better: higher score, then earlier in scan order.
    fn cmp(&self, other: &Self) -> Ordering {
        self.key()
            .total_cmp(&other.key())
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry<'_> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry<'_> {}

/// Select the `k` highest scores in O(n log k).
///
/// Equal scores keep their input order. Asking for more than there are
/// returns everything; `k == 0` returns nothing.
///
/// # Examples
///
/// ```
/// use clipseek::ranker::top_k;
///
/// let ranked = top_k([("a", 0.1), ("b", 0.9), ("c", 0.5)], 2);
/// let names: Vec<_> = ranked.iter().map(|r| r.identifier.as_str()).collect();
/// assert_eq!(names, ["b", "c"]);
/// ```
pub fn top_k<'a, I>(scored: I, k: usize) -> Vec<RankedResult>
where
    I: IntoIterator<Item = (&'a str, f32)>,
{
    if k == 0 {
        return Vec::new();
    }

    // Min-heap on "better": the root is the worst entry kept so far.
    let mut heap: BinaryHeap<Reverse<HeapEntry<'a>>> = BinaryHeap::new();
    for (seq, (identifier, score)) in scored.into_iter().enumerate() {
        let entry = HeapEntry {
            score,
            seq,
            identifier,
        };
        if heap.len() < k {
            heap.push(Reverse(entry));
        } else if let Some(mut worst) = heap.peek_mut()
            && entry > worst.0
        {
            *worst = Reverse(entry);
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|Reverse(e)| RankedResult {
            identifier: e.identifier.to_string(),
            score: e.score,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::FeatureVector;

    fn names(results: &[RankedResult]) -> Vec<&str> {
        results.iter().map(|r| r.identifier.as_str()).collect()
    }

    /// Full stable sort, the reference `top_k` must agree with.
    fn reference(scored: &[(&str, f32)], k: usize) -> Vec<String> {
        let mut sorted = scored.to_vec();
        sorted.sort_by(|a, b| b.1.total_cmp(&a.1));
        sorted.into_iter().take(k).map(|(n, _)| n.to_string()).collect()
    }

    #[test]
    fn ties_keep_scan_order() {
        let scored = [
            ("f0", 0.9),
            ("f1", 0.8),
            ("f2", 0.8),
            ("f3", 0.5),
            ("f4", 0.4),
            ("f5", 0.3),
            ("f6", 0.2),
            ("f7", 0.1),
            ("f8", 0.05),
            ("f9", 0.0),
        ];
        let results = top_k(scored, 3);
        assert_eq!(names(&results), ["f0", "f1", "f2"]);
        assert_eq!(names(&results), reference(&scored, 3));
    }

    #[test]
    fn tie_at_cutoff_prefers_earlier() {
        let scored = [("a", 0.5), ("b", 0.9), ("c", 0.5), ("d", 0.5)];
        let results = top_k(scored, 2);
        assert_eq!(names(&results), ["b", "a"]);
    }

    #[test]
    fn k_larger_than_candidates_returns_all() {
        let scored = [("a", 0.1), ("b", 0.3), ("c", 0.2)];
        let results = top_k(scored, 20);
        assert_eq!(names(&results), ["b", "c", "a"]);
    }

    #[test]
    fn k_zero_returns_nothing() {
        assert!(top_k([("a", 1.0)], 0).is_empty());
    }

    #[test]
    fn nan_scores_rank_last() {
        let scored = [("nan", f32::NAN), ("low", -5.0), ("high", 1.0)];
        let results = top_k(scored, 3);
        assert_eq!(names(&results), ["high", "low", "nan"]);
    }

    #[test]
    fn matches_reference_on_larger_input() {
        let owned: Vec<(String, f32)> = (0..200)
            .map(|i| (format!("img{i:03}"), ((i * 37) % 23) as f32 / 23.0))
            .collect();
        let scored: Vec<(&str, f32)> =
            owned.iter().map(|(n, s)| (n.as_str(), *s)).collect();

        for k in [1, 5, 17, 200, 500] {
            let results = top_k(scored.iter().copied(), k);
            assert_eq!(names(&results), reference(&scored, k), "k = {k}");
        }
    }

    fn unit(values: &[f32]) -> FeatureVector {
        FeatureVector::normalize(values.to_vec()).unwrap()
    }

    #[test]
    fn rank_orders_by_cosine() {
        let target = Target::from_vectors(vec![unit(&[1.0, 0.0])]).unwrap();
        let candidates = vec![
            Candidate {
                identifier: "far.jpg".into(),
                vector: unit(&[0.0, 1.0]),
            },
            Candidate {
                identifier: "near.jpg".into(),
                vector: unit(&[1.0, 0.1]),
            },
        ];

        let ranker = SimilarityRanker::new(ComparabilityPolicy::Cosine);
        let results = ranker.rank(&target, &candidates, 5);
        assert_eq!(names(&results), ["near.jpg", "far.jpg"]);
        assert!(results[0].score > results[1].score);
    }
}
