use std::{path::Path, time::Duration};

use serde::Serialize;
use tracing::info;

use crate::{
    error::{Error, Result},
    policy::ComparabilityPolicy,
    provider::EmbeddingProvider,
    ranker::{RankedResult, SimilarityRanker},
    scan::{ScanCoordinator, ScanReport},
    target::{Query, Target},
    vector_store::VectorStore,
    vocabulary::Vocabulary,
};

/// Default text prefix prepended to the query and every vocabulary label.
pub const DEFAULT_PREFIX: &str = "a picture of ";
pub const DEFAULT_RESULTS: usize = 5;

/// Width of the separator lines in the human report.
const RULE_WIDTH: usize = 55;
/// Longest file name shown before truncation.
const NAME_WIDTH: usize = 27;

#[derive(Debug, Clone)]
pub struct SearchParams {
    pub query: Query,
    pub prefix: String,
    pub results: usize,
    pub policy: ComparabilityPolicy,
}

#[derive(Debug)]
pub struct SearchOutcome {
    /// Best first.
    pub results: Vec<RankedResult>,
    pub report: ScanReport,
}

/// Run a full search: build the target, scan the folder through the
/// cache, then rank every candidate.
///
/// The target is built before the scan so a bad query fails before any
/// file is embedded.
pub fn execute_search(
    params: &SearchParams,
    folder: &Path,
    vocabulary: &Vocabulary,
    coordinator: &ScanCoordinator<'_>,
    store: &mut VectorStore,
) -> Result<SearchOutcome> {
    let target = build_target(params, coordinator.provider(), vocabulary)?;
    search_folder(params, &target, folder, coordinator, store)
}

/// Validate `params` and embed the query side of the search.
pub fn build_target(
    params: &SearchParams,
    provider: &dyn EmbeddingProvider,
    vocabulary: &Vocabulary,
) -> Result<Target> {
    if params.results == 0 {
        return Err(Error::Input(
            "number of results must be at least 1".into(),
        ));
    }
    Target::build(provider, &params.query, &params.prefix, vocabulary)
}

/// Scan `folder` and rank its images against an already built target.
pub fn search_folder(
    params: &SearchParams,
    target: &Target,
    folder: &Path,
    coordinator: &ScanCoordinator<'_>,
    store: &mut VectorStore,
) -> Result<SearchOutcome> {
    let outcome = coordinator.scan(folder, store)?;

    let ranker = SimilarityRanker::new(params.policy);
    let results = ranker.rank(target, &outcome.candidates, params.results);
    info!(
        candidates = outcome.candidates.len(),
        returned = results.len(),
        policy = params.policy.name(),
        "ranked candidates"
    );

    Ok(SearchOutcome {
        results,
        report: outcome.report,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use super::*;
    use crate::{
        scan::ScanOptions,
        testing::DeterministicProvider,
        vector_store::LoadMode,
    };

    fn params(text: &str, results: usize) -> SearchParams {
        SearchParams {
            query: Query::new(Some(text.to_string()), None).unwrap(),
            prefix: DEFAULT_PREFIX.to_string(),
            results,
            policy: ComparabilityPolicy::default(),
        }
    }

    fn setup(files: &[&str]) -> (tempfile::TempDir, VectorStore) {
        let tmp = tempfile::tempdir().unwrap();
        let folder = tmp.path().join("images");
        std::fs::create_dir(&folder).unwrap();
        for name in files {
            std::fs::write(folder.join(name), name.as_bytes()).unwrap();
        }
        let store =
            VectorStore::load(&tmp.path().join("cache.redb"), LoadMode::Resume)
                .unwrap();
        (tmp, store)
    }

    #[test]
    fn zero_results_is_rejected_before_scanning() {
        let (tmp, mut store) = setup(&["a.jpg"]);
        let provider = DeterministicProvider::new("v1", 8);
        let coordinator = ScanCoordinator::new(&provider, ScanOptions::default());

        let err = execute_search(
            &params("cat", 0),
            &tmp.path().join("images"),
            &Vocabulary::default(),
            &coordinator,
            &mut store,
        )
        .unwrap_err();

        assert!(matches!(err, Error::Input(_)));
        assert_eq!(provider.image_calls(), 0);
    }

    #[test]
    fn returns_at_most_the_requested_count() {
        let (tmp, mut store) = setup(&["a.jpg", "b.png", "c.jpeg", "d.jpg"]);
        let provider = DeterministicProvider::new("v1", 8);
        let coordinator = ScanCoordinator::new(&provider, ScanOptions::default());

        let outcome = execute_search(
            &params("cat", 2),
            &tmp.path().join("images"),
            &Vocabulary::default(),
            &coordinator,
            &mut store,
        )
        .unwrap();

        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.results[0].score >= outcome.results[1].score);
        assert_eq!(outcome.report.misses, 4);
    }

    #[test]
    fn missing_query_image_is_an_input_error() {
        let (tmp, mut store) = setup(&["a.jpg"]);
        let provider = DeterministicProvider::new("v1", 8);
        let coordinator = ScanCoordinator::new(&provider, ScanOptions::default());
        let params = SearchParams {
            query: Query::new(None, Some(tmp.path().join("missing.jpg"))).unwrap(),
            ..params("unused", 5)
        };

        let err = execute_search(
            &params,
            &tmp.path().join("images"),
            &Vocabulary::default(),
            &coordinator,
            &mut store,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }

    #[test]
    fn image_query_ranks_identical_image_first() {
        let (tmp, mut store) = setup(&["a.jpg", "b.jpg", "c.jpg"]);
        let query_image = tmp.path().join("query.png");
        std::fs::write(&query_image, "b.jpg").unwrap();

        let provider = DeterministicProvider::new("v1", 32);
        let coordinator = ScanCoordinator::new(&provider, ScanOptions::default());
        let params = SearchParams {
            query: Query::new(None, Some(query_image)).unwrap(),
            prefix: DEFAULT_PREFIX.to_string(),
            results: 1,
            policy: ComparabilityPolicy::Cosine,
        };

        let outcome = execute_search(
            &params,
            &tmp.path().join("images"),
            &Vocabulary::default(),
            &coordinator,
            &mut store,
        )
        .unwrap();
        assert_eq!(outcome.results[0].identifier, "b.jpg");
    }

    #[test]
    fn interrupt_after_target_build_stops_the_scan() {
        let (tmp, mut store) = setup(&["a.jpg", "b.jpg"]);
        let provider = DeterministicProvider::new("v1", 8);
        let params = params("cat", 2);
        let target =
            build_target(&params, &provider, &Vocabulary::default()).unwrap();

        let cancel = AtomicBool::new(true);
        let coordinator = ScanCoordinator::new(&provider, ScanOptions::default())
            .with_cancel(&cancel);
        let outcome = search_folder(
            &params,
            &target,
            &tmp.path().join("images"),
            &coordinator,
            &mut store,
        )
        .unwrap();

        assert!(outcome.report.interrupted);
        assert!(outcome.results.is_empty());
        assert_eq!(provider.image_calls(), 0);
    }
}
