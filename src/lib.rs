//! clipseek - search a local image folder by text or image similarity.
//!
//! Every image in a folder is embedded once with a CLIP encoder and the
//! vectors are kept in a [redb](https://github.com/cberner/redb) cache next
//! to the folder. Later searches only embed new files, then rank the whole
//! folder against the query with an exact top-k scan.
//!
//! # Quick start
//!
//! ```no_run
//! use clipseek::{
//!     ClipProvider, LoadMode, ScanCoordinator, ScanOptions, VectorStore,
//!     Vocabulary,
//! };
//! use clipseek::clip::{DEFAULT_MODEL_ID, DEFAULT_REVISION, DeviceChoice};
//! use clipseek::search::{self, SearchParams, DEFAULT_PREFIX};
//! use clipseek::target::Query;
//! use std::path::Path;
//!
//! let device = DeviceChoice::Auto.resolve().unwrap();
//! let provider =
//!     ClipProvider::load(DEFAULT_MODEL_ID, DEFAULT_REVISION, device).unwrap();
//! let mut store =
//!     VectorStore::load(Path::new("images_features.redb"), LoadMode::Resume)
//!         .unwrap();
//! let coordinator = ScanCoordinator::new(&provider, ScanOptions::default());
//!
//! let params = SearchParams {
//!     query: Query::new(Some("dog on a beach".into()), None).unwrap(),
//!     prefix: DEFAULT_PREFIX.to_string(),
//!     results: 5,
//!     policy: Default::default(),
//! };
//!
//! let outcome = search::execute_search(
//!     &params,
//!     Path::new("images"),
//!     &Vocabulary::cifar100(),
//!     &coordinator,
//!     &mut store,
//! )
//! .unwrap();
//! for r in &outcome.results {
//!     println!("{} (score: {:.6})", r.identifier, r.score);
//! }
//! ```

pub mod cli;
pub mod clip;
pub mod error;
pub mod materialize;
pub mod policy;
pub mod provider;
pub mod ranker;
pub mod scan;
pub mod search;
pub mod target;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;
pub mod vector;
pub mod vector_store;
pub mod vocabulary;
pub mod walker;

pub use clip::ClipProvider;
pub use error::{Error, Result};
pub use policy::ComparabilityPolicy;
pub use provider::{EmbeddingProvider, TimeoutProvider};
pub use ranker::{RankedResult, SimilarityRanker};
pub use scan::{Candidate, ScanCoordinator, ScanOptions, ScanReport};
pub use target::{Query, Target};
#[cfg(any(test, feature = "test-util"))]
pub use testing::DeterministicProvider;
pub use vector::FeatureVector;
pub use vector_store::{CacheEntry, LoadMode, VectorStore};
pub use vocabulary::Vocabulary;
