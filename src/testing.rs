//! Test doubles for code that needs an [`EmbeddingProvider`].
//!
//! Built for unit tests and behind the `test-util` feature otherwise.

use std::{
    collections::{HashSet, hash_map::DefaultHasher},
    hash::{Hash, Hasher},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::{
    error::{Error, Result},
    provider::EmbeddingProvider,
    vector::FeatureVector,
};

/// Hash-based provider with no model behind it.
///
/// Each payload maps to a fixed pseudo-random unit vector, so equal
/// payloads (an image whose bytes equal a text) land on the same vector.
#[derive(Debug)]
pub struct DeterministicProvider {
    space_version: String,
    dimension: usize,
    failing: HashSet<Vec<u8>>,
    image_calls: AtomicUsize,
}

impl DeterministicProvider {
    pub fn new(space_version: &str, dimension: usize) -> Self {
        Self {
            space_version: space_version.to_string(),
            dimension,
            failing: HashSet::new(),
            image_calls: AtomicUsize::new(0),
        }
    }

    /// Make `embed_image` fail for exactly this payload.
    pub fn fail_on(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.failing.insert(payload.into());
        self
    }

    /// Number of `embed_image` calls so far, failed ones included.
    pub fn image_calls(&self) -> usize {
        self.image_calls.load(Ordering::SeqCst)
    }

    /// The vector this provider assigns to `payload`.
    pub fn vector_for(&self, payload: &[u8]) -> Result<FeatureVector> {
        let values = (0..self.dimension)
            .map(|i| {
                let mut hasher = DefaultHasher::new();
                payload.hash(&mut hasher);
                i.hash(&mut hasher);
                (hasher.finish() as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32
            })
            .collect();
        FeatureVector::normalize(values)
    }
}

impl EmbeddingProvider for DeterministicProvider {
    fn space_version(&self) -> &str {
        &self.space_version
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<FeatureVector>> {
        texts.iter().map(|t| self.vector_for(t.as_bytes())).collect()
    }

    fn embed_image(&self, image: &[u8]) -> Result<FeatureVector> {
        self.image_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(image) {
            return Err(Error::Provider("cannot decode image".to_string()));
        }
        self.vector_for(image)
    }
}
