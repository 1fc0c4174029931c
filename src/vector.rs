use crate::error::{Error, Result};

/// Allowed deviation of a stored vector's L2 norm from 1.0.
pub const NORM_TOLERANCE: f32 = 1e-4;

/// A unit-length embedding.
///
/// Vectors are only comparable when they come from the same embedding
/// space; the space tag travels separately in [`crate::CacheEntry`].
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureVector(Vec<f32>);

impl FeatureVector {
    /// L2-normalize raw encoder output.
    ///
    /// Fails on empty, all-zero or non-finite input, none of which has a
    /// direction to compare.
    ///
    /// # Examples
    ///
    /// ```
    /// use clipseek::FeatureVector;
    ///
    /// let v = FeatureVector::normalize(vec![3.0, 4.0]).unwrap();
    /// assert_eq!(v.as_slice(), &[0.6, 0.8]);
    /// ```
    pub fn normalize(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(Error::Provider("embedding is empty".to_string()));
        }
        if values.iter().any(|v| !v.is_finite()) {
            return Err(Error::Provider(
                "embedding contains non-finite values".to_string(),
            ));
        }

        let norm = l2_norm(&values);
        if norm <= f32::EPSILON {
            return Err(Error::Provider(
                "embedding has zero magnitude".to_string(),
            ));
        }

        Ok(Self(values.into_iter().map(|v| v / norm).collect()))
    }

    /// Wrap values that are already unit length, e.g. read back from a
    /// snapshot. Returns `None` when the norm is off by more than
    /// [`NORM_TOLERANCE`].
    pub fn from_unit(values: Vec<f32>) -> Option<Self> {
        if values.is_empty() || values.iter().any(|v| !v.is_finite()) {
            return None;
        }
        ((l2_norm(&values) - 1.0).abs() <= NORM_TOLERANCE).then_some(Self(values))
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    pub fn dimension(&self) -> usize {
        self.0.len()
    }

    pub fn norm(&self) -> f32 {
        l2_norm(&self.0)
    }

    /// Dot product, which equals cosine similarity for unit vectors.
    pub fn dot(&self, other: &FeatureVector) -> f32 {
        debug_assert_eq!(
            self.dimension(),
            other.dimension(),
            "vectors must have same dimension"
        );
        self.0.iter().zip(&other.0).map(|(a, b)| a * b).sum()
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.0
    }
}

fn l2_norm(values: &[f32]) -> f32 {
    values.iter().map(|v| v * v).sum::<f32>().sqrt()
}
