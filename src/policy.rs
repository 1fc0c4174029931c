use crate::{
    error::{Error, Result},
    target::Target,
    vector::FeatureVector,
};

/// How a candidate's similarity to a [`Target`] becomes a score.
///
/// Only the ordering of scores is meaningful; their scale depends on the
/// policy, the vocabulary and the text prefix.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ComparabilityPolicy {
    /// Softmax over the dot products with every target vector; the score
    /// is the probability mass of the query vector.
    Softmax { temperature: f32 },
    /// Plain cosine similarity with the query vector.
    Cosine,
}

impl Default for ComparabilityPolicy {
    fn default() -> Self {
        Self::Softmax { temperature: 1.0 }
    }
}

impl ComparabilityPolicy {
    pub fn softmax(temperature: f32) -> Result<Self> {
        if !temperature.is_finite() || temperature <= 0.0 {
            return Err(Error::Input(format!(
                "temperature must be positive, got {temperature}"
            )));
        }
        Ok(Self::Softmax { temperature })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Softmax { .. } => "softmax",
            Self::Cosine => "cosine",
        }
    }

    pub fn score(&self, target: &Target, candidate: &FeatureVector) -> f32 {
        match *self {
            Self::Cosine => target.query().dot(candidate),
            Self::Softmax { temperature } => {
                let logits: Vec<f32> = target
                    .vectors()
                    .iter()
                    .map(|t| t.dot(candidate) / temperature)
                    .collect();
                softmax_first(&logits)
            }
        }
    }
}

/// Softmax probability of `logits[0]`, stabilized by the max logit.
fn softmax_first(logits: &[f32]) -> f32 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let denom: f32 = logits.iter().map(|l| (l - max).exp()).sum();
    (logits[0] - max).exp() / denom
}
