use std::path::PathBuf;

use serde::Serialize;
use tracing::debug;

use crate::{
    error::{Error, Result},
    provider::EmbeddingProvider,
    vector::FeatureVector,
    vocabulary::Vocabulary,
};

/// What the user is searching for. At least one side must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Query {
    pub text: Option<String>,
    pub image: Option<PathBuf>,
}

impl Query {
    /// Empty text counts as no text.
    pub fn new(text: Option<String>, image: Option<PathBuf>) -> Result<Self> {
        let text = text.filter(|t| !t.is_empty());
        if text.is_none() && image.is_none() {
            return Err(Error::Input("text or image query required".into()));
        }
        Ok(Self { text, image })
    }
}

/// The composed query representation.
///
/// Vector 0 is the query itself; the rest are the embedded auxiliary
/// vocabulary that shapes the softmax denominator.
#[derive(Debug, Clone)]
pub struct Target {
    vectors: Vec<FeatureVector>,
}

impl Target {
    /// Embed `prefix + text` together with `prefix + label` for every
    /// vocabulary label, as one batch.
    pub fn from_text(
        provider: &dyn EmbeddingProvider,
        prefix: &str,
        text: &str,
        vocabulary: &Vocabulary,
    ) -> Result<Self> {
        let texts: Vec<String> = std::iter::once(text)
            .chain(vocabulary.labels().iter().map(String::as_str))
            .map(|t| format!("{prefix}{t}"))
            .collect();

        let vectors = provider.embed_text(&texts)?;
        if vectors.len() != texts.len() {
            return Err(Error::Provider(format!(
                "expected {} text embeddings, got {}",
                texts.len(),
                vectors.len()
            )));
        }
        debug!(count = vectors.len(), "embedded target texts");
        Ok(Self { vectors })
    }

    /// Build the target for `query`. An image, when present, replaces the
    /// text query vector; the auxiliary vectors still come from the text
    /// side.
    pub fn build(
        provider: &dyn EmbeddingProvider,
        query: &Query,
        prefix: &str,
        vocabulary: &Vocabulary,
    ) -> Result<Self> {
        let text = query.text.as_deref().unwrap_or("");
        let target = Self::from_text(provider, prefix, text, vocabulary)?;

        match &query.image {
            Some(path) => {
                let bytes = std::fs::read(path).map_err(|e| {
                    Error::Input(format!(
                        "cannot read query image {}: {e}",
                        path.display()
                    ))
                })?;
                Ok(target.with_image(provider.embed_image(&bytes)?))
            }
            None => Ok(target),
        }
    }

    /// Assemble a target from already embedded vectors, query first.
    pub fn from_vectors(vectors: Vec<FeatureVector>) -> Result<Self> {
        if vectors.is_empty() {
            return Err(Error::Input("target needs a query vector".into()));
        }
        Ok(Self { vectors })
    }

    /// Replace the query vector with an image embedding.
    pub fn with_image(mut self, vector: FeatureVector) -> Self {
        self.vectors[0] = vector;
        self
    }

    pub fn query(&self) -> &FeatureVector {
        &self.vectors[0]
    }

    pub fn auxiliary(&self) -> &[FeatureVector] {
        &self.vectors[1..]
    }

    pub fn vectors(&self) -> &[FeatureVector] {
        &self.vectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DeterministicProvider;

    fn vocab() -> Vocabulary {
        Vocabulary::new(vec!["cat".into(), "dog".into()])
    }

    #[test]
    fn query_requires_text_or_image() {
        assert!(matches!(Query::new(None, None), Err(Error::Input(_))));
        assert!(matches!(
            Query::new(Some(String::new()), None),
            Err(Error::Input(_))
        ));
        assert!(Query::new(Some("cat".into()), None).is_ok());
        assert!(Query::new(None, Some("q.jpg".into())).is_ok());
    }

    #[test]
    fn text_target_prefixes_query_and_vocabulary() {
        let provider = DeterministicProvider::new("v1", 16);
        let target =
            Target::from_text(&provider, "a picture of ", "boat", &vocab())
                .unwrap();

        assert_eq!(target.vectors().len(), 3);
        assert_eq!(
            target.query(),
            &provider.vector_for(b"a picture of boat").unwrap()
        );
        assert_eq!(
            target.auxiliary()[1],
            provider.vector_for(b"a picture of dog").unwrap()
        );
    }

    #[test]
    fn image_replaces_query_vector_only() {
        let tmp = tempfile::tempdir().unwrap();
        let image = tmp.path().join("query.png");
        std::fs::write(&image, b"pixels").unwrap();

        let provider = DeterministicProvider::new("v1", 16);
        let query = Query::new(Some("boat".into()), Some(image)).unwrap();
        let target = Target::build(&provider, &query, "", &vocab()).unwrap();

        assert_eq!(target.query(), &provider.vector_for(b"pixels").unwrap());
        assert_eq!(
            target.auxiliary()[0],
            provider.vector_for(b"cat").unwrap()
        );
    }

    #[test]
    fn from_vectors_requires_query() {
        assert!(Target::from_vectors(vec![]).is_err());
        let v = provider_vector("x");
        let target = Target::from_vectors(vec![v.clone()]).unwrap();
        assert_eq!(target.query(), &v);
        assert!(target.auxiliary().is_empty());
    }

    fn provider_vector(payload: &str) -> FeatureVector {
        DeterministicProvider::new("v1", 8)
            .vector_for(payload.as_bytes())
            .unwrap()
    }

    #[test]
    fn missing_query_image_is_input_error() {
        let provider = DeterministicProvider::new("v1", 16);
        let query = Query::new(None, Some("/nonexistent/q.png".into())).unwrap();
        let err = Target::build(&provider, &query, "", &vocab()).unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }
}
