//! The encoder seam.
//!
//! Everything that turns pixels or text into vectors lives behind
//! [`EmbeddingProvider`]. The scan and ranking code never touch a model
//! directly, so a test double can stand in for the real CLIP encoder.

use std::{
    sync::{
        Arc,
        mpsc::{self, RecvTimeoutError},
    },
    time::Duration,
};

use crate::{
    error::{Error, Result},
    vector::FeatureVector,
};

/// Trait for image/text encoders that share one embedding space.
pub trait EmbeddingProvider: Send + Sync {
    /// Tag identifying the encoder and its configuration. Vectors with
    /// different tags are not comparable.
    fn space_version(&self) -> &str;

    /// Embed a batch of strings, returning one vector per input in order.
    fn embed_text(&self, texts: &[String]) -> Result<Vec<FeatureVector>>;

    /// Embed an encoded image (JPEG, PNG, ...).
    fn embed_image(&self, image: &[u8]) -> Result<FeatureVector>;
}

/// Bounds every call to an inner provider with a timeout.
///
/// The call runs on a helper thread. On expiry the caller gets
/// [`Error::Provider`] right away and the helper thread is left to finish
/// on its own.
pub struct TimeoutProvider {
    inner: Arc<dyn EmbeddingProvider>,
    timeout: Duration,
}

impl TimeoutProvider {
    pub fn new(inner: Arc<dyn EmbeddingProvider>, timeout: Duration) -> Self {
        Self { inner, timeout }
    }

    fn run<T, F>(&self, call: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&dyn EmbeddingProvider) -> Result<T> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel();
        std::thread::Builder::new()
            .name("clipseek-embed".to_string())
            .spawn(move || {
                // The receiver is gone if we already timed out.
                let _ = tx.send(call(inner.as_ref()));
            })?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Provider(format!(
                "embedding timed out after {:.1}s",
                self.timeout.as_secs_f32()
            ))),
            Err(RecvTimeoutError::Disconnected) => Err(Error::Provider(
                "embedding worker exited without a result".to_string(),
            )),
        }
    }
}

impl EmbeddingProvider for TimeoutProvider {
    fn space_version(&self) -> &str {
        self.inner.space_version()
    }

    fn embed_text(&self, texts: &[String]) -> Result<Vec<FeatureVector>> {
        let texts = texts.to_vec();
        self.run(move |p| p.embed_text(&texts))
    }

    fn embed_image(&self, image: &[u8]) -> Result<FeatureVector> {
        let image = image.to_vec();
        self.run(move |p| p.embed_image(&image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::DeterministicProvider;

    struct SlowProvider {
        delay: Duration,
    }

    impl EmbeddingProvider for SlowProvider {
        fn space_version(&self) -> &str {
            "slow"
        }

        fn embed_text(&self, texts: &[String]) -> Result<Vec<FeatureVector>> {
            std::thread::sleep(self.delay);
            texts
                .iter()
                .map(|_| FeatureVector::normalize(vec![1.0, 0.0]))
                .collect()
        }

        fn embed_image(&self, _image: &[u8]) -> Result<FeatureVector> {
            std::thread::sleep(self.delay);
            FeatureVector::normalize(vec![0.0, 1.0])
        }
    }

    #[test]
    fn timeout_provider_passes_results_through() {
        let inner: Arc<dyn EmbeddingProvider> =
            Arc::new(DeterministicProvider::new("v1", 8));
        let provider = TimeoutProvider::new(inner, Duration::from_secs(5));

        assert_eq!(provider.space_version(), "v1");
        let texts = provider
            .embed_text(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(texts.len(), 2);
        assert!(provider.embed_image(b"x").is_ok());
    }

    #[test]
    fn timeout_provider_expires() {
        let inner: Arc<dyn EmbeddingProvider> = Arc::new(SlowProvider {
            delay: Duration::from_millis(500),
        });
        let provider = TimeoutProvider::new(inner, Duration::from_millis(20));

        let err = provider.embed_image(b"x").unwrap_err();
        assert!(err.to_string().contains("timed out"), "got {err}");
    }
}
