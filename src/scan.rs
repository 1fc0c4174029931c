use std::{
    path::Path,
    sync::atomic::{AtomicBool, Ordering},
};

use kdam::{BarExt, tqdm};
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    error::{Error, Result},
    provider::EmbeddingProvider,
    vector::FeatureVector,
    vector_store::VectorStore,
    walker::{self, ImageFile},
};

/// Default number of new embeddings between periodic flushes.
pub const DEFAULT_SAVE_EVERY: usize = 1000;

/// A file that made it into the candidate set.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub identifier: String,
    pub vector: FeatureVector,
}

#[derive(Debug, Clone, Copy)]
pub struct ScanOptions {
    /// Flush after this many new embeddings.
    pub save_every: usize,
    /// Concurrent provider calls. 1 keeps the scan fully sequential.
    pub jobs: usize,
    /// Draw a progress bar on stderr.
    pub progress: bool,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            save_every: DEFAULT_SAVE_EVERY,
            jobs: 1,
            progress: false,
        }
    }
}

/// Counters for one scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ScanReport {
    /// Qualifying image files found in the folder.
    pub files: usize,
    pub hits: usize,
    pub misses: usize,
    /// Files excluded because embedding them failed.
    pub skipped: usize,
    pub flushes: usize,
    pub flush_failures: usize,
    pub interrupted: bool,
}

#[derive(Debug, Default)]
pub struct ScanOutcome {
    /// In scan order.
    pub candidates: Vec<Candidate>,
    pub report: ScanReport,
}

/// Walks a folder, reusing cached vectors and embedding the rest.
///
/// The coordinator is the only writer to the [`VectorStore`]: with
/// `jobs > 1` provider calls run on a bounded pool, but upserts and flush
/// decisions are applied afterwards on the calling thread, in scan order.
pub struct ScanCoordinator<'a> {
    provider: &'a dyn EmbeddingProvider,
    options: ScanOptions,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> ScanCoordinator<'a> {
    pub fn new(provider: &'a dyn EmbeddingProvider, options: ScanOptions) -> Self {
        Self {
            provider,
            options,
            cancel: None,
        }
    }

    /// Stop before the next file once `flag` is set. Whatever was embedded
    /// so far is still flushed.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    pub fn provider(&self) -> &'a dyn EmbeddingProvider {
        self.provider
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    pub fn scan(
        &self,
        folder: &Path,
        store: &mut VectorStore,
    ) -> Result<ScanOutcome> {
        let files = walker::discover_images(folder)?;
        let version = self.provider.space_version().to_string();
        let jobs = self.options.jobs.max(1);

        let pool = if jobs > 1 {
            Some(
                rayon::ThreadPoolBuilder::new()
                    .num_threads(jobs)
                    .thread_name(|i| format!("clipseek-scan-{i}"))
                    .build()
                    .map_err(|e| {
                        Error::Config(format!("cannot start worker pool: {e}"))
                    })?,
            )
        } else {
            None
        };

        let mut pb = tqdm!(
            total = files.len(),
            desc = "Scanning",
            unit = " img",
            disable = !self.options.progress
        );

        let mut outcome = ScanOutcome::default();
        outcome.report.files = files.len();
        info!(
            folder = %folder.display(),
            files = files.len(),
            cached = store.len(),
            "scanning folder"
        );

        for window in files.chunks(jobs) {
            if self.cancelled() {
                warn!("scan interrupted, stopping early");
                outcome.report.interrupted = true;
                break;
            }

            let cached: Vec<Option<FeatureVector>> = window
                .iter()
                .map(|f| {
                    store
                        .get_current(&f.name, &version)
                        .map(|entry| entry.vector.clone())
                })
                .collect();

            let pending: Vec<&ImageFile> = window
                .iter()
                .zip(&cached)
                .filter(|(_, hit)| hit.is_none())
                .map(|(f, _)| f)
                .collect();

            let embedded: Vec<Result<FeatureVector>> = match &pool {
                Some(pool) => pool.install(|| {
                    pending.par_iter().map(|f| self.embed_file(f)).collect()
                }),
                None => pending.iter().map(|f| self.embed_file(f)).collect(),
            };
            let mut embedded = embedded.into_iter();

            for (file, hit) in window.iter().zip(cached) {
                let vector = match hit {
                    Some(vector) => {
                        debug!(file = %file.name, "cache hit");
                        outcome.report.hits += 1;
                        vector
                    }
                    None => match embedded.next() {
                        Some(Ok(vector)) => {
                            debug!(file = %file.name, "embedded");
                            store.upsert(&file.name, vector.clone(), &version);
                            outcome.report.misses += 1;
                            self.periodic_flush(store, &mut outcome.report);
                            vector
                        }
                        Some(Err(e)) => {
                            warn!(file = %file.name, error = %e, "skipping file");
                            outcome.report.skipped += 1;
                            let _ = pb.update(1);
                            continue;
                        }
                        None => continue,
                    },
                };

                outcome.candidates.push(Candidate {
                    identifier: file.name.clone(),
                    vector,
                });
                let _ = pb.update(1);
            }
        }

        if outcome.report.misses > 0 {
            match store.flush() {
                Ok(()) => outcome.report.flushes += 1,
                Err(e) => {
                    warn!(error = %e, "final flush failed");
                    outcome.report.flush_failures += 1;
                }
            }
        }

        info!(
            hits = outcome.report.hits,
            misses = outcome.report.misses,
            skipped = outcome.report.skipped,
            "scan finished"
        );
        Ok(outcome)
    }

    fn embed_file(&self, file: &ImageFile) -> Result<FeatureVector> {
        let bytes = std::fs::read(&file.path)?;
        self.provider.embed_image(&bytes)
    }

    fn periodic_flush(&self, store: &mut VectorStore, report: &mut ScanReport) {
        match store.maybe_flush(self.options.save_every) {
            Ok(true) => report.flushes += 1,
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "periodic flush failed, will retry");
                report.flush_failures += 1;
            }
        }
    }
}
