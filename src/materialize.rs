use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{error::Result, ranker::RankedResult};

/// Copy ranked files from `source_dir` into `output_dir`.
///
/// With `clear`, the output directory is removed first so it only holds
/// this run's results.
pub fn materialize(
    results: &[RankedResult],
    source_dir: &Path,
    output_dir: &Path,
    clear: bool,
) -> Result<Vec<PathBuf>> {
    if clear {
        match std::fs::remove_dir_all(output_dir) {
            Ok(()) => debug!(dir = %output_dir.display(), "cleared old results"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    std::fs::create_dir_all(output_dir)?;

    let mut copied = Vec::with_capacity(results.len());
    for result in results {
        let dest = output_dir.join(&result.identifier);
        std::fs::copy(source_dir.join(&result.identifier), &dest)?;
        copied.push(dest);
    }
    Ok(copied)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(name: &str) -> RankedResult {
        RankedResult {
            identifier: name.to_string(),
            score: 0.5,
        }
    }

    #[test]
    fn copies_results() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("images");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("a.jpg"), "aaa").unwrap();
        std::fs::write(source.join("b.jpg"), "bbb").unwrap();

        let out = tmp.path().join("results");
        let copied =
            materialize(&[result("b.jpg")], &source, &out, false).unwrap();

        assert_eq!(copied, vec![out.join("b.jpg")]);
        assert_eq!(std::fs::read_to_string(out.join("b.jpg")).unwrap(), "bbb");
        assert!(!out.join("a.jpg").exists());
    }

    #[test]
    fn keeps_old_results_unless_cleared() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("images");
        std::fs::create_dir(&source).unwrap();
        std::fs::write(source.join("new.jpg"), "new").unwrap();

        let out = tmp.path().join("results");
        std::fs::create_dir(&out).unwrap();
        std::fs::write(out.join("old.jpg"), "old").unwrap();

        materialize(&[result("new.jpg")], &source, &out, false).unwrap();
        assert!(out.join("old.jpg").exists());

        materialize(&[result("new.jpg")], &source, &out, true).unwrap();
        assert!(!out.join("old.jpg").exists());
        assert!(out.join("new.jpg").exists());
    }

    #[test]
    fn clear_tolerates_missing_output_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("never-created");
        let copied = materialize(&[], tmp.path(), &out, true).unwrap();
        assert!(copied.is_empty());
        assert!(out.is_dir());
    }
}
