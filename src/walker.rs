use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use tracing::warn;

use crate::error::{Error, Result};

/// Recognized image extensions, matched case-insensitively.
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "jfif"];

/// A discovered image file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFile {
    /// File name, the cache key.
    pub name: String,
    pub path: PathBuf,
}

fn image_matcher() -> Result<GlobMatcher> {
    let pattern = format!("*.{{{}}}", IMAGE_EXTENSIONS.join(","));
    let glob = GlobBuilder::new(&pattern)
        .case_insensitive(true)
        .literal_separator(true)
        .build()
        .map_err(|e| Error::Config(format!("invalid image pattern: {e}")))?;
    Ok(glob.compile_matcher())
}

/// List the image files directly inside `folder`, sorted by name.
///
/// Subdirectories are not descended into. Names that are not valid UTF-8
/// are skipped with a warning, since they cannot serve as cache keys.
pub fn discover_images(folder: &Path) -> Result<Vec<ImageFile>> {
    let matcher = image_matcher()?;
    let mut results = Vec::new();

    for entry in std::fs::read_dir(folder)? {
        let entry = entry?;
        let path = entry.path();

        // Follows symlinks, so a link to an image counts as an image.
        if !path.is_file() {
            continue;
        }

        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            warn!(path = %path.display(), "skipping file with non UTF-8 name");
            continue;
        };

        if matcher.is_match(&name) {
            results.push(ImageFile { name, path });
        }
    }

    results.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(results)
}
