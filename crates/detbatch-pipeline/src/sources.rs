use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use detbatch_core::{DetError, Result};

/// Collect image files under `dir`, sorted by path.
///
/// `max_depth` limits how far below `dir` to look (`Some(1)` = direct
/// children only, `None` = unlimited). A file qualifies when its extension
/// matches one of `extensions`, compared case-insensitively. Unreadable
/// subdirectories are logged and skipped.
pub fn collect_images(
    dir: &Path,
    max_depth: Option<usize>,
    extensions: &[String],
) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Err(DetError::InvalidInput(format!(
            "input directory {} does not exist or is not a directory",
            dir.display()
        )));
    }

    let mut walker = WalkDir::new(dir).follow_links(true);
    if let Some(depth) = max_depth {
        walker = walker.max_depth(depth);
    }

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable path");
                continue;
            }
        };
        if entry.file_type().is_file() && has_extension(entry.path(), extensions) {
            files.push(entry.into_path());
        }
    }
    files.sort();

    tracing::info!(dir = %dir.display(), files = files.len(), "collected input images");
    Ok(files)
}

fn has_extension(path: &Path, extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| extensions.iter().any(|want| want.eq_ignore_ascii_case(ext)))
}
