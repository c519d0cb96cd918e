use std::path::{Path, PathBuf};

use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{PlayerError, Result};

/// Lists the files directly under `root` whose extension matches
/// `extension`, ignoring case.
///
/// Order is whatever the filesystem enumerates; the list is deliberately not
/// sorted so playback follows directory order.
pub fn scan_directory(root: impl AsRef<Path>, extension: &str) -> Result<Vec<PathBuf>> {
    let root = root.as_ref();
    if !root.is_dir() {
        return Err(PlayerError::msg(format!(
            "{} is not a directory",
            root.display()
        )));
    }

    let wanted = extension.trim_start_matches('.').to_lowercase();
    let mut tracks = Vec::new();

    for entry in WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "skipping unreadable directory entry");
                continue;
            }
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if has_extension(entry.path(), &wanted) {
            debug!(path = %entry.path().display(), "queued track");
            tracks.push(entry.into_path());
        }
    }

    Ok(tracks)
}

fn has_extension(path: &Path, wanted: &str) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase() == wanted)
        .unwrap_or(false)
}
