use std::{
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use crate::{io_error, DownloadError};

const STAGING_PREFIX: &str = ".staging-";
const STALE_STAGING_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Private build area next to an upgrade directory.
///
/// Content is assembled under `content/` and renamed onto the final directory only once it
/// is complete; anything left behind is removed on drop.
pub(crate) struct Staging {
    root: tempfile::TempDir,
    content: PathBuf,
}

impl Staging {
    pub(crate) fn new_for(dest: &Path) -> Result<Self, DownloadError> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .map_err(|err| io_error(format!("failed to create {}", parent.display()), err))?;
        prune_stale_staging(parent, STALE_STAGING_AGE);
        let label = dest
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let root = tempfile::Builder::new()
            .prefix(&format!("{STAGING_PREFIX}{label}-"))
            .tempdir_in(parent)
            .map_err(|err| {
                io_error(
                    format!("failed to create staging dir under {}", parent.display()),
                    err,
                )
            })?;
        let content = root.path().join("content");
        fs::create_dir_all(&content)
            .map_err(|err| io_error(format!("failed to create {}", content.display()), err))?;
        Ok(Self { root, content })
    }

    pub(crate) fn content(&self) -> &Path {
        &self.content
    }

    /// Scratch location for in-flight downloads; never part of the published tree.
    pub(crate) fn scratch(&self) -> &Path {
        self.root.path()
    }

    /// Move the assembled content onto `dest`, replacing whatever was there.
    pub(crate) fn publish(self, dest: &Path) -> Result<(), DownloadError> {
        match fs::symlink_metadata(dest) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(dest)
                .map_err(|err| io_error(format!("failed to remove {}", dest.display()), err))?,
            Ok(_) => fs::remove_file(dest)
                .map_err(|err| io_error(format!("failed to remove {}", dest.display()), err))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(io_error(format!("failed to stat {}", dest.display()), err)),
        }
        fs::rename(&self.content, dest).map_err(|err| {
            io_error(
                format!(
                    "failed to move {} into {}",
                    self.content.display(),
                    dest.display()
                ),
                err,
            )
        })
    }
}

fn prune_stale_staging(root: &Path, max_age: Duration) {
    let Ok(entries) = fs::read_dir(root) else {
        return;
    };
    let now = SystemTime::now();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if !name.starts_with(STAGING_PREFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let Some(modified) = meta.modified().ok() else {
            continue;
        };
        if now.duration_since(modified).unwrap_or_default() < max_age {
            continue;
        }
        tracing::debug!(path = %entry.path().display(), "removing stale staging dir");
        let _ = fs::remove_dir_all(entry.path());
    }
}
