use std::{
    fs, io,
    path::{Path, PathBuf},
    process,
};

/// Point `link` at `target` (relative to `link`'s directory) without a window where
/// `link` is missing.
///
/// The new link is created under a scratch name beside `link` and renamed over it; on
/// Unix `rename(2)` replaces the old link atomically, so readers resolve either the old
/// or the new target.
pub(crate) fn swap_dir_link(target: &Path, link: &Path) -> io::Result<()> {
    let parent = link.parent().unwrap_or_else(|| Path::new("."));
    if !parent.join(target).is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!(
                "cannot point {} at missing directory {}",
                link.display(),
                parent.join(target).display()
            ),
        ));
    }
    let scratch = create_scratch_link(target, link)?;
    if let Err(err) = fs::rename(&scratch, link) {
        let _ = fs::remove_file(&scratch);
        return Err(err);
    }
    Ok(())
}

fn create_scratch_link(target: &Path, link: &Path) -> io::Result<PathBuf> {
    let parent = link.parent().unwrap_or_else(|| Path::new("."));
    let stem = link
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "link".to_string());
    let pid = process::id();
    for attempt in 0..64u32 {
        let candidate = parent.join(format!(".{stem}.{pid}.{attempt}.tmp"));
        match symlink_dir(target, &candidate) {
            Ok(()) => return Ok(candidate),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                // Left over from a crashed process with a recycled pid.
                let _ = fs::remove_file(&candidate);
            }
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("could not reserve a scratch link next to {}", link.display()),
    ))
}

#[cfg(unix)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, link)
}

#[cfg(windows)]
fn symlink_dir(target: &Path, link: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_dir(target, link)
}

/// Copy `source` to `dest` through a scratch file in `dest`'s directory and mark it executable.
pub(crate) fn install_executable(source: &Path, dest: &Path) -> io::Result<()> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;
    let scratch = tempfile::Builder::new()
        .prefix(".install-")
        .tempfile_in(parent)?;
    fs::copy(source, scratch.path())?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(scratch.path(), fs::Permissions::from_mode(0o755))?;
    }
    scratch.persist(dest).map_err(|err| err.error)?;
    Ok(())
}

/// Executable regular file check used to decide whether a version directory is usable.
pub(crate) fn is_executable_file(path: &Path) -> bool {
    let Ok(meta) = fs::metadata(path) else {
        return false;
    };
    if !meta.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        meta.permissions().mode() & 0o111 != 0
    }
    #[cfg(not(unix))]
    {
        true
    }
}
