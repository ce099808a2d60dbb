use std::{
    fs::{self, File},
    io::{self, Read},
    path::Path,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use flate2::read::GzDecoder;
use zip::ZipArchive;

/// Container formats that are expanded instead of installed as the executable itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "kebab-case")]
pub enum ArchiveKind {
    Zip,
    TarGz,
    Tar,
}

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_MAGIC: &[u8] = b"PK\x05\x06";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];
const TAR_MAGIC_OFFSET: usize = 257;
const TAR_MAGIC: &[u8] = b"ustar";

/// Sniff the first bytes of a download; `None` means "treat it as a raw executable".
pub fn classify(path: &Path) -> io::Result<Option<ArchiveKind>> {
    let mut header = Vec::with_capacity(512);
    File::open(path)?.take(512).read_to_end(&mut header)?;
    Ok(classify_bytes(&header))
}

fn classify_bytes(header: &[u8]) -> Option<ArchiveKind> {
    if header.starts_with(ZIP_MAGIC) || header.starts_with(ZIP_EMPTY_MAGIC) {
        return Some(ArchiveKind::Zip);
    }
    if header.starts_with(GZIP_MAGIC) {
        return Some(ArchiveKind::TarGz);
    }
    let tar_magic_end = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
    if header.len() >= tar_magic_end && &header[TAR_MAGIC_OFFSET..tar_magic_end] == TAR_MAGIC {
        return Some(ArchiveKind::Tar);
    }
    None
}

/// Expand `archive` into `dest`. Entries that would escape `dest` are skipped.
pub fn expand(kind: ArchiveKind, archive: &Path, dest: &Path) -> Result<(), String> {
    match kind {
        ArchiveKind::Zip => expand_zip(archive, dest),
        ArchiveKind::TarGz => {
            let file = File::open(archive).map_err(|err| err.to_string())?;
            tar::Archive::new(GzDecoder::new(file))
                .unpack(dest)
                .map_err(|err| err.to_string())
        }
        ArchiveKind::Tar => {
            let file = File::open(archive).map_err(|err| err.to_string())?;
            tar::Archive::new(file)
                .unpack(dest)
                .map_err(|err| err.to_string())
        }
    }
}

fn expand_zip(archive: &Path, dest: &Path) -> Result<(), String> {
    let file = File::open(archive).map_err(|err| err.to_string())?;
    let mut archive = ZipArchive::new(file).map_err(|err| err.to_string())?;
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|err| err.to_string())?;
        let Some(enclosed) = entry.enclosed_name().map(|p| dest.join(p)) else {
            tracing::warn!(entry = entry.name(), "skipping archive entry outside destination");
            continue;
        };
        if entry.name().ends_with('/') || entry.is_dir() {
            fs::create_dir_all(&enclosed).map_err(|err| err.to_string())?;
            continue;
        }
        if let Some(parent) = enclosed.parent() {
            fs::create_dir_all(parent).map_err(|err| err.to_string())?;
        }
        let mut outfile = File::create(&enclosed).map_err(|err| err.to_string())?;
        io::copy(&mut entry, &mut outfile).map_err(|err| err.to_string())?;
        #[cfg(unix)]
        {
            if let Some(mode) = entry.unix_mode() {
                fs::set_permissions(&enclosed, fs::Permissions::from_mode(mode))
                    .map_err(|err| err.to_string())?;
            }
        }
    }
    Ok(())
}
