#![deny(clippy::all, warnings)]

//! Download, verify and install upgrade artifacts.
//!
//! Every download must carry a `checksum=<algorithm>:<hex>` query parameter. Content is
//! hashed while it streams to a scratch file and nothing is installed unless the hash
//! matches. Archives are expanded, raw files become the executable, and an artifact that
//! only contains another `upgrade-info.json` (a referral) is followed to the next download.
//! The result is assembled in a staging directory and renamed into place on success.

use std::{
    fs::{self, File},
    io::{self, Read, Write},
    path::{Path, PathBuf},
    time::Duration,
};

#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;

use reqwest::blocking::Client;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};
use upvisor_domain::{
    ChecksumError, DownloadChecksum, InfoError, PlatformKey, UpgradeInfo, UPGRADE_INFO_FILENAME,
};
use url::Url;

pub mod archive;
mod staging;

pub use archive::ArchiveKind;

use staging::Staging;

const USER_AGENT: &str = concat!("upvisor-store/", env!("CARGO_PKG_VERSION"));

/// Upper bound on referrals followed for a single upgrade.
pub const MAX_REFERRAL_HOPS: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("download URL '{url}' has no checksum; unverified downloads are refused")]
    MissingChecksum { url: String },
    #[error("download URL '{url}' has an invalid checksum: {source}")]
    InvalidChecksum {
        url: String,
        #[source]
        source: ChecksumError,
    },
    #[error("checksum mismatch for '{url}' (expected {expected}, got {actual})")]
    ChecksumMismatch {
        url: String,
        expected: String,
        actual: String,
    },
    #[error("no download for platform {platform} (available: {available})")]
    UnsupportedPlatform { platform: String, available: String },
    #[error("referral chain exceeded {limit} hops at '{url}'")]
    ReferralLoop { limit: usize, url: String },
    #[error("referral '{}' is invalid: {source}", path.display())]
    InvalidReferral {
        path: PathBuf,
        #[source]
        source: InfoError,
    },
    #[error("invalid download location: {0}")]
    InvalidUrl(#[source] InfoError),
    #[error("failed to fetch '{url}': {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("failed to expand {kind} archive from '{url}': {reason}")]
    Archive {
        kind: ArchiveKind,
        url: String,
        reason: String,
    },
    #[error("artifact from '{url}' does not provide bin/{binary}")]
    MissingBinary { url: String, binary: String },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

pub(crate) fn io_error(context: impl Into<String>, source: io::Error) -> DownloadError {
    DownloadError::Io {
        context: context.into(),
        source,
    }
}

/// Outcome of a successful [`Downloader::materialize`].
#[derive(Debug, Clone)]
pub struct InstalledArtifact {
    pub binary: PathBuf,
    pub referrals: usize,
    pub bytes_fetched: u64,
}

/// Fetches upgrade artifacts for one daemon binary name.
pub struct Downloader {
    client: Client,
    binary_name: String,
}

impl Downloader {
    pub fn new(binary_name: impl Into<String>, timeout: Duration) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|source| DownloadError::Fetch {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            client,
            binary_name: binary_name.into(),
        })
    }

    /// Download `url` into `dest`, following referrals resolved for `platform`.
    ///
    /// `dest` is only touched once the whole chain has been fetched, verified and expanded
    /// and `dest/bin/<binary>` exists; on any error it is left as it was.
    pub fn materialize(
        &self,
        url: &Url,
        dest: &Path,
        platform: &PlatformKey,
    ) -> Result<InstalledArtifact, DownloadError> {
        let staging = Staging::new_for(dest)?;
        let mut current = url.clone();
        let mut referrals = 0;
        let mut bytes_fetched = 0;
        loop {
            bytes_fetched += self.install_once(&current, &staging)?;
            let Some((referral_path, referral)) = take_referral(staging.content())? else {
                break;
            };
            referrals += 1;
            if referrals > MAX_REFERRAL_HOPS {
                return Err(DownloadError::ReferralLoop {
                    limit: MAX_REFERRAL_HOPS,
                    url: current.to_string(),
                });
            }
            let next = referral
                .payload()
                .and_then(|payload| payload.resolve_url(platform))
                .map_err(|err| match err {
                    InfoError::UnsupportedPlatform {
                        platform,
                        available,
                    } => DownloadError::UnsupportedPlatform {
                        platform,
                        available,
                    },
                    source => DownloadError::InvalidReferral {
                        path: referral_path.clone(),
                        source,
                    },
                })?;
            info!(
                from = %current,
                to = %next,
                referral = %referral.name,
                hop = referrals,
                "following upgrade referral"
            );
            current = next;
        }

        let staged_binary = staging.content().join("bin").join(&self.binary_name);
        if !staged_binary.is_file() {
            return Err(DownloadError::MissingBinary {
                url: current.to_string(),
                binary: self.binary_name.clone(),
            });
        }
        make_executable(&staged_binary)?;
        staging.publish(dest)?;
        info!(dest = %dest.display(), referrals, bytes_fetched, "upgrade artifact installed");
        Ok(InstalledArtifact {
            binary: dest.join("bin").join(&self.binary_name),
            referrals,
            bytes_fetched,
        })
    }

    /// Fetch and verify one URL, then lay its content out in the staging area.
    fn install_once(&self, url: &Url, staging: &Staging) -> Result<u64, DownloadError> {
        let checksum = DownloadChecksum::from_url(url).map_err(|err| match err {
            ChecksumError::Missing => DownloadError::MissingChecksum {
                url: url.to_string(),
            },
            source => DownloadError::InvalidChecksum {
                url: url.to_string(),
                source,
            },
        })?;
        info!(url = %url, checksum = %checksum, "downloading upgrade artifact");
        let (download, bytes) = self.fetch_verified(url, &checksum, staging.scratch())?;

        let kind = archive::classify(download.path()).map_err(|err| {
            io_error(format!("failed to read {}", download.path().display()), err)
        })?;
        match kind {
            Some(kind) => {
                debug!(%kind, url = %url, "expanding archive");
                archive::expand(kind, download.path(), staging.content()).map_err(|reason| {
                    DownloadError::Archive {
                        kind,
                        url: url.to_string(),
                        reason,
                    }
                })?;
                self.normalize_flat_layout(staging.content())?;
            }
            None => {
                debug!(url = %url, "installing download as raw executable");
                let bin_dir = staging.content().join("bin");
                fs::create_dir_all(&bin_dir).map_err(|err| {
                    io_error(format!("failed to create {}", bin_dir.display()), err)
                })?;
                let target = bin_dir.join(&self.binary_name);
                download.persist(&target).map_err(|err| {
                    io_error(format!("failed to persist {}", target.display()), err.error)
                })?;
            }
        }
        Ok(bytes)
    }

    fn fetch_verified(
        &self,
        url: &Url,
        checksum: &DownloadChecksum,
        scratch: &Path,
    ) -> Result<(NamedTempFile, u64), DownloadError> {
        let mut reader = self.open(url)?;
        let mut tmp = NamedTempFile::new_in(scratch)
            .map_err(|err| io_error("failed to create download file", err))?;
        let mut hasher = checksum.hasher();
        let mut written: u64 = 0;
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let read = reader
                .read(&mut buffer)
                .map_err(|err| io_error(format!("stream error for {url}"), err))?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            tmp.write_all(&buffer[..read])
                .map_err(|err| io_error("failed to write download file", err))?;
            written += read as u64;
        }
        tmp.flush()
            .map_err(|err| io_error("failed to flush download file", err))?;

        let actual = hasher.finalize_hex();
        if !checksum.matches(&actual) {
            warn!(url = %url, expected = checksum.digest(), %actual, "checksum mismatch");
            return Err(DownloadError::ChecksumMismatch {
                url: url.to_string(),
                expected: checksum.to_string(),
                actual: format!("{}:{actual}", checksum.algorithm()),
            });
        }
        debug!(url = %url, bytes = written, "checksum verified");
        Ok((tmp, written))
    }

    fn open(&self, url: &Url) -> Result<Box<dyn Read>, DownloadError> {
        if url.scheme() == "file" {
            let path = url
                .to_file_path()
                .map_err(|()| DownloadError::InvalidUrl(InfoError::UnrecognizedPayload {
                    payload: url.to_string(),
                }))?;
            let file = File::open(&path)
                .map_err(|err| io_error(format!("failed to open {}", path.display()), err))?;
            return Ok(Box::new(file));
        }
        let response = self
            .client
            .get(url.clone())
            .send()
            .and_then(reqwest::blocking::Response::error_for_status)
            .map_err(|source| DownloadError::Fetch {
                url: url.to_string(),
                source,
            })?;
        Ok(Box::new(response))
    }

    /// Archives that carry the executable at their root are moved under `bin/`.
    fn normalize_flat_layout(&self, content: &Path) -> Result<(), DownloadError> {
        let nested = content.join("bin").join(&self.binary_name);
        let flat = content.join(&self.binary_name);
        if nested.exists() || !flat.is_file() {
            return Ok(());
        }
        let bin_dir = content.join("bin");
        fs::create_dir_all(&bin_dir)
            .map_err(|err| io_error(format!("failed to create {}", bin_dir.display()), err))?;
        fs::rename(&flat, &nested)
            .map_err(|err| io_error(format!("failed to move {}", flat.display()), err))
    }
}

/// Remove and parse a referral left in `content` by the last expanded artifact.
fn take_referral(content: &Path) -> Result<Option<(PathBuf, UpgradeInfo)>, DownloadError> {
    for candidate in [
        content.join(UPGRADE_INFO_FILENAME),
        content.join("bin").join(UPGRADE_INFO_FILENAME),
    ] {
        if !candidate.is_file() {
            continue;
        }
        let bytes = fs::read(&candidate)
            .map_err(|err| io_error(format!("failed to read {}", candidate.display()), err))?;
        fs::remove_file(&candidate)
            .map_err(|err| io_error(format!("failed to remove {}", candidate.display()), err))?;
        let info = UpgradeInfo::parse(&bytes).map_err(|source| DownloadError::InvalidReferral {
            path: candidate.clone(),
            source,
        })?;
        return Ok(Some((candidate, info)));
    }
    Ok(None)
}

fn make_executable(path: &Path) -> Result<(), DownloadError> {
    #[cfg(unix)]
    {
        let meta = fs::metadata(path)
            .map_err(|err| io_error(format!("failed to stat {}", path.display()), err))?;
        let mut perms = meta.permissions();
        perms.set_mode(perms.mode() | 0o755);
        fs::set_permissions(path, perms)
            .map_err(|err| io_error(format!("failed to chmod {}", path.display()), err))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_is_consumed_from_bin_dir() {
        let temp = tempfile::tempdir().expect("tempdir");
        let bin = temp.path().join("bin");
        fs::create_dir_all(&bin).expect("bin");
        fs::write(
            bin.join(UPGRADE_INFO_FILENAME),
            br#"{"name":"chain3","info":"https://example.invalid/next.zip"}"#,
        )
        .expect("write referral");

        let (path, info) = take_referral(temp.path())
            .expect("read referral")
            .expect("referral present");
        assert_eq!(info.name, "chain3");
        assert_eq!(path, bin.join(UPGRADE_INFO_FILENAME));
        assert!(!path.exists(), "referral must be consumed");
        assert!(take_referral(temp.path()).expect("second read").is_none());
    }

    #[test]
    fn malformed_referral_is_reported() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join(UPGRADE_INFO_FILENAME), b"{not json").expect("write");
        assert!(matches!(
            take_referral(temp.path()),
            Err(DownloadError::InvalidReferral { .. })
        ));
    }

    #[test]
    fn flat_archive_layout_moves_binary_into_bin() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("autod"), b"#!/bin/sh\n").expect("write");
        let downloader = Downloader::new("autod", Duration::from_secs(5)).expect("downloader");
        downloader
            .normalize_flat_layout(temp.path())
            .expect("normalize");
        assert!(temp.path().join("bin").join("autod").is_file());
        assert!(!temp.path().join("autod").exists());
    }
}
