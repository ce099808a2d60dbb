#![deny(clippy::all, warnings)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate
)]

//! Data shared by the upgrade supervisor: announcements, payloads, platforms and checksums.

pub mod checksum;
pub mod info;
pub mod platform;

pub use checksum::{ChecksumAlgorithm, ChecksumError, ContentHasher, DownloadChecksum};
pub use info::{
    parse_download_url, validate_upgrade_name, InfoError, UpgradeInfo, UpgradePayload,
    UPGRADE_INFO_FILENAME,
};
pub use platform::{PlatformKey, ANY_PLATFORM};
