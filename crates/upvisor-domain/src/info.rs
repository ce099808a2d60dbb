use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::platform::{PlatformKey, ANY_PLATFORM};

/// File name of an upgrade announcement, both under `<home>/data/` and inside referral artifacts.
pub const UPGRADE_INFO_FILENAME: &str = "upgrade-info.json";

const ALLOWED_SCHEMES: &[&str] = &["http", "https", "file"];

#[derive(Debug, thiserror::Error)]
pub enum InfoError {
    #[error("upgrade announcement is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid upgrade name '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },
    #[error("upgrade info payload is not a binaries object or a URL: '{payload}'")]
    UnrecognizedPayload { payload: String },
    #[error("invalid download URL '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported URL scheme '{scheme}' in '{url}' (expected http, https or file)")]
    UnsupportedScheme { scheme: String, url: String },
    #[error("no binary listed for platform {platform} (available: {available})")]
    UnsupportedPlatform { platform: String, available: String },
    #[error("upgrade info carries no download location")]
    EmptyPayload,
}

/// Announcement that the supervised daemon must be replaced by the named version.
///
/// Written as JSON by the daemon (or found inside a referral artifact):
/// `{"name": "chain2", "height": 49, "info": "..."}`. `info` is kept verbatim; use
/// [`UpgradeInfo::payload`] to interpret it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpgradeInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u64>,
    #[serde(default)]
    pub info: String,
}

impl UpgradeInfo {
    /// Parse and validate an announcement.
    pub fn parse(bytes: &[u8]) -> Result<Self, InfoError> {
        let info: Self = serde_json::from_slice(bytes)?;
        validate_upgrade_name(&info.name)?;
        Ok(info)
    }

    pub fn payload(&self) -> Result<UpgradePayload, InfoError> {
        UpgradePayload::parse(&self.info)
    }
}

/// Interpreted form of the loosely typed `info` string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradePayload {
    Empty,
    Binaries(IndexMap<String, String>),
    DirectUrl(Url),
}

#[derive(Deserialize)]
struct BinariesDocument {
    #[serde(default)]
    binaries: IndexMap<String, String>,
}

impl UpgradePayload {
    pub fn parse(raw: &str) -> Result<Self, InfoError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Ok(Self::Empty);
        }
        if trimmed.starts_with('{') {
            let doc: BinariesDocument = serde_json::from_str(trimmed)?;
            if doc.binaries.is_empty() {
                return Ok(Self::Empty);
            }
            return Ok(Self::Binaries(doc.binaries));
        }
        if !trimmed.contains("://") {
            return Err(InfoError::UnrecognizedPayload {
                payload: trimmed.to_string(),
            });
        }
        parse_download_url(trimmed).map(Self::DirectUrl)
    }

    /// Pick the download URL for `platform`, falling back to an `any` entry.
    pub fn resolve_url(&self, platform: &PlatformKey) -> Result<Url, InfoError> {
        match self {
            Self::Empty => Err(InfoError::EmptyPayload),
            Self::DirectUrl(url) => Ok(url.clone()),
            Self::Binaries(binaries) => {
                let key = platform.to_string();
                let raw = binaries
                    .get(&key)
                    .or_else(|| binaries.get(ANY_PLATFORM))
                    .ok_or_else(|| InfoError::UnsupportedPlatform {
                        platform: key.clone(),
                        available: binaries.keys().cloned().collect::<Vec<_>>().join(", "),
                    })?;
                parse_download_url(raw)
            }
        }
    }
}

/// Parse a download location, accepting only schemes the downloader can fetch.
pub fn parse_download_url(raw: &str) -> Result<Url, InfoError> {
    let url = Url::parse(raw.trim()).map_err(|source| InfoError::InvalidUrl {
        url: raw.to_string(),
        source,
    })?;
    if !ALLOWED_SCHEMES.contains(&url.scheme()) {
        return Err(InfoError::UnsupportedScheme {
            scheme: url.scheme().to_string(),
            url: raw.to_string(),
        });
    }
    Ok(url)
}

/// Upgrade names become a directory under `upgrades/`, so they must be a single plain component.
pub fn validate_upgrade_name(name: &str) -> Result<(), InfoError> {
    let reason = if name.is_empty() {
        Some("must not be empty")
    } else if name == "." || name == ".." {
        Some("must not be a relative directory reference")
    } else if name.contains(['/', '\\']) {
        Some("must not contain path separators")
    } else if name.starts_with('.') {
        Some("must not start with '.'")
    } else if name.chars().any(char::is_control) {
        Some("must not contain control characters")
    } else {
        None
    };
    match reason {
        Some(reason) => Err(InfoError::InvalidName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}
