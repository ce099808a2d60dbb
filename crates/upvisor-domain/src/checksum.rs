use std::{fmt, str::FromStr};

use sha2::{Digest, Sha256, Sha512};
use url::Url;

/// Hash algorithms accepted in a `checksum=<algorithm>:<hex>` query parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum ChecksumAlgorithm {
    Sha256,
    Sha512,
}

impl ChecksumAlgorithm {
    fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChecksumError {
    #[error("download URL carries no '{}' query parameter", DownloadChecksum::QUERY_KEY)]
    Missing,
    #[error("unsupported checksum algorithm '{algorithm}' (expected sha256 or sha512)")]
    UnsupportedAlgorithm { algorithm: String },
    #[error("checksum '{value}' is malformed: {reason}")]
    Malformed { value: String, reason: &'static str },
}

/// Content hash a download must match before anything is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadChecksum {
    algorithm: ChecksumAlgorithm,
    digest: String,
}

impl DownloadChecksum {
    pub const QUERY_KEY: &'static str = "checksum";

    /// Extract the checksum carried by `url`'s query string.
    pub fn from_url(url: &Url) -> Result<Self, ChecksumError> {
        let value = url
            .query_pairs()
            .find(|(key, _)| key == Self::QUERY_KEY)
            .map(|(_, value)| value.into_owned())
            .ok_or(ChecksumError::Missing)?;
        value.parse()
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn hasher(&self) -> ContentHasher {
        ContentHasher::new(self.algorithm)
    }

    pub fn matches(&self, actual_hex: &str) -> bool {
        self.digest.eq_ignore_ascii_case(actual_hex)
    }
}

impl FromStr for DownloadChecksum {
    type Err = ChecksumError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let Some((algorithm, digest)) = value.split_once(':') else {
            return Err(ChecksumError::Malformed {
                value: value.to_string(),
                reason: "expected '<algorithm>:<hex digest>'",
            });
        };
        let algorithm = algorithm
            .parse::<ChecksumAlgorithm>()
            .map_err(|_| ChecksumError::UnsupportedAlgorithm {
                algorithm: algorithm.to_string(),
            })?;
        if digest.len() != algorithm.hex_len() {
            return Err(ChecksumError::Malformed {
                value: value.to_string(),
                reason: "digest length does not match the algorithm",
            });
        }
        if !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(ChecksumError::Malformed {
                value: value.to_string(),
                reason: "digest is not hexadecimal",
            });
        }
        Ok(Self {
            algorithm,
            digest: digest.to_ascii_lowercase(),
        })
    }
}

impl fmt::Display for DownloadChecksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm, self.digest)
    }
}

/// Incremental hasher for streamed download content.
pub enum ContentHasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl ContentHasher {
    pub fn new(algorithm: ChecksumAlgorithm) -> Self {
        match algorithm {
            ChecksumAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            ChecksumAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    pub fn update(&mut self, bytes: &[u8]) {
        match self {
            Self::Sha256(hasher) => hasher.update(bytes),
            Self::Sha512(hasher) => hasher.update(bytes),
        }
    }

    pub fn finalize_hex(self) -> String {
        match self {
            Self::Sha256(hasher) => hex::encode(hasher.finalize()),
            Self::Sha512(hasher) => hex::encode(hasher.finalize()),
        }
    }
}
