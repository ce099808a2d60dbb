use std::{io, path::PathBuf, process::ExitStatus};

use upvisor_domain::InfoError;
use upvisor_store::DownloadError;

use crate::config::ConfigError;

/// Failures of one supervision cycle.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("no usable binary at {}: {reason}", path.display())]
    NotInstalled { path: PathBuf, reason: String },
    #[error(transparent)]
    InvalidName(InfoError),
    #[error("failed to start {}: {source}", program.display())]
    ChildSpawn {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} exited unsuccessfully ({status})", program.display())]
    ChildExit { program: PathBuf, status: ExitStatus },
    #[error("upgrade signal at {} is malformed: {source}", path.display())]
    MalformedSignal {
        path: PathBuf,
        #[source]
        source: InfoError,
    },
    #[error("upgrade \"{name}\" is not installed and cannot be fetched: {reason}")]
    UpgradeUnavailable { name: String, reason: String },
    #[error("upgrade \"{name}\" has no binary for platform {platform} (available: {available})")]
    UnsupportedPlatform {
        name: String,
        platform: String,
        available: String,
    },
    #[error("failed to install upgrade \"{name}\": {source}")]
    Download {
        name: String,
        #[source]
        source: DownloadError,
    },
    #[error("another supervision cycle is already running for {}", home.display())]
    CycleInProgress { home: PathBuf },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl SupervisorError {
    pub(crate) fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// The downloader failure behind a [`SupervisorError::Download`], if any.
    #[must_use]
    pub fn download_error(&self) -> Option<&DownloadError> {
        match self {
            Self::Download { source, .. } => Some(source),
            _ => None,
        }
    }

    /// Whether the cycle stopped because downloaded content could not be trusted.
    #[must_use]
    pub fn is_integrity_failure(&self) -> bool {
        matches!(
            self.download_error(),
            Some(
                DownloadError::MissingChecksum { .. }
                    | DownloadError::InvalidChecksum { .. }
                    | DownloadError::ChecksumMismatch { .. }
            )
        )
    }

    /// Exit code the daemon itself reported, when that is what ended the cycle.
    #[must_use]
    pub fn child_exit_code(&self) -> Option<i32> {
        match self {
            Self::ChildExit { status, .. } => status.code(),
            _ => None,
        }
    }
}
