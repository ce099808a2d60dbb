use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::Duration,
};

use tracing::{debug, trace};
use upvisor_domain::{InfoError, UpgradeInfo};

use crate::error::SupervisorError;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("upgrade signal at {} is malformed: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: InfoError,
    },
    #[error("failed to read upgrade signal at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl From<WatchError> for SupervisorError {
    fn from(err: WatchError) -> Self {
        match err {
            WatchError::Malformed { path, source } => Self::MalformedSignal { path, source },
            WatchError::Io { path, source } => {
                Self::io(format!("failed to read {}", path.display()), source)
            }
        }
    }
}

#[derive(Debug)]
pub enum WatchOutcome {
    Detected(UpgradeInfo),
    Stopped,
}

/// Polls one signal path for an upgrade announcement.
///
/// The file is expected to be absent when watching starts; any content seen afterwards is
/// treated as new.
#[derive(Debug, Clone)]
pub struct SignalWatcher {
    path: PathBuf,
    interval: Duration,
}

impl SignalWatcher {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, interval: Duration) -> Self {
        Self {
            path: path.into(),
            interval,
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Poll until an announcement appears or `stop` fires (or its sender is dropped).
    ///
    /// Content that does not parse is only reported once two consecutive polls read the
    /// same bytes, so a half-written file is retried instead of rejected.
    ///
    /// # Errors
    /// [`WatchError::Malformed`] for a settled unparsable file, [`WatchError::Io`] when the
    /// path cannot be read.
    pub fn watch(&self, stop: &Receiver<()>) -> Result<WatchOutcome, WatchError> {
        let mut probe = SignalProbe::default();
        debug!(path = %self.path.display(), interval = ?self.interval, "watching for upgrade signal");
        loop {
            if let Some(info) = probe.poll(&self.path)? {
                return Ok(WatchOutcome::Detected(info));
            }
            match stop.recv_timeout(self.interval) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    trace!(path = %self.path.display(), "signal watch stopped");
                    return Ok(WatchOutcome::Stopped);
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Read the signal once; unparsable content is reported immediately.
    ///
    /// # Errors
    /// Same as [`SignalWatcher::watch`], without waiting for the content to settle.
    pub fn check_once(&self) -> Result<Option<UpgradeInfo>, WatchError> {
        let Some(bytes) = read_signal(&self.path)? else {
            return Ok(None);
        };
        UpgradeInfo::parse(&bytes)
            .map(Some)
            .map_err(|source| WatchError::Malformed {
                path: self.path.clone(),
                source,
            })
    }
}

#[derive(Debug, Default)]
struct SignalProbe {
    unparsed: Option<Vec<u8>>,
}

impl SignalProbe {
    fn poll(&mut self, path: &Path) -> Result<Option<UpgradeInfo>, WatchError> {
        let Some(bytes) = read_signal(path)? else {
            self.unparsed = None;
            return Ok(None);
        };
        match UpgradeInfo::parse(&bytes) {
            Ok(info) => Ok(Some(info)),
            Err(source) => {
                if self.unparsed.as_deref() == Some(bytes.as_slice()) {
                    return Err(WatchError::Malformed {
                        path: path.to_path_buf(),
                        source,
                    });
                }
                trace!(path = %path.display(), error = %source, "signal not parseable yet");
                self.unparsed = Some(bytes);
                Ok(None)
            }
        }
    }
}

/// Contents of the signal file, or `None` when it is absent or still empty.
fn read_signal(path: &Path) -> Result<Option<Vec<u8>>, WatchError> {
    match fs::read(path) {
        Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => Ok(None),
        Ok(bytes) => Ok(Some(bytes)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(WatchError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}
