use std::{
    io::Write,
    path::Path,
    process::{Child, ExitStatus},
    sync::{
        mpsc::{self, Receiver, RecvTimeoutError},
        Mutex, TryLockError,
    },
    thread,
    time::Duration,
};

use tracing::{debug, error, info, warn};
use upvisor_domain::{InfoError, PlatformKey, UpgradeInfo, UpgradePayload};
use upvisor_store::Downloader;

use crate::{
    config::{Config, ENV_ALLOW_DOWNLOAD},
    error::SupervisorError,
    process::{kill_tree, pump, spawn_daemon, stop_child, wants_own_group, DaemonProcess},
    version_store::VersionStore,
    watcher::{SignalWatcher, WatchError, WatchOutcome},
};

/// How often the supervisor checks for child exit while waiting on the watcher.
const EXIT_POLL: Duration = Duration::from_millis(25);

/// Target of the upgrade announcement line.
pub const UPGRADE_LOG_TARGET: &str = "upvisor::upgrade";

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunState {
    Idle,
    Spawning,
    Running,
    Upgrading,
    Switching,
    Completed,
    Failed,
}

/// Outcome of one [`Launcher::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunResult {
    /// The announcement that ended the cycle, once the switch to it has completed.
    pub upgrade: Option<UpgradeInfo>,
    /// Exit status of the daemon, when it was observed.
    pub exit_status: Option<ExitStatus>,
}

impl RunResult {
    #[must_use]
    pub fn upgrade_triggered(&self) -> bool {
        self.upgrade.is_some()
    }
}

#[derive(Debug)]
struct StateTracker {
    state: RunState,
}

impl StateTracker {
    fn new() -> Self {
        Self {
            state: RunState::Idle,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug!(from = %self.state, to = %next, "supervisor state");
        self.state = next;
    }
}

enum Race {
    Exited(ExitStatus),
    Signalled(UpgradeInfo, ExitStatus),
    WatchFailed(WatchError),
}

/// Runs the daemon for one cycle at a time and carries out the upgrades it announces.
pub struct Launcher {
    config: Config,
    store: VersionStore,
    platform: PlatformKey,
    cycle: Mutex<()>,
}

impl Launcher {
    /// Validate `config` and make sure the version pointer exists.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Config`] for invalid settings and
    /// [`SupervisorError::NotInstalled`] when neither a pointer nor a genesis binary exists.
    pub fn new(config: Config) -> Result<Self, SupervisorError> {
        config.validate()?;
        let store = VersionStore::from_config(&config)?;
        store.ensure_current()?;
        Ok(Self {
            config,
            store,
            platform: PlatformKey::current(),
            cycle: Mutex::new(()),
        })
    }

    /// Use `platform` instead of the running OS/architecture when picking downloads.
    #[must_use]
    pub fn with_platform(mut self, platform: PlatformKey) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    #[must_use]
    pub fn store(&self) -> &VersionStore {
        &self.store
    }

    /// Run the current binary once with `args`, streaming its output into the sinks.
    ///
    /// Returns with `upgrade` set when the daemon announced an upgrade and `current` now
    /// points at it; the caller decides whether to start the next cycle.
    ///
    /// # Errors
    /// Any [`SupervisorError`]; the version pointer is unchanged unless the switch itself
    /// completed.
    pub fn run(
        &self,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
    ) -> Result<RunResult, SupervisorError> {
        let _guard = match self.cycle.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                return Err(SupervisorError::CycleInProgress {
                    home: self.config.home.clone(),
                })
            }
        };
        let mut state = StateTracker::new();
        let result = self.run_cycle(args, stdout, stderr, &mut state);
        match &result {
            Ok(_) => state.advance(RunState::Completed),
            Err(err) => {
                state.advance(RunState::Failed);
                warn!(error = %err, "supervision cycle failed");
            }
        }
        result
    }

    fn run_cycle(
        &self,
        args: &[String],
        stdout: &mut (dyn Write + Send),
        stderr: &mut (dyn Write + Send),
        state: &mut StateTracker,
    ) -> Result<RunResult, SupervisorError> {
        state.advance(RunState::Spawning);
        if let Some(archived) = self.store.rotate_signal()? {
            warn!(archived = %archived.display(), "stale upgrade signal moved aside before start");
        }
        let binary = self.store.current_binary()?;
        let DaemonProcess {
            mut child,
            stdout: child_out,
            stderr: child_err,
            grouped,
        } = spawn_daemon(&binary, args, wants_own_group())?;
        state.advance(RunState::Running);
        info!(program = %binary.display(), pid = child.id(), args = ?args, "daemon started");

        let watcher = SignalWatcher::new(self.store.signal_path(), self.config.poll_interval);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (event_tx, event_rx) = mpsc::channel();
        let race = thread::scope(|scope| {
            scope.spawn(move || pump(child_out, stdout, "stdout"));
            scope.spawn(move || pump(child_err, stderr, "stderr"));
            let watcher = &watcher;
            scope.spawn(move || {
                let _ = event_tx.send(watcher.watch(&stop_rx));
            });
            let race = self.race(&mut child, grouped, &event_rx, state);
            if race.is_err() {
                let _ = kill_tree(&mut child, grouped);
                let _ = child.wait();
            }
            let _ = stop_tx.send(());
            race
        })?;

        let (info, exit_status) = match race {
            Race::Signalled(info, status) => (info, status),
            Race::WatchFailed(err) => return Err(err.into()),
            Race::Exited(status) => {
                info!(program = %binary.display(), %status, "daemon exited");
                match watcher.check_once()? {
                    Some(info) => {
                        announce(&info);
                        state.advance(RunState::Upgrading);
                        (info, status)
                    }
                    None if status.success() => {
                        return Ok(RunResult {
                            upgrade: None,
                            exit_status: Some(status),
                        })
                    }
                    None => {
                        return Err(SupervisorError::ChildExit {
                            program: binary,
                            status,
                        })
                    }
                }
            }
        };

        state.advance(RunState::Switching);
        self.apply_upgrade(&info)?;
        Ok(RunResult {
            upgrade: Some(info),
            exit_status: Some(exit_status),
        })
    }

    /// Wait for whichever comes first: the daemon exiting or the watcher reporting.
    fn race(
        &self,
        child: &mut Child,
        grouped: bool,
        events: &Receiver<Result<WatchOutcome, WatchError>>,
        state: &mut StateTracker,
    ) -> Result<Race, SupervisorError> {
        loop {
            if let Some(status) = child
                .try_wait()
                .map_err(|err| SupervisorError::io("failed to poll daemon", err))?
            {
                return Ok(Race::Exited(status));
            }
            match events.recv_timeout(EXIT_POLL) {
                Ok(Ok(WatchOutcome::Detected(info))) => {
                    announce(&info);
                    state.advance(RunState::Upgrading);
                    let status = stop_child(child, grouped, self.config.shutdown_grace)?;
                    debug!(%status, "daemon stopped for upgrade");
                    return Ok(Race::Signalled(info, status));
                }
                Ok(Err(err)) => {
                    match &err {
                        WatchError::Malformed { .. } => {
                            warn!(error = %err, "malformed upgrade signal; waiting for the daemon to exit");
                        }
                        WatchError::Io { .. } => {
                            warn!(error = %err, "upgrade signal unreadable; waiting for the daemon to exit");
                        }
                    }
                    let status = child
                        .wait()
                        .map_err(|err| SupervisorError::io("failed to wait for daemon", err))?;
                    debug!(%status, "daemon exited after the signal watch failed");
                    return Ok(Race::WatchFailed(err));
                }
                Ok(Ok(WatchOutcome::Stopped)) | Err(RecvTimeoutError::Disconnected) => {
                    let status = child
                        .wait()
                        .map_err(|err| SupervisorError::io("failed to wait for daemon", err))?;
                    return Ok(Race::Exited(status));
                }
                Err(RecvTimeoutError::Timeout) => {}
            }
        }
    }

    /// Install the announced version if needed, then point `current` at it.
    fn apply_upgrade(&self, info: &UpgradeInfo) -> Result<(), SupervisorError> {
        let name = info.name.as_str();
        let dir = self.store.upgrade_dir(name)?;
        if self.store.has_usable_upgrade(name) {
            debug!(upgrade = name, dir = %dir.display(), "using preinstalled upgrade");
        } else {
            self.download_upgrade(info, &dir)?;
        }
        self.store.switch_to(name)?;
        self.store.rotate_signal()?;
        Ok(())
    }

    fn download_upgrade(&self, info: &UpgradeInfo, dir: &Path) -> Result<(), SupervisorError> {
        let name = info.name.as_str();
        if !self.config.allow_download_binaries {
            return Err(SupervisorError::UpgradeUnavailable {
                name: name.to_string(),
                reason: format!(
                    "{} is not installed and {ENV_ALLOW_DOWNLOAD} is off",
                    dir.display()
                ),
            });
        }
        let malformed = |source: InfoError| SupervisorError::MalformedSignal {
            path: self.store.signal_path(),
            source,
        };
        let payload = info.payload().map_err(malformed)?;
        if payload == UpgradePayload::Empty {
            return Err(SupervisorError::UpgradeUnavailable {
                name: name.to_string(),
                reason: "the announcement carries no download location".into(),
            });
        }
        let url = payload.resolve_url(&self.platform).map_err(|err| match err {
            InfoError::UnsupportedPlatform {
                platform,
                available,
            } => SupervisorError::UnsupportedPlatform {
                name: name.to_string(),
                platform,
                available,
            },
            source => malformed(source),
        })?;
        let download = |source: upvisor_store::DownloadError| SupervisorError::Download {
            name: name.to_string(),
            source,
        };
        let downloader =
            Downloader::new(self.store.daemon_name(), self.config.download_timeout).map_err(download)?;
        let installed = downloader
            .materialize(&url, dir, &self.platform)
            .map_err(download)?;
        info!(
            upgrade = name,
            binary = %installed.binary.display(),
            referrals = installed.referrals,
            bytes = installed.bytes_fetched,
            "upgrade downloaded"
        );
        Ok(())
    }
}

/// The one line operators must see, logged before any install or switch work starts.
fn announce(info: &UpgradeInfo) {
    match info.height {
        Some(height) => error!(
            target: UPGRADE_LOG_TARGET,
            upgrade = %info.name,
            height,
            "UPGRADE \"{}\" NEEDED at height: {}: {}",
            info.name,
            height,
            info.info
        ),
        None => error!(
            target: UPGRADE_LOG_TARGET,
            upgrade = %info.name,
            "UPGRADE \"{}\" NEEDED: {}",
            info.name,
            info.info
        ),
    }
}
