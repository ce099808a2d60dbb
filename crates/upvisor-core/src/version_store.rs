use std::{
    fs, io,
    path::{Path, PathBuf},
};

use time::OffsetDateTime;
use tracing::{debug, info, warn};
use upvisor_domain::{validate_upgrade_name, UPGRADE_INFO_FILENAME};

use crate::{
    config::{Config, BIN_DIR, CURRENT_LINK, DATA_DIR, GENESIS_DIR, UPGRADES_DIR},
    error::SupervisorError,
    fs::{install_executable, is_executable_file, swap_dir_link},
};

/// Installed versions of one daemon under a home directory.
///
/// ```text
/// <home>/genesis/bin/<name>
/// <home>/upgrades/<upgrade>/bin/<name>
/// <home>/current -> genesis | upgrades/<upgrade>
/// <home>/data/upgrade-info.json
/// ```
///
/// `current` is only ever replaced through [`VersionStore::switch_to`] (or created by
/// [`VersionStore::ensure_current`]), and always by renaming a fully formed link over it.
#[derive(Debug, Clone)]
pub struct VersionStore {
    home: PathBuf,
    name: String,
}

impl VersionStore {
    /// # Errors
    /// Returns [`SupervisorError::InvalidName`] when `name` is not a plain file name.
    pub fn new(home: impl Into<PathBuf>, name: impl Into<String>) -> Result<Self, SupervisorError> {
        let name = name.into();
        validate_upgrade_name(&name).map_err(SupervisorError::InvalidName)?;
        Ok(Self {
            home: home.into(),
            name,
        })
    }

    /// # Errors
    /// Returns [`SupervisorError::InvalidName`] when the configured daemon name is unusable.
    pub fn from_config(config: &Config) -> Result<Self, SupervisorError> {
        Self::new(config.home.clone(), config.name.clone())
    }

    #[must_use]
    pub fn home(&self) -> &Path {
        &self.home
    }

    #[must_use]
    pub fn daemon_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn genesis_dir(&self) -> PathBuf {
        self.home.join(GENESIS_DIR)
    }

    #[must_use]
    pub fn genesis_binary(&self) -> PathBuf {
        self.binary_in(&self.genesis_dir())
    }

    /// # Errors
    /// Returns [`SupervisorError::InvalidName`] for names that are not a single path component.
    pub fn upgrade_dir(&self, name: &str) -> Result<PathBuf, SupervisorError> {
        validate_upgrade_name(name).map_err(SupervisorError::InvalidName)?;
        Ok(self.home.join(UPGRADES_DIR).join(name))
    }

    /// # Errors
    /// Returns [`SupervisorError::InvalidName`] for names that are not a single path component.
    pub fn upgrade_binary(&self, name: &str) -> Result<PathBuf, SupervisorError> {
        Ok(self.binary_in(&self.upgrade_dir(name)?))
    }

    #[must_use]
    pub fn current_link(&self) -> PathBuf {
        self.home.join(CURRENT_LINK)
    }

    #[must_use]
    pub fn signal_path(&self) -> PathBuf {
        self.home.join(DATA_DIR).join(UPGRADE_INFO_FILENAME)
    }

    /// Directory `current` points at, resolved against the home directory.
    ///
    /// # Errors
    /// Returns [`SupervisorError::NotInstalled`] when the pointer is missing or dangling.
    pub fn current_dir(&self) -> Result<PathBuf, SupervisorError> {
        let link = self.current_link();
        let target = fs::read_link(&link).map_err(|err| SupervisorError::NotInstalled {
            path: link.clone(),
            reason: format!("version pointer is unreadable: {err}"),
        })?;
        let resolved = if target.is_absolute() {
            target
        } else {
            self.home.join(target)
        };
        if !resolved.is_dir() {
            return Err(SupervisorError::NotInstalled {
                path: link,
                reason: format!("points at missing directory {}", resolved.display()),
            });
        }
        Ok(resolved)
    }

    /// Executable of the active version.
    ///
    /// # Errors
    /// Returns [`SupervisorError::NotInstalled`] if the pointer or the executable is absent.
    pub fn current_binary(&self) -> Result<PathBuf, SupervisorError> {
        let binary = self.binary_in(&self.current_dir()?);
        if !is_executable_file(&binary) {
            return Err(SupervisorError::NotInstalled {
                path: binary,
                reason: "missing or not executable".into(),
            });
        }
        Ok(binary)
    }

    /// Whether `upgrades/<name>` already holds an executable for this daemon.
    #[must_use]
    pub fn has_usable_upgrade(&self, name: &str) -> bool {
        self.upgrade_binary(name)
            .map(|binary| is_executable_file(&binary))
            .unwrap_or(false)
    }

    /// Create `current -> genesis` when no pointer exists yet.
    ///
    /// # Errors
    /// Returns [`SupervisorError::NotInstalled`] when there is no pointer and no usable
    /// genesis binary to point it at.
    pub fn ensure_current(&self) -> Result<(), SupervisorError> {
        let link = self.current_link();
        if fs::symlink_metadata(&link).is_ok() {
            return Ok(());
        }
        let genesis = self.genesis_binary();
        if !is_executable_file(&genesis) {
            return Err(SupervisorError::NotInstalled {
                path: genesis,
                reason: "no version pointer and no genesis binary".into(),
            });
        }
        swap_dir_link(Path::new(GENESIS_DIR), &link).map_err(|err| {
            SupervisorError::io(format!("failed to create {}", link.display()), err)
        })?;
        info!(link = %link.display(), "version pointer initialised to genesis");
        Ok(())
    }

    /// Atomically repoint `current` at `upgrades/<name>`.
    ///
    /// The upgrade directory must already contain the executable.
    ///
    /// # Errors
    /// Returns [`SupervisorError::NotInstalled`] when the upgrade is incomplete, or
    /// [`SupervisorError::Io`] when the link cannot be replaced.
    pub fn switch_to(&self, name: &str) -> Result<(), SupervisorError> {
        let binary = self.upgrade_binary(name)?;
        if !is_executable_file(&binary) {
            return Err(SupervisorError::NotInstalled {
                path: binary,
                reason: "upgrade is not fully installed".into(),
            });
        }
        let target = Path::new(UPGRADES_DIR).join(name);
        let link = self.current_link();
        swap_dir_link(&target, &link).map_err(|err| {
            SupervisorError::io(
                format!("failed to point {} at {}", link.display(), target.display()),
                err,
            )
        })?;
        info!(upgrade = name, link = %link.display(), "switched current version");
        Ok(())
    }

    /// Move an existing signal file aside so it cannot be processed twice.
    ///
    /// Returns the archive path, or `None` when there was nothing to rotate.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Io`] if the file exists but cannot be renamed.
    pub fn rotate_signal(&self) -> Result<Option<PathBuf>, SupervisorError> {
        let signal = self.signal_path();
        match fs::symlink_metadata(&signal) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SupervisorError::io(
                    format!("failed to inspect {}", signal.display()),
                    err,
                ))
            }
        }
        let archived = self.rotation_target(&signal);
        fs::rename(&signal, &archived).map_err(|err| {
            SupervisorError::io(format!("failed to rotate {}", signal.display()), err)
        })?;
        debug!(from = %signal.display(), to = %archived.display(), "rotated upgrade signal");
        Ok(Some(archived))
    }

    fn rotation_target(&self, signal: &Path) -> PathBuf {
        let stamp = OffsetDateTime::now_utc().unix_timestamp();
        let base = format!("{UPGRADE_INFO_FILENAME}.{stamp}");
        let dir = signal.parent().unwrap_or(&self.home);
        let mut candidate = dir.join(format!("{base}.bak"));
        let mut n = 1u32;
        while candidate.exists() {
            candidate = dir.join(format!("{base}-{n}.bak"));
            n += 1;
        }
        candidate
    }

    /// Copy `source` in as the genesis binary and create the pointer if it is missing.
    ///
    /// # Errors
    /// Returns [`SupervisorError::Io`] when the copy fails.
    pub fn install_genesis(&self, source: &Path) -> Result<PathBuf, SupervisorError> {
        let dest = self.genesis_binary();
        install_executable(source, &dest).map_err(|err| {
            SupervisorError::io(format!("failed to install {}", dest.display()), err)
        })?;
        fs::create_dir_all(self.home.join(DATA_DIR)).map_err(|err| {
            SupervisorError::io(format!("failed to create {}", self.home.display()), err)
        })?;
        self.ensure_current()?;
        Ok(dest)
    }

    /// Pre-install an upgrade from a local executable; the pointer is left alone.
    ///
    /// # Errors
    /// Returns [`SupervisorError::InvalidName`] or [`SupervisorError::Io`].
    pub fn install_upgrade(&self, name: &str, source: &Path) -> Result<PathBuf, SupervisorError> {
        let dest = self.upgrade_binary(name)?;
        if dest.exists() {
            warn!(upgrade = name, path = %dest.display(), "replacing installed upgrade binary");
        }
        install_executable(source, &dest).map_err(|err| {
            SupervisorError::io(format!("failed to install {}", dest.display()), err)
        })?;
        Ok(dest)
    }

    fn binary_in(&self, version_dir: &Path) -> PathBuf {
        version_dir.join(BIN_DIR).join(&self.name)
    }
}
