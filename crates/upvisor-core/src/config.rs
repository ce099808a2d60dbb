use std::{
    collections::HashMap,
    env,
    path::PathBuf,
    time::Duration,
};

use upvisor_domain::validate_upgrade_name;

pub const ENV_HOME: &str = "DAEMON_HOME";
pub const ENV_NAME: &str = "DAEMON_NAME";
pub const ENV_POLL_INTERVAL: &str = "DAEMON_POLL_INTERVAL";
pub const ENV_ALLOW_DOWNLOAD: &str = "DAEMON_ALLOW_DOWNLOAD_BINARIES";
pub const ENV_RESTART_AFTER_UPGRADE: &str = "DAEMON_RESTART_AFTER_UPGRADE";
pub const ENV_SHUTDOWN_GRACE: &str = "DAEMON_SHUTDOWN_GRACE";
pub const ENV_DOWNLOAD_TIMEOUT: &str = "DAEMON_DOWNLOAD_TIMEOUT";

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(300);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(600);

pub(crate) const GENESIS_DIR: &str = "genesis";
pub(crate) const UPGRADES_DIR: &str = "upgrades";
pub(crate) const CURRENT_LINK: &str = "current";
pub(crate) const DATA_DIR: &str = "data";
pub(crate) const BIN_DIR: &str = "bin";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{key} must be set")]
    MissingVar { key: &'static str },
    #[error("{key}={value:?} is invalid: {reason}")]
    InvalidVar {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("DAEMON_HOME is not set and no home directory could be determined")]
    NoHome,
}

/// Settings for one supervisor; immutable for the duration of a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub home: PathBuf,
    pub name: String,
    pub poll_interval: Duration,
    pub allow_download_binaries: bool,
    pub restart_after_upgrade: bool,
    pub shutdown_grace: Duration,
    pub download_timeout: Duration,
}

/// Values given explicitly, e.g. on the command line, that win over the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConfigOverrides {
    pub home: Option<PathBuf>,
    pub name: Option<String>,
    pub poll_interval: Option<Duration>,
    pub allow_download_binaries: Option<bool>,
    pub restart_after_upgrade: Option<bool>,
    pub shutdown_grace: Option<Duration>,
    pub download_timeout: Option<Duration>,
}

impl Config {
    pub fn new(home: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            home: home.into(),
            name: name.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
            allow_download_binaries: false,
            restart_after_upgrade: true,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            download_timeout: DEFAULT_DOWNLOAD_TIMEOUT,
        }
    }

    /// Builds a configuration from the `DAEMON_*` environment variables.
    ///
    /// # Errors
    /// Returns an error when `DAEMON_NAME` is missing or any value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(&ConfigOverrides::default())
    }

    /// Like [`Config::from_env`], with explicitly given values taking precedence over the
    /// environment.
    ///
    /// # Errors
    /// Same as [`Config::from_env`]; variables shadowed by an override are not parsed.
    pub fn from_env_with(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        Self::from_snapshot(&EnvSnapshot::capture(), overrides)
    }

    pub(crate) fn from_snapshot(
        snapshot: &EnvSnapshot,
        overrides: &ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let name = match &overrides.name {
            Some(name) => name.trim().to_string(),
            None => snapshot
                .var(ENV_NAME)
                .map(str::trim)
                .unwrap_or_default()
                .to_string(),
        };
        if name.is_empty() {
            return Err(ConfigError::MissingVar { key: ENV_NAME });
        }
        let home = match (&overrides.home, snapshot.var(ENV_HOME).filter(|value| !value.is_empty())) {
            (Some(home), _) => home.clone(),
            (None, Some(home)) => PathBuf::from(home),
            (None, None) => default_home(&name)?,
        };
        let mut config = Self::new(home, name);
        config.poll_interval = resolve(
            snapshot,
            ENV_POLL_INTERVAL,
            overrides.poll_interval,
            parse_duration,
            config.poll_interval,
        )?;
        config.allow_download_binaries = resolve(
            snapshot,
            ENV_ALLOW_DOWNLOAD,
            overrides.allow_download_binaries,
            parse_bool,
            config.allow_download_binaries,
        )?;
        config.restart_after_upgrade = resolve(
            snapshot,
            ENV_RESTART_AFTER_UPGRADE,
            overrides.restart_after_upgrade,
            parse_bool,
            config.restart_after_upgrade,
        )?;
        config.shutdown_grace = resolve(
            snapshot,
            ENV_SHUTDOWN_GRACE,
            overrides.shutdown_grace,
            parse_duration,
            config.shutdown_grace,
        )?;
        config.download_timeout = resolve(
            snapshot,
            ENV_DOWNLOAD_TIMEOUT,
            overrides.download_timeout,
            parse_duration,
            config.download_timeout,
        )?;
        config.validate()?;
        Ok(config)
    }

    /// Checks invariants the rest of the supervisor relies on.
    ///
    /// # Errors
    /// Returns an error for an unusable daemon name or a zero poll interval.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Err(err) = validate_upgrade_name(&self.name) {
            return Err(ConfigError::InvalidVar {
                key: ENV_NAME,
                value: self.name.clone(),
                reason: err.to_string(),
            });
        }
        if self.poll_interval.is_zero() {
            return Err(ConfigError::InvalidVar {
                key: ENV_POLL_INTERVAL,
                value: "0".into(),
                reason: "poll interval must be positive".into(),
            });
        }
        Ok(())
    }
}

/// `~/.<name>`, the home used when `DAEMON_HOME` is not set.
pub fn default_home(name: &str) -> Result<PathBuf, ConfigError> {
    dirs_next::home_dir()
        .map(|home| home.join(format!(".{name}")))
        .ok_or(ConfigError::NoHome)
}

fn resolve<T>(
    snapshot: &EnvSnapshot,
    key: &'static str,
    explicit: Option<T>,
    parse: impl Fn(&str) -> Result<T, String>,
    default: T,
) -> Result<T, ConfigError> {
    if let Some(value) = explicit {
        return Ok(value);
    }
    match snapshot.var(key) {
        Some(raw) => parse(raw).map_err(|reason| ConfigError::InvalidVar {
            key,
            value: raw.to_string(),
            reason,
        }),
        None => Ok(default),
    }
}

/// Accepts `1/true/yes/on` and `0/false/no/off/""` in any case.
pub fn parse_bool(raw: &str) -> Result<bool, String> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(format!("expected a boolean, got '{other}'")),
    }
}

/// Parses `250` (milliseconds) or any `humantime` duration such as `300ms`, `2s` or `1m30s`.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let value = raw.trim();
    if !value.is_empty() && value.bytes().all(|b| b.is_ascii_digit()) {
        return value
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| format!("duration '{raw}' is out of range"));
    }
    humantime::parse_duration(value).map_err(|err| format!("invalid duration '{raw}': {err}"))
}

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars_os()
                .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
                .collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}
