use std::{path::PathBuf, time::Duration};

use clap::{ArgAction, Args, Parser, Subcommand};
use upvisor_core::config::{parse_bool, parse_duration};
use upvisor_core::{Config, ConfigError, ConfigOverrides};

#[derive(Parser, Debug)]
#[command(
    name = "upvisor",
    author,
    version,
    about = "Run a node daemon and switch it to new versions when it asks for an upgrade",
    disable_help_subcommand = true
)]
pub struct UpvisorCli {
    #[arg(short, long, help = "Only log errors (upgrade announcements still print)", global = true)]
    pub quiet: bool,
    #[arg(short, long, action = ArgAction::Count, help = "Increase logging (-vv reaches trace)", global = true)]
    pub verbose: u8,
    #[arg(long, help = "Force trace logging regardless of -v/-q", global = true)]
    pub trace: bool,
    #[arg(long, help = "Daemon home holding genesis/, upgrades/ and current [env: DAEMON_HOME]", global = true)]
    pub home: Option<PathBuf>,
    #[arg(long, help = "Executable name looked up under <version>/bin/ [env: DAEMON_NAME]", global = true)]
    pub name: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Supervise the current binary, passing every argument after `--` through.
    Run(RunArgs),
    /// Install a genesis binary and point `current` at it.
    Init {
        #[arg(value_name = "BINARY")]
        binary: PathBuf,
    },
    /// Pre-install an upgrade so no download is needed when it is announced.
    AddUpgrade {
        #[arg(value_name = "NAME")]
        upgrade: String,
        #[arg(value_name = "BINARY")]
        binary: PathBuf,
    },
    /// Print the binary `current` resolves to.
    Current,
}

/// `run` options. Unset flags fall back to the matching `DAEMON_*` variable, then to the
/// library default.
#[derive(Args, Debug)]
pub struct RunArgs {
    #[arg(
        long,
        value_parser = parse_duration,
        help = "How often to check for an upgrade signal [env: DAEMON_POLL_INTERVAL] [default: 300ms]"
    )]
    pub poll_interval: Option<Duration>,
    #[arg(
        long,
        value_parser = parse_bool,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Download announced upgrades that are not installed yet [env: DAEMON_ALLOW_DOWNLOAD_BINARIES] [default: false]"
    )]
    pub allow_download_binaries: Option<bool>,
    #[arg(
        long,
        value_parser = parse_bool,
        action = ArgAction::Set,
        num_args = 0..=1,
        default_missing_value = "true",
        help = "Start the new version right after a successful switch [env: DAEMON_RESTART_AFTER_UPGRADE] [default: true]"
    )]
    pub restart_after_upgrade: Option<bool>,
    #[arg(
        long,
        value_parser = parse_duration,
        help = "Time the daemon gets to exit on its own after announcing an upgrade [env: DAEMON_SHUTDOWN_GRACE] [default: 2s]"
    )]
    pub shutdown_grace: Option<Duration>,
    #[arg(
        long,
        value_parser = parse_duration,
        help = "Timeout for each upgrade download [env: DAEMON_DOWNLOAD_TIMEOUT] [default: 10m]"
    )]
    pub download_timeout: Option<Duration>,
    #[arg(last = true, value_name = "ARG", allow_hyphen_values = true)]
    pub daemon_args: Vec<String>,
}

impl UpvisorCli {
    /// Flags the user passed, in the shape the environment loader layers on top.
    pub fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides {
            home: self.home.clone(),
            name: self.name.clone(),
            ..ConfigOverrides::default()
        };
        if let Command::Run(run) = &self.command {
            overrides.poll_interval = run.poll_interval;
            overrides.allow_download_binaries = run.allow_download_binaries;
            overrides.restart_after_upgrade = run.restart_after_upgrade;
            overrides.shutdown_grace = run.shutdown_grace;
            overrides.download_timeout = run.download_timeout;
        }
        overrides
    }

    pub fn config(&self) -> Result<Config, ConfigError> {
        Config::from_env_with(&self.overrides())
    }
}
