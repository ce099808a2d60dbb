use std::io;

use clap::Parser;
use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use upvisor_core::{Launcher, VersionStore};

mod cli;

use cli::{Command, RunArgs, UpvisorCli};

fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = UpvisorCli::parse();
    init_tracing(cli.trace, cli.verbose, cli.quiet);

    let code = dispatch(&cli)?;
    if code == 0 {
        Ok(())
    } else {
        std::process::exit(code);
    }
}

/// Logs go to stderr so the daemon's stdout stays untouched. `RUST_LOG` wins when set.
fn init_tracing(trace: bool, verbose: u8, quiet: bool) {
    let level = if trace {
        "trace"
    } else if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "upvisor={level},upvisor_core={level},upvisor_store={level},upvisor_cli={level}"
        ))
    });
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn dispatch(cli: &UpvisorCli) -> Result<i32> {
    let config = cli.config()?;
    match &cli.command {
        Command::Run(args) => run(Launcher::new(config)?, args),
        Command::Init { binary } => {
            let installed = VersionStore::from_config(&config)?.install_genesis(binary)?;
            println!("{}", installed.display());
            Ok(0)
        }
        Command::AddUpgrade { upgrade, binary } => {
            let installed = VersionStore::from_config(&config)?.install_upgrade(upgrade, binary)?;
            println!("{}", installed.display());
            Ok(0)
        }
        Command::Current => {
            let current = VersionStore::from_config(&config)?.current_binary()?;
            println!("{}", current.display());
            Ok(0)
        }
    }
}

/// Cycle until the daemon stops without asking for an upgrade, mirroring its exit code.
fn run(launcher: Launcher, args: &RunArgs) -> Result<i32> {
    let mut stdout = io::stdout();
    let mut stderr = io::stderr();
    loop {
        match launcher.run(&args.daemon_args, &mut stdout, &mut stderr) {
            Ok(result) => match result.upgrade {
                Some(upgrade) if launcher.config().restart_after_upgrade => {
                    info!(upgrade = %upgrade.name, "restarting on upgraded binary");
                }
                Some(upgrade) => {
                    info!(upgrade = %upgrade.name, "upgrade installed; not restarting");
                    return Ok(0);
                }
                None => return Ok(result.exit_status.and_then(|status| status.code()).unwrap_or(0)),
            },
            Err(err) => {
                if let Some(code) = err.child_exit_code() {
                    error!(%err, "daemon failed");
                    return Ok(code);
                }
                return Err(err.into());
            }
        }
    }
}
