#![deny(clippy::all, warnings)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Supervision of a single daemon binary across upgrades.
//!
//! [`Launcher::run`] starts whatever `current` points at, streams its output, and watches
//! `data/upgrade-info.json`. When the daemon announces an upgrade the launcher stops it,
//! installs the named version (downloading it when allowed) and repoints `current`.

pub mod config;
mod error;
mod fs;
pub mod launcher;
mod process;
pub mod version_store;
pub mod watcher;

pub use config::{Config, ConfigError, ConfigOverrides};
pub use error::SupervisorError;
pub use launcher::{Launcher, RunResult, RunState, UPGRADE_LOG_TARGET};
pub use version_store::VersionStore;
pub use watcher::{SignalWatcher, WatchError, WatchOutcome};
