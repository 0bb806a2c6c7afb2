/// Canonical file paths for autodark data files.
///
/// Per-user locations resolved through the XDG base directories:
///   - `$XDG_CONFIG_HOME/autodark/config.toml`  Read (and watched) by the daemon.
///   - `$XDG_CACHE_HOME/autodark/daemon.pid`    Pid of the running subscriber.
///   - `$XDG_CACHE_HOME/autodark/status.toml`   Written by the daemon for `status`.
use anyhow::{Context, Result};
use directories::BaseDirs;
use std::path::PathBuf;

const APP_DIR_NAME: &str = "autodark";
pub const CONFIG_FILE_NAME: &str = "config.toml";
pub const PID_FILE_NAME: &str = "daemon.pid";
pub const STATUS_FILE_NAME: &str = "status.toml";

fn base_dirs() -> Result<BaseDirs> {
    BaseDirs::new().context("Could not determine the home directory")
}

/// Returns the autodark cache directory: `$XDG_CACHE_HOME/autodark`
pub fn cache_dir() -> Result<PathBuf> {
    Ok(base_dirs()?.cache_dir().join(APP_DIR_NAME))
}

/// Returns the autodark config directory: `$XDG_CONFIG_HOME/autodark`
pub fn config_dir() -> Result<PathBuf> {
    Ok(base_dirs()?.config_dir().join(APP_DIR_NAME))
}

/// Returns the full path to the config file.
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Returns the full path to the subscriber pid file.
pub fn pid_file_path() -> Result<PathBuf> {
    Ok(cache_dir()?.join(PID_FILE_NAME))
}

/// Returns the full path to the status file.
pub fn status_file_path() -> Result<PathBuf> {
    Ok(cache_dir()?.join(STATUS_FILE_NAME))
}
