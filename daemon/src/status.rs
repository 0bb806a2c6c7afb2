use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::error;

use crate::monitor::MonitorState;
use crate::scheme::{Mode, SystemScheme};

/// Runtime status written by the daemon to `$XDG_CACHE_HOME/autodark/status.toml`.
/// `autodark-daemon status` reads this file (read-only) to report daemon state.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DaemonStatus {
    /// Daemon binary version (set from Cargo.toml at compile time).
    pub version: String,
    /// Configured appearance preference.
    pub mode: Mode,
    /// Lifecycle state of the color-scheme subscription.
    pub monitor: MonitorState,
    /// Scheme most recently applied, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheme: Option<SystemScheme>,
    /// Pid of the running subscriber subprocess, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscriber_pid: Option<u32>,
    /// RFC 3339 timestamp of the most recently applied scheme change.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_change: Option<String>,
    /// Human-readable message for the last non-fatal error.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DaemonStatus {
    /// Constructs the initial status on daemon startup.
    pub fn new(mode: Mode) -> Self {
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            mode,
            monitor: MonitorState::Stopped,
            scheme: None,
            subscriber_pid: None,
            last_change: None,
            error: None,
        }
    }

    /// Records that `scheme` was just applied.
    pub fn record_change(&mut self, scheme: SystemScheme) {
        self.scheme = Some(scheme);
        self.last_change = Some(chrono::Local::now().to_rfc3339());
    }
}

/// Serializes `status` to TOML and writes it to `path`.
/// Creates the parent directory if it does not exist.
/// Logs errors rather than panicking: a status write failure should
/// never crash the daemon.
pub fn write_status(path: &Path, status: &DaemonStatus) {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("Failed to create directory {}: {e}", parent.display());
            return;
        }
    }
    match toml::to_string_pretty(status) {
        Ok(content) => {
            if let Err(e) = std::fs::write(path, content) {
                error!("Failed to write status file: {e}");
            }
        }
        Err(e) => error!("Failed to serialize status: {e}"),
    }
}

/// Reads the status file last written by a daemon.
pub fn read_status(path: &Path) -> Result<DaemonStatus> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read status file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse status file: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── DaemonStatus::new ─────────────────────────────────────────────────────

    #[test]
    fn new_starts_stopped() {
        let s = DaemonStatus::new(Mode::System);
        assert_eq!(s.monitor, MonitorState::Stopped);
        assert_eq!(s.mode, Mode::System);
    }

    #[test]
    fn new_has_no_optional_fields() {
        let s = DaemonStatus::new(Mode::Dark);
        assert!(s.scheme.is_none());
        assert!(s.subscriber_pid.is_none());
        assert!(s.last_change.is_none());
        assert!(s.error.is_none());
    }

    #[test]
    fn new_version_matches_cargo_pkg() {
        let s = DaemonStatus::new(Mode::Light);
        assert_eq!(s.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn record_change_sets_scheme_and_timestamp() {
        let mut s = DaemonStatus::new(Mode::System);
        s.record_change(SystemScheme::Dark);
        assert_eq!(s.scheme, Some(SystemScheme::Dark));
        let stamp = s.last_change.unwrap();
        assert!(chrono::DateTime::parse_from_rfc3339(&stamp).is_ok());
    }

    // ── serialization ─────────────────────────────────────────────────────────

    #[test]
    fn states_serialize_to_lowercase() {
        let mut s = DaemonStatus::new(Mode::System);
        s.monitor = MonitorState::Running;
        s.scheme = Some(SystemScheme::Light);
        let content = toml::to_string_pretty(&s).unwrap();
        assert!(content.contains("mode = \"system\""));
        assert!(content.contains("monitor = \"running\""));
        assert!(content.contains("scheme = \"light\""));
    }

    // ── write_status / read_status ────────────────────────────────────────────

    #[test]
    fn write_status_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dir").join("status.toml");
        write_status(&path, &DaemonStatus::new(Mode::System));
        assert!(path.exists());
    }

    #[test]
    fn write_status_content_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");

        let mut original = DaemonStatus::new(Mode::System);
        original.monitor = MonitorState::Running;
        original.subscriber_pid = Some(4242);
        original.record_change(SystemScheme::Dark);

        write_status(&path, &original);
        let parsed = read_status(&path).unwrap();

        assert_eq!(parsed.monitor, MonitorState::Running);
        assert_eq!(parsed.subscriber_pid, Some(4242));
        assert_eq!(parsed.scheme, Some(SystemScheme::Dark));
        assert_eq!(parsed.last_change, original.last_change);
    }

    #[test]
    fn write_status_omits_none_optional_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.toml");
        write_status(&path, &DaemonStatus::new(Mode::Dark));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(!content.contains("scheme"));
        assert!(!content.contains("subscriber_pid"));
        assert!(!content.contains("last_change"));
        assert!(!content.contains("error"));
    }

    #[test]
    fn read_status_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_status(&dir.path().join("status.toml")).is_err());
    }
}
