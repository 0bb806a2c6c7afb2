/// One-shot read of the desktop's current color scheme through the
/// `org.freedesktop.portal.Settings` interface.
use std::path::PathBuf;
use std::process::{Command, Stdio};

use thiserror::Error;

use crate::scheme::{self, SystemScheme};

pub const PORTAL_BUS_NAME: &str = "org.freedesktop.portal.Desktop";
pub const PORTAL_OBJECT_PATH: &str = "/org/freedesktop/portal/desktop";
pub const SETTINGS_INTERFACE: &str = "org.freedesktop.portal.Settings";
pub const APPEARANCE_NAMESPACE: &str = "org.freedesktop.appearance";
pub const COLOR_SCHEME_KEY: &str = "color-scheme";

/// The settings service could not produce a usable answer.
///
/// Never fatal: callers keep whatever scheme they had before.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("desktop settings service unavailable: {0}")]
    Unavailable(String),
}

/// Source of the desktop's current color scheme.
pub trait ThemeQuery: Send + Sync {
    fn query(&self) -> Result<SystemScheme, QueryError>;
}

/// Queries the portal by shelling out to `busctl call`.
#[derive(Debug, Clone)]
pub struct BusctlQuery {
    busctl: PathBuf,
    timeout_secs: u64,
}

impl BusctlQuery {
    pub fn new(busctl: impl Into<PathBuf>, timeout_secs: u64) -> Self {
        Self {
            busctl: busctl.into(),
            timeout_secs: timeout_secs.max(1),
        }
    }

    fn args(&self) -> Vec<String> {
        vec![
            "--user".into(),
            "--json=short".into(),
            format!("--timeout={}", self.timeout_secs),
            "call".into(),
            PORTAL_BUS_NAME.into(),
            PORTAL_OBJECT_PATH.into(),
            SETTINGS_INTERFACE.into(),
            "ReadOne".into(),
            "ss".into(),
            APPEARANCE_NAMESPACE.into(),
            COLOR_SCHEME_KEY.into(),
        ]
    }
}

impl ThemeQuery for BusctlQuery {
    fn query(&self) -> Result<SystemScheme, QueryError> {
        let output = Command::new(&self.busctl)
            .args(self.args())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                QueryError::Unavailable(format!("failed to run {}: {e}", self.busctl.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(QueryError::Unavailable(format!(
                "busctl exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        scheme::parse_call_output(&stdout).map_err(|e| QueryError::Unavailable(e.to_string()))
    }
}
