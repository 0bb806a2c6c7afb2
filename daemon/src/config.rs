use anyhow::{bail, Context, Result};
use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, warn};

use crate::event::DaemonEvent;
use crate::scheme::{Mode, SystemScheme};

pub const DEFAULT_BUSCTL: &str = "/usr/bin/busctl";
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 500;
pub const MIN_POLL_INTERVAL_MS: u64 = 50;
pub const MAX_POLL_INTERVAL_MS: u64 = 10_000;
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 5;

/// Root configuration structure. Deserialized from `<config-dir>/autodark/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Appearance preference: "dark", "light" or "system".
    #[serde(default)]
    pub mode: Mode,
    /// Log at debug level.
    #[serde(default)]
    pub debug: bool,
    /// Path of the `busctl` binary used for both the query and the subscription.
    #[serde(default = "default_busctl")]
    pub busctl: PathBuf,
    /// How long the subscription loop sleeps when no record is waiting.
    /// Clamped to [50, 10000].
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single settings query, passed to `busctl --timeout`.
    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,
    #[serde(default)]
    pub appearance: AppearanceConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            debug: false,
            busctl: default_busctl(),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            query_timeout_secs: DEFAULT_QUERY_TIMEOUT_SECS,
            appearance: AppearanceConfig::default(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.poll_interval_ms
                .clamp(MIN_POLL_INTERVAL_MS, MAX_POLL_INTERVAL_MS),
        )
    }

    /// Serializes the config into the table watched by the settings watchers.
    pub fn to_table(&self) -> Result<toml::Table> {
        match toml::Value::try_from(self).context("Failed to serialize config")? {
            toml::Value::Table(table) => Ok(table),
            other => bail!("Config serialized to a {} instead of a table", other.type_str()),
        }
    }
}

/// Where and what to write when the color scheme changes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppearanceConfig {
    /// JSON preferences file whose `theme` / `color_scheme` keys get swapped.
    /// Without it scheme changes are only logged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferences: Option<PathBuf>,
    #[serde(default)]
    pub dark: ThemePair,
    #[serde(default)]
    pub light: ThemePair,
}

impl AppearanceConfig {
    pub fn for_scheme(&self, scheme: SystemScheme) -> &ThemePair {
        match scheme {
            SystemScheme::Dark => &self.dark,
            SystemScheme::Light => &self.light,
        }
    }
}

/// Theme and color scheme applied for one appearance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThemePair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color_scheme: Option<String>,
}

/// Loads the config file at `path`, returning `Config::default()` if the file does not exist.
/// Returns an error if the file exists but cannot be read or parsed.
pub fn load_or_default(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Rewrites only the `mode` key of the config file, keeping every other key.
/// Creates the file (and its directory) if needed.
pub fn save_mode(path: &Path, mode: Mode) -> Result<()> {
    let mut table: toml::Table = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?
    } else {
        toml::Table::new()
    };

    if table.get("mode").and_then(toml::Value::as_str) == Some(mode.as_str()) {
        return Ok(());
    }
    table.insert("mode".into(), toml::Value::String(mode.as_str().into()));

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = toml::to_string_pretty(&table).context("Failed to serialize config")?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))
}

/// Spawns a file watcher on the parent directory of `path`.  Whenever the config
/// file is created or modified, reloads it and sends a `ConfigReloaded` event.
pub async fn watch_config(path: PathBuf, tx: mpsc::UnboundedSender<DaemonEvent>) {
    let (watch_tx, mut watch_rx) = mpsc::channel::<notify::Event>(16);

    let mut watcher = match RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = watch_tx.blocking_send(event);
            }
        },
        NotifyConfig::default(),
    ) {
        Ok(w) => w,
        Err(e) => {
            error!("Failed to create config watcher: {e}");
            return;
        }
    };

    // Watch the parent directory rather than the file directly so we catch
    // editor-style atomic saves (write-new + rename).
    let watch_dir = match path.parent() {
        Some(d) => d.to_path_buf(),
        None => {
            error!("Config path has no parent directory");
            return;
        }
    };
    if let Err(e) = std::fs::create_dir_all(&watch_dir) {
        error!("Failed to create config directory {}: {e}", watch_dir.display());
        return;
    }

    if let Err(e) = watcher.watch(&watch_dir, RecursiveMode::NonRecursive) {
        error!("Failed to watch config directory: {e}");
        return;
    }

    while let Some(event) = watch_rx.recv().await {
        let affects_config = event.paths.iter().any(|p| p == path.as_path());
        let is_write = matches!(
            event.kind,
            notify::EventKind::Create(_) | notify::EventKind::Modify(_)
        );

        if affects_config && is_write {
            match load_or_default(&path) {
                Ok(config) => {
                    if tx.send(DaemonEvent::ConfigReloaded(config)).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Failed to reload config: {e:#}"),
            }
        }
    }
}

fn default_busctl() -> PathBuf {
    PathBuf::from(DEFAULT_BUSCTL)
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_query_timeout_secs() -> u64 {
    DEFAULT_QUERY_TIMEOUT_SECS
}
