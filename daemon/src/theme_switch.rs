/// Swaps the `theme` and `color_scheme` entries of a JSON preferences file to
/// the pair configured for the new appearance.
use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, info};

use crate::config::AppearanceConfig;
use crate::scheme::SystemScheme;

const THEME_KEY: &str = "theme";
const COLOR_SCHEME_KEY: &str = "color_scheme";

#[derive(Debug, Clone)]
pub struct ThemeSwitcher {
    appearance: AppearanceConfig,
}

impl ThemeSwitcher {
    pub fn new(appearance: AppearanceConfig) -> Self {
        Self { appearance }
    }

    pub fn set_appearance(&mut self, appearance: AppearanceConfig) {
        self.appearance = appearance;
    }

    /// Applies the pair configured for `new`.  The preferences file is only
    /// rewritten when one of its entries actually differs.
    ///
    /// Returns whether the file was written.
    pub fn apply(&self, new: SystemScheme, old: Option<SystemScheme>) -> Result<bool> {
        if old != Some(new) {
            info!(
                previous = %old.map_or("unknown", SystemScheme::as_str),
                %new,
                "Color scheme change detected"
            );
        }

        let Some(path) = self.appearance.preferences.as_deref() else {
            debug!("No preferences file configured; nothing to switch");
            return Ok(false);
        };

        let pair = self.appearance.for_scheme(new);
        let mut prefs = read_preferences(path)?;
        let mut changed = false;
        for (key, wanted) in [
            (THEME_KEY, pair.theme.as_deref()),
            (COLOR_SCHEME_KEY, pair.color_scheme.as_deref()),
        ] {
            let Some(wanted) = wanted else { continue };
            if prefs.get(key).and_then(Value::as_str) != Some(wanted) {
                prefs.insert(key.to_string(), Value::String(wanted.to_string()));
                changed = true;
            }
        }

        if changed {
            write_preferences(path, &prefs)?;
            info!(path = %path.display(), "Applied {new} appearance");
        }
        Ok(changed)
    }
}

fn read_preferences(path: &Path) -> Result<Map<String, Value>> {
    if !path.exists() {
        return Ok(Map::new());
    }
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read preferences: {}", path.display()))?;
    if content.trim().is_empty() {
        return Ok(Map::new());
    }
    match serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse preferences: {}", path.display()))?
    {
        Value::Object(map) => Ok(map),
        _ => bail!("Preferences file {} is not a JSON object", path.display()),
    }
}

fn write_preferences(path: &Path, prefs: &Map<String, Value>) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let content = serde_json::to_string_pretty(prefs).context("Failed to serialize preferences")?;
    std::fs::write(path, content + "\n")
        .with_context(|| format!("Failed to write preferences: {}", path.display()))
}
