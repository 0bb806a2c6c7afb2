/// Appearance values exchanged with the desktop settings portal.
///
/// The portal reports `org.freedesktop.appearance color-scheme` as a small
/// integer (1 = prefer dark, 2 = prefer light).  `busctl --json=short` wraps
/// that integer in a variant, so both the one-shot `ReadOne` reply and each
/// `SettingChanged` signal record carry it at a fixed JSON pointer.
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// JSON pointer to the scheme code inside a `ReadOne` reply.
pub const CALL_SCHEME_POINTER: &str = "/data/0/data";
/// JSON pointer to the scheme code inside a `SettingChanged` monitor record.
pub const SIGNAL_SCHEME_POINTER: &str = "/payload/data/2/data";

/// User-facing appearance preference.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Dark,
    Light,
    /// Follow whatever the desktop reports.
    #[default]
    System,
}

impl Mode {
    /// The scheme a forced mode pins, or `None` for [`Mode::System`].
    pub fn forced(self) -> Option<SystemScheme> {
        match self {
            Mode::Dark => Some(SystemScheme::Dark),
            Mode::Light => Some(SystemScheme::Light),
            Mode::System => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Dark => "dark",
            Mode::Light => "light",
            Mode::System => "system",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Appearance reported by the desktop environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemScheme {
    Dark,
    Light,
}

impl SystemScheme {
    /// Maps a portal `color-scheme` code.  Anything but 1 or 2 is a protocol
    /// violation; "no preference" (0) is deliberately not mapped to a default.
    pub fn from_code(code: u64) -> Result<Self, SchemeError> {
        match code {
            1 => Ok(SystemScheme::Dark),
            2 => Ok(SystemScheme::Light),
            other => Err(SchemeError::UnknownCode(other)),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SystemScheme::Dark => "dark",
            SystemScheme::Light => "light",
        }
    }
}

impl fmt::Display for SystemScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A `busctl` record that does not describe a color scheme.
#[derive(Debug, Error)]
pub enum SchemeError {
    #[error("malformed JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("no integer scheme code at {0}")]
    MissingCode(&'static str),

    #[error("unknown color-scheme code {0}")]
    UnknownCode(u64),
}

/// Parses the output of `busctl call ... ReadOne ss org.freedesktop.appearance color-scheme`.
pub fn parse_call_output(output: &str) -> Result<SystemScheme, SchemeError> {
    parse_at(output, CALL_SCHEME_POINTER)
}

/// Parses one line emitted by `busctl monitor` for a `SettingChanged` signal.
pub fn parse_monitor_record(line: &str) -> Result<SystemScheme, SchemeError> {
    parse_at(line, SIGNAL_SCHEME_POINTER)
}

fn parse_at(raw: &str, pointer: &'static str) -> Result<SystemScheme, SchemeError> {
    let value: Value = serde_json::from_str(raw.trim())?;
    let code = value
        .pointer(pointer)
        .and_then(Value::as_u64)
        .ok_or(SchemeError::MissingCode(pointer))?;
    SystemScheme::from_code(code)
}
