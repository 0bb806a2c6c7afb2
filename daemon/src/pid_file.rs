/// On-disk record of the running subscriber subprocess.
///
/// The record is the only thing that survives a crashed or killed daemon, so
/// every start first terminates whatever process it names before a new
/// subscriber is spawned.  No lock is taken: the file is validated by process
/// liveness rather than trusted.
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sysinfo::{Pid, ProcessesToUpdate, Signal, System};
use tracing::{debug, info, warn};

/// Why recovery found nothing to terminate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Noop {
    /// No record on disk.
    Absent,
    /// The record does not hold a decimal pid.
    Invalid(String),
    /// The recorded pid does not name a live process.
    NotRunning(u32),
}

impl fmt::Display for Noop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Noop::Absent => f.write_str("no pid record"),
            Noop::Invalid(content) => write!(f, "pid record holds {content:?}"),
            Noop::NotRunning(pid) => write!(f, "pid {pid} is not running"),
        }
    }
}

/// Outcome of [`PidFile::recover`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recovery {
    Noop(Noop),
    /// A live predecessor was sent SIGTERM.
    Terminated(u32),
}

#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the recorded pid.  `Ok(None)` when the file does not exist.
    pub fn read(&self) -> Result<Option<u32>, Noop> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Noop::Invalid(e.to_string())),
        };
        content
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| Noop::Invalid(content.trim().to_string()))
    }

    /// Overwrites the record with `pid`, creating the parent directory.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, pid.to_string())
            .with_context(|| format!("Failed to write pid file {}", self.path.display()))
    }

    /// Removes the record, but only while it still names `pid`.
    ///
    /// Returns whether the file was removed.
    pub fn clear_if(&self, pid: u32) -> Result<bool> {
        match self.read() {
            Ok(Some(recorded)) if recorded == pid => {
                fs::remove_file(&self.path).with_context(|| {
                    format!("Failed to remove pid file {}", self.path.display())
                })?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Terminates the subscriber left behind by a previous daemon, if any.
    ///
    /// Missing, unparsable and dead records are all the same outcome: nothing
    /// conflicts with a new spawn.
    pub fn recover(&self) -> Recovery {
        let pid = match self.read() {
            Ok(Some(pid)) => pid,
            Ok(None) => return noop(Noop::Absent),
            Err(reason) => return noop(reason),
        };

        if terminate(pid) {
            info!(pid, "Terminated stale subscriber");
            Recovery::Terminated(pid)
        } else {
            noop(Noop::NotRunning(pid))
        }
    }
}

fn noop(reason: Noop) -> Recovery {
    debug!("Singleton recovery: {reason}");
    Recovery::Noop(reason)
}

/// Sends SIGTERM to `pid`.  Returns `false` when no such process exists.
fn terminate(pid: u32) -> bool {
    // Pid 0 would address our own process group.
    if pid == 0 {
        return false;
    }
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);

    let Some(process) = sys.process(pid) else {
        return false;
    };
    match process.kill_with(Signal::Term) {
        Some(sent) => sent,
        None => {
            warn!(pid = pid.as_u32(), "SIGTERM unsupported on this platform");
            false
        }
    }
}
