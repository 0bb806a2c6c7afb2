/// `busctl monitor` subprocess delivering color-scheme change records.
///
/// The subprocess writes one JSON record per line.  Its stdout is switched to
/// non-blocking mode so the monitor thread can poll it between checks of its
/// cancellation flag instead of parking in `read(2)`.
use std::io::{self, Read};
use std::os::fd::AsRawFd;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};

use nix::fcntl::{fcntl, FcntlArg, OFlag};

use crate::theme_query::{
    APPEARANCE_NAMESPACE, COLOR_SCHEME_KEY, PORTAL_OBJECT_PATH, SETTINGS_INTERFACE,
};

const READ_CHUNK: usize = 4096;

/// Program and arguments of the subscriber subprocess.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl SubscriberCommand {
    /// `busctl monitor` filtered down to `SettingChanged` for `color-scheme`.
    pub fn busctl(busctl: impl Into<PathBuf>) -> Self {
        let rule = [
            "type='signal'".to_string(),
            format!("interface='{SETTINGS_INTERFACE}'"),
            format!("path='{PORTAL_OBJECT_PATH}'"),
            "member='SettingChanged'".to_string(),
            format!("arg0='{APPEARANCE_NAMESPACE}'"),
            format!("arg1='{COLOR_SCHEME_KEY}'"),
        ]
        .join(",");

        Self {
            program: busctl.into(),
            args: vec![
                "--user".into(),
                "--json=short".into(),
                "--match".into(),
                rule,
                "monitor".into(),
            ],
        }
    }
}

/// Splits a byte stream into lines, remembering only the newest complete one.
#[derive(Debug, Default)]
pub struct LineCoalescer {
    pending: Vec<u8>,
}

impl LineCoalescer {
    /// Appends `bytes` and returns the last complete, non-blank line they
    /// finished, discarding any earlier lines of the same burst.
    pub fn push(&mut self, bytes: &[u8]) -> Option<String> {
        self.pending.extend_from_slice(bytes);
        let end = self.pending.iter().rposition(|&b| b == b'\n')?;

        let complete: Vec<u8> = self.pending.drain(..=end).collect();
        complete
            .split(|&b| b == b'\n')
            .map(|line| String::from_utf8_lossy(line).trim().to_string())
            .filter(|line| !line.is_empty())
            .next_back()
    }

    /// Bytes of an unfinished trailing line.
    #[cfg(test)]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// A running subscriber subprocess.
pub struct ChangeStream {
    child: Child,
    stdout: ChildStdout,
    lines: LineCoalescer,
    eof: bool,
}

impl ChangeStream {
    /// Spawns `command` with a piped, non-blocking stdout.
    pub fn spawn(command: &SubscriberCommand) -> io::Result<Self> {
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        let stdout = match child.stdout.take() {
            Some(out) => out,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::other("subscriber stdout was not captured"));
            }
        };

        if let Err(e) = set_nonblocking(&stdout) {
            let _ = child.kill();
            let _ = child.wait();
            return Err(e);
        }

        Ok(Self {
            child,
            stdout,
            lines: LineCoalescer::default(),
            eof: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Drains everything currently readable and returns the newest complete
    /// record, or `None` when nothing new has arrived.
    pub fn read_latest(&mut self) -> io::Result<Option<String>> {
        let mut latest = None;
        let mut buf = [0u8; READ_CHUNK];

        while !self.eof {
            match self.stdout.read(&mut buf) {
                Ok(0) => self.eof = true,
                Ok(n) => {
                    if let Some(line) = self.lines.push(&buf[..n]) {
                        latest = Some(line);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(latest)
    }

    /// Exit status if the subprocess has already terminated.
    pub fn try_exited(&mut self) -> io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Kills the subprocess and reaps it.
    pub fn kill(&mut self) -> io::Result<ExitStatus> {
        match self.child.kill() {
            Ok(()) => {}
            // Already exited; wait() below still reaps it.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => {}
            Err(e) => return Err(e),
        }
        self.child.wait()
    }
}

fn set_nonblocking(stdout: &ChildStdout) -> io::Result<()> {
    let fd = stdout.as_raw_fd();
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}
