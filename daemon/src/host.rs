/// Host-side reactions to mode changes and monitor events.
///
/// All methods run on the daemon's event loop.  `set_mode` and `shutdown`
/// block on the monitor, so the loop calls them through `block_in_place`.
use std::path::PathBuf;

use tracing::{debug, error, info, warn};

use crate::config::AppearanceConfig;
use crate::monitor::{Monitor, MonitorState};
use crate::scheme::{Mode, SystemScheme};
use crate::status::{self, DaemonStatus};
use crate::theme_switch::ThemeSwitcher;

pub struct Host {
    monitor: Monitor,
    switcher: ThemeSwitcher,
    status: DaemonStatus,
    status_path: PathBuf,
    /// Scheme most recently applied.
    scheme: Option<SystemScheme>,
}

impl Host {
    pub fn new(monitor: Monitor, switcher: ThemeSwitcher, mode: Mode, status_path: PathBuf) -> Self {
        let status = DaemonStatus::new(mode);
        status::write_status(&status_path, &status);
        Self {
            monitor,
            switcher,
            status,
            status_path,
            scheme: None,
        }
    }

    #[cfg(test)]
    pub fn status(&self) -> &DaemonStatus {
        &self.status
    }

    /// Reacts to a change of the configured mode.  Safe to call with the
    /// mode that is already active: the subscription is simply restarted.
    pub fn set_mode(&mut self, new: Mode, old: Option<Mode>) {
        match old {
            Some(old) => info!("Mode changed from '{old}' to '{new}'"),
            None => info!("Initial mode is '{new}'"),
        }
        self.status.mode = new;
        self.monitor.stop();
        self.sync_monitor_status();

        match new.forced() {
            Some(scheme) => self.apply(scheme, self.scheme),
            None => match self.monitor.start() {
                Ok(started) => {
                    self.sync_monitor_status();
                    self.status.subscriber_pid = Some(started.pid);
                    if let Some(e) = started.pid_record_error {
                        warn!(pid = started.pid, "Subscriber is running without a pid record");
                        self.status.error = Some(e);
                    }
                    if let Some(scheme) = started.scheme {
                        self.apply(scheme, self.scheme);
                    }
                }
                Err(e) => {
                    error!("Could not start color scheme monitor: {e}");
                    self.status.error = Some(e.to_string());
                }
            },
        }
        self.flush_status();
    }

    /// The monitor observed a new desktop scheme.
    pub fn scheme_changed(&mut self, new: SystemScheme, old: Option<SystemScheme>) {
        if self.status.mode != Mode::System {
            // A record that raced a switch to a forced mode.
            return;
        }
        self.apply(new, old);
        self.flush_status();
    }

    /// The subscriber died on its own; tracking stays paused until the mode is
    /// set again.
    ///
    /// Exits of a subscriber that has since been replaced or stopped are
    /// ignored.
    pub fn subscriber_exited(&mut self, pid: u32) {
        if self.status.subscriber_pid != Some(pid) {
            debug!(pid, current = ?self.status.subscriber_pid, "Ignoring exit of a stale subscriber");
            return;
        }
        warn!(pid, "Color scheme tracking paused");
        self.status.monitor = MonitorState::Stopped;
        self.status.subscriber_pid = None;
        self.status.error = Some(format!("subscriber {pid} exited unexpectedly"));
        self.flush_status();
    }

    pub fn set_appearance(&mut self, appearance: AppearanceConfig) {
        self.switcher.set_appearance(appearance);
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down");
        self.monitor.stop();
        self.sync_monitor_status();
        self.flush_status();
    }

    fn apply(&mut self, new: SystemScheme, old: Option<SystemScheme>) {
        match self.switcher.apply(new, old) {
            Ok(_) => {
                self.scheme = Some(new);
                self.status.record_change(new);
            }
            Err(e) => {
                warn!("Failed to apply {new} appearance: {e:#}");
                self.status.error = Some(format!("{e:#}"));
            }
        }
    }

    fn sync_monitor_status(&mut self) {
        self.status.monitor = self.monitor.state();
        self.status.subscriber_pid = self.monitor.subscriber_pid();
    }

    fn flush_status(&self) {
        status::write_status(&self.status_path, &self.status);
    }
}
