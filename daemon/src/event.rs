use tokio::sync::mpsc;

use crate::config::Config;
use crate::monitor::ModeApplier;
use crate::scheme::SystemScheme;

pub enum DaemonEvent {
    /// The config file changed on disk and was successfully re-parsed.
    ConfigReloaded(Config),
    /// The desktop reported a new color scheme.
    SchemeChanged {
        new: SystemScheme,
        old: Option<SystemScheme>,
    },
    /// The subscriber subprocess died; preference tracking is paused.
    SubscriberExited(u32),
    /// Ctrl+C or SIGTERM received; the daemon should stop the monitor and exit.
    Shutdown,
}

/// Forwards monitor callbacks to the event loop.
///
/// The channel is unbounded so the monitor thread never waits on the loop,
/// which may itself be waiting for that thread to exit.
pub struct ChannelApplier {
    tx: mpsc::UnboundedSender<DaemonEvent>,
}

impl ChannelApplier {
    pub fn new(tx: mpsc::UnboundedSender<DaemonEvent>) -> Self {
        Self { tx }
    }
}

impl ModeApplier for ChannelApplier {
    fn apply(&self, new: SystemScheme, old: Option<SystemScheme>) {
        let _ = self.tx.send(DaemonEvent::SchemeChanged { new, old });
    }

    fn stream_closed(&self, pid: u32) {
        let _ = self.tx.send(DaemonEvent::SubscriberExited(pid));
    }
}
