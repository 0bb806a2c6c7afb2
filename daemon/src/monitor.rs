/// Supervisor for the color-scheme subscription.
///
/// A [`Monitor`] owns at most one worker thread.  The worker reaps any
/// subscriber left behind by a previous daemon, seeds the current scheme,
/// spawns a fresh [`ChangeStream`] and then polls it until it is told to stop
/// or the subprocess dies.
///
/// ```text
/// Stopped ──start()──▶ Starting ──spawned──▶ Running
///    ▲                    │                     │
///    └──── spawn failed ──┘                  stop() / subscriber exit
///    └──────────────────────── Stopping ◀───────┘
/// ```
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::change_stream::{ChangeStream, SubscriberCommand};
use crate::pid_file::PidFile;
use crate::scheme::{self, SystemScheme};
use crate::theme_query::ThemeQuery;

const WORKER_THREAD_NAME: &str = "autodark-monitor";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for MonitorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MonitorState::Stopped => "stopped",
            MonitorState::Starting => "starting",
            MonitorState::Running => "running",
            MonitorState::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Receives scheme changes observed by the monitor.
///
/// Called from the monitor's worker thread; implementations should hand the
/// work off rather than block.
pub trait ModeApplier: Send + Sync {
    fn apply(&self, new: SystemScheme, old: Option<SystemScheme>);

    /// The subscriber subprocess exited without being asked to.
    fn stream_closed(&self, _pid: u32) {}
}

#[derive(Debug, Error)]
pub enum MonitorError {
    #[error("monitor cannot start while {0}")]
    InvalidState(MonitorState),

    #[error("failed to spawn subscriber: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to spawn monitor thread: {0}")]
    Thread(#[source] std::io::Error),

    #[error("monitor thread exited before reporting")]
    WorkerLost,
}

/// Successful [`Monitor::start`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Started {
    /// Pid of the new subscriber, as written to the pid file.
    pub pid: u32,
    /// Scheme reported by the one-shot query, if the service answered.
    pub scheme: Option<SystemScheme>,
    /// Set when the pid file could not be written.  The subscriber runs, but
    /// a later daemon will not be able to reap it.
    pub pid_record_error: Option<String>,
}

/// Everything a worker needs besides its cancellation flag.
#[derive(Clone)]
pub struct MonitorConfig {
    pub subscriber: SubscriberCommand,
    pub pid_file: PidFile,
    pub poll_interval: Duration,
}

struct Lifecycle {
    state: MonitorState,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    worker_id: Option<ThreadId>,
    subscriber_pid: Option<u32>,
}

struct Inner {
    config: MonitorConfig,
    query: Arc<dyn ThemeQuery>,
    applier: Arc<dyn ModeApplier>,
    lifecycle: Mutex<Lifecycle>,
    /// Signalled whenever the state returns to Stopped.
    stopped: Condvar,
}

/// Cloneable handle to a single subscription lifecycle.
#[derive(Clone)]
pub struct Monitor {
    inner: Arc<Inner>,
}

impl Monitor {
    pub fn new(
        config: MonitorConfig,
        query: Arc<dyn ThemeQuery>,
        applier: Arc<dyn ModeApplier>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                query,
                applier,
                lifecycle: Mutex::new(Lifecycle {
                    state: MonitorState::Stopped,
                    stop: Arc::new(AtomicBool::new(true)),
                    worker: None,
                    worker_id: None,
                    subscriber_pid: None,
                }),
                stopped: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> MonitorState {
        self.lock().state
    }

    /// Pid of the running subscriber, if any.
    pub fn subscriber_pid(&self) -> Option<u32> {
        self.lock().subscriber_pid
    }

    /// Starts the worker and blocks until the subscriber has been spawned.
    ///
    /// Only valid from [`MonitorState::Stopped`].  Blocks for the duration of
    /// the seeding query, so async callers should go through
    /// `block_in_place`.
    pub fn start(&self) -> Result<Started, MonitorError> {
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<Result<Started, std::io::Error>>(1);
        {
            let mut lifecycle = self.lock();
            if lifecycle.state != MonitorState::Stopped {
                return Err(MonitorError::InvalidState(lifecycle.state));
            }

            let stop = Arc::new(AtomicBool::new(false));
            let worker = Worker {
                monitor: self.clone(),
                stop: Arc::clone(&stop),
            };
            let handle = thread::Builder::new()
                .name(WORKER_THREAD_NAME.into())
                .spawn(move || worker.run(ready_tx))
                .map_err(MonitorError::Thread)?;

            lifecycle.state = MonitorState::Starting;
            lifecycle.stop = stop;
            lifecycle.worker_id = Some(handle.thread().id());
            lifecycle.worker = Some(handle);
        }

        match ready_rx.recv() {
            Ok(Ok(started)) => Ok(started),
            Ok(Err(e)) => {
                self.join_failed_worker();
                Err(MonitorError::Spawn(e))
            }
            Err(_) => {
                self.join_failed_worker();
                Err(MonitorError::WorkerLost)
            }
        }
    }

    /// Stops the subscription.  A no-op when already Stopped.
    ///
    /// From any thread but the worker this waits until the worker has exited.
    /// The worker calls it on itself when the subscriber dies; joining its own
    /// thread would deadlock, so there the thread is left to finish on its own.
    pub fn stop(&self) {
        let current = thread::current().id();
        let mut lifecycle = self.lock();
        let on_worker = lifecycle.worker_id == Some(current);

        match lifecycle.state {
            MonitorState::Stopped => return,
            MonitorState::Stopping => {
                if !on_worker {
                    while lifecycle.state == MonitorState::Stopping {
                        lifecycle = match self.inner.stopped.wait(lifecycle) {
                            Ok(guard) => guard,
                            Err(poisoned) => poisoned.into_inner(),
                        };
                    }
                }
                return;
            }
            MonitorState::Starting | MonitorState::Running => {}
        }

        lifecycle.stop.store(true, Ordering::SeqCst);
        lifecycle.state = MonitorState::Stopping;
        let worker = lifecycle.worker.take();
        drop(lifecycle);

        match worker {
            Some(_) if on_worker => debug!("Stop requested from the monitor thread; not joining"),
            Some(handle) => {
                if handle.join().is_err() {
                    error!("Monitor thread panicked");
                }
            }
            None => {}
        }

        let mut lifecycle = self.lock();
        lifecycle.state = MonitorState::Stopped;
        lifecycle.worker_id = None;
        lifecycle.subscriber_pid = None;
        drop(lifecycle);
        self.inner.stopped.notify_all();
        info!("Monitor stopped");
    }

    fn lock(&self) -> MutexGuard<'_, Lifecycle> {
        match self.inner.lifecycle.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Called by `start` after the worker reported a spawn failure.
    fn join_failed_worker(&self) {
        let handle = self.lock().worker.take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let mut lifecycle = self.lock();
        if lifecycle.state == MonitorState::Starting {
            lifecycle.state = MonitorState::Stopped;
            lifecycle.worker_id = None;
        }
        drop(lifecycle);
        self.inner.stopped.notify_all();
    }

    /// Moves Starting → Running unless a stop arrived in the meantime.
    fn mark_running(&self, stop: &AtomicBool, pid: u32) -> bool {
        let mut lifecycle = self.lock();
        if stop.load(Ordering::SeqCst) || lifecycle.state != MonitorState::Starting {
            return false;
        }
        lifecycle.state = MonitorState::Running;
        lifecycle.subscriber_pid = Some(pid);
        true
    }
}

impl fmt::Debug for Monitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor")
            .field("state", &self.state())
            .field("pid_file", &self.inner.config.pid_file.path())
            .finish()
    }
}

/// Why the poll loop ended.
enum Exit {
    Cancelled,
    SubscriberExited,
}

struct Worker {
    monitor: Monitor,
    stop: Arc<AtomicBool>,
}

impl Worker {
    fn run(self, ready: std_mpsc::SyncSender<Result<Started, std::io::Error>>) {
        let inner = Arc::clone(&self.monitor.inner);
        let config = &inner.config;

        config.pid_file.recover();

        let seed = match inner.query.query() {
            Ok(scheme) => Some(scheme),
            Err(e) => {
                warn!("Could not read current color scheme: {e}");
                None
            }
        };

        let mut stream = match ChangeStream::spawn(&config.subscriber) {
            Ok(stream) => stream,
            Err(e) => {
                error!(
                    program = %config.subscriber.program.display(),
                    "Failed to spawn subscriber: {e}"
                );
                let _ = ready.send(Err(e));
                return;
            }
        };

        let pid = stream.pid();
        let pid_record_error = match config.pid_file.write(pid) {
            Ok(()) => None,
            Err(e) => {
                error!(pid, "{e:#}");
                Some(format!("{e:#}"))
            }
        };
        let started = Started {
            pid,
            scheme: seed,
            pid_record_error,
        };

        if !self.monitor.mark_running(&self.stop, pid) {
            debug!(pid, "Stopped while starting");
            if let Err(e) = stream.kill() {
                warn!(pid, "Failed to kill subscriber: {e}");
            }
            let _ = ready.send(Ok(started));
            return;
        }
        info!(pid, "Subscriber started");
        let _ = ready.send(Ok(started));

        match self.poll(&mut stream, seed) {
            Exit::Cancelled => {
                if let Err(e) = stream.kill() {
                    warn!(pid, "Failed to kill subscriber: {e}");
                }
                debug!(pid, "Subscriber killed");
            }
            Exit::SubscriberExited => {
                match config.pid_file.clear_if(pid) {
                    Ok(true) => debug!(pid, "Cleared pid file"),
                    Ok(false) => {}
                    Err(e) => warn!("{e:#}"),
                }
                inner.applier.stream_closed(pid);
                self.monitor.stop();
            }
        }
    }

    fn poll(&self, stream: &mut ChangeStream, seed: Option<SystemScheme>) -> Exit {
        let inner = &self.monitor.inner;
        let interval = inner.config.poll_interval;
        let mut current = seed;

        loop {
            if self.stop.load(Ordering::SeqCst) {
                return Exit::Cancelled;
            }

            match stream.try_exited() {
                Ok(Some(status)) => {
                    warn!(pid = stream.pid(), "Subscriber exited unexpectedly ({status})");
                    // Output written just before exiting is still in the pipe.
                    match stream.read_latest() {
                        Ok(Some(record)) => self.deliver(&record, &mut current),
                        Ok(None) => {}
                        Err(e) => warn!("Failed to read subscriber output: {e}"),
                    }
                    return Exit::SubscriberExited;
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to check subscriber status: {e}"),
            }

            let record = match stream.read_latest() {
                Ok(Some(record)) => record,
                Ok(None) => {
                    thread::sleep(interval);
                    continue;
                }
                Err(e) => {
                    warn!("Failed to read subscriber output: {e}");
                    thread::sleep(interval);
                    continue;
                }
            };

            self.deliver(&record, &mut current);
        }
    }

    /// Parses one record and hands it to the applier.  Malformed records are
    /// skipped.
    fn deliver(&self, record: &str, current: &mut Option<SystemScheme>) {
        match scheme::parse_monitor_record(record) {
            Ok(new) => {
                debug!(%new, "Color scheme signal received");
                self.monitor.inner.applier.apply(new, *current);
                *current = Some(new);
            }
            Err(e) => warn!("Skipping subscriber record: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::tests::monitor_record;
    use crate::theme_query::QueryError;
    use std::os::unix::process::ExitStatusExt;
    use std::path::PathBuf;
    use std::process::Command;
    use std::time::Instant;

    const TEST_POLL: Duration = Duration::from_millis(50);

    struct FixedQuery(Option<SystemScheme>);

    impl ThemeQuery for FixedQuery {
        fn query(&self) -> Result<SystemScheme, QueryError> {
            self.0
                .ok_or_else(|| QueryError::Unavailable("portal not running".into()))
        }
    }

    #[derive(Default)]
    struct Recorder {
        applied: Mutex<Vec<(SystemScheme, Option<SystemScheme>)>>,
        closed: Mutex<Vec<u32>>,
    }

    impl Recorder {
        fn applied(&self) -> Vec<(SystemScheme, Option<SystemScheme>)> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl ModeApplier for Recorder {
        fn apply(&self, new: SystemScheme, old: Option<SystemScheme>) {
            self.applied.lock().unwrap().push((new, old));
        }

        fn stream_closed(&self, pid: u32) {
            self.closed.lock().unwrap().push(pid);
        }
    }

    struct Fixture {
        dir: tempfile::TempDir,
        recorder: Arc<Recorder>,
        monitor: Monitor,
    }

    impl Fixture {
        fn pid_file(&self) -> PidFile {
            PidFile::new(self.dir.path().join("autodark").join("daemon.pid"))
        }
    }

    /// Monitor whose subscriber is `/bin/sh -c script`.
    fn fixture(script: &str, seed: Option<SystemScheme>) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = MonitorConfig {
            subscriber: SubscriberCommand {
                program: PathBuf::from("/bin/sh"),
                args: vec!["-c".into(), script.into()],
            },
            pid_file: PidFile::new(dir.path().join("autodark").join("daemon.pid")),
            poll_interval: TEST_POLL,
        };
        let monitor = Monitor::new(
            config,
            Arc::new(FixedQuery(seed)),
            Arc::clone(&recorder) as Arc<dyn ModeApplier>,
        );
        Fixture { dir, recorder, monitor }
    }

    /// Shell snippet printing `records` in a single write after a short delay.
    fn emit(records: &[String]) -> String {
        let body: String = records.iter().map(|r| format!("{r}\n")).collect();
        format!("sleep 0.3; printf '%s' '{body}'; sleep 30")
    }

    fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(20));
        }
        cond()
    }

    fn is_alive(pid: u32) -> bool {
        // /proc/<pid>/stat field 3 is the state; Z is a zombie.
        match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    // ── lifecycle ─────────────────────────────────────────────────────────────

    #[test]
    fn new_monitor_is_stopped() {
        let f = fixture("sleep 30", None);
        assert_eq!(f.monitor.state(), MonitorState::Stopped);
        assert_eq!(f.monitor.subscriber_pid(), None);
    }

    #[test]
    fn stop_when_stopped_is_noop() {
        let f = fixture("sleep 30", None);
        f.monitor.stop();
        f.monitor.stop();
        assert_eq!(f.monitor.state(), MonitorState::Stopped);
        assert!(!f.pid_file().path().exists());
    }

    #[test]
    fn start_writes_pid_and_runs() {
        let f = fixture("sleep 30", Some(SystemScheme::Dark));
        let started = f.monitor.start().unwrap();

        assert_eq!(started.scheme, Some(SystemScheme::Dark));
        assert_eq!(f.monitor.state(), MonitorState::Running);
        assert_eq!(f.monitor.subscriber_pid(), Some(started.pid));
        assert_eq!(f.pid_file().read(), Ok(Some(started.pid)));
        assert!(is_alive(started.pid));

        f.monitor.stop();
        assert_eq!(f.monitor.state(), MonitorState::Stopped);
        assert!(!is_alive(started.pid));
    }

    #[test]
    fn start_twice_is_rejected() {
        let f = fixture("sleep 30", None);
        f.monitor.start().unwrap();
        assert!(matches!(
            f.monitor.start(),
            Err(MonitorError::InvalidState(MonitorState::Running))
        ));
        f.monitor.stop();
    }

    #[test]
    fn start_with_unavailable_query_still_spawns() {
        let f = fixture("sleep 30", None);
        let started = f.monitor.start().unwrap();
        assert_eq!(started.scheme, None);
        assert_eq!(f.monitor.state(), MonitorState::Running);
        f.monitor.stop();
    }

    #[test]
    fn spawn_failure_returns_to_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let config = MonitorConfig {
            subscriber: SubscriberCommand {
                program: PathBuf::from("/nonexistent/busctl"),
                args: vec![],
            },
            pid_file: PidFile::new(dir.path().join("daemon.pid")),
            poll_interval: TEST_POLL,
        };
        let monitor = Monitor::new(
            config,
            Arc::new(FixedQuery(Some(SystemScheme::Light))),
            Arc::new(Recorder::default()),
        );

        assert!(matches!(monitor.start(), Err(MonitorError::Spawn(_))));
        assert_eq!(monitor.state(), MonitorState::Stopped);
        assert!(!dir.path().join("daemon.pid").exists());
    }

    #[test]
    fn restart_spawns_a_new_subscriber() {
        let f = fixture("sleep 30", None);
        let first = f.monitor.start().unwrap();
        f.monitor.stop();
        let second = f.monitor.start().unwrap();

        assert_ne!(first.pid, second.pid);
        assert!(!is_alive(first.pid));
        assert!(is_alive(second.pid));
        assert_eq!(f.pid_file().read(), Ok(Some(second.pid)));
        f.monitor.stop();
    }

    #[test]
    fn unwritable_pid_record_is_reported_in_started() {
        let f = fixture("sleep 30", None);
        // A directory where the record should be makes the write fail.
        std::fs::create_dir_all(f.pid_file().path()).unwrap();

        let started = f.monitor.start().unwrap();
        assert!(started.pid_record_error.is_some());
        assert_eq!(f.monitor.state(), MonitorState::Running);
        f.monitor.stop();
    }

    // ── singleton recovery ────────────────────────────────────────────────────

    #[test]
    fn start_terminates_previous_subscriber() {
        let f = fixture("sleep 30", None);
        let mut stale = Command::new("sleep").arg("30").spawn().unwrap();
        f.pid_file().write(stale.id()).unwrap();

        let started = f.monitor.start().unwrap();

        let status = stale.wait().unwrap();
        assert_eq!(status.signal(), Some(15));
        assert_ne!(started.pid, stale.id());
        assert!(is_alive(started.pid));
        assert_eq!(f.pid_file().read(), Ok(Some(started.pid)));
        f.monitor.stop();
    }

    #[test]
    fn start_with_dead_pid_record_proceeds() {
        let f = fixture("sleep 30", None);
        f.pid_file().write(4_000_000_000).unwrap();

        let started = f.monitor.start().unwrap();
        assert_eq!(f.pid_file().read(), Ok(Some(started.pid)));
        f.monitor.stop();
    }

    // ── stream consumption ────────────────────────────────────────────────────

    #[test]
    fn record_is_applied_with_seeded_previous_scheme() {
        let f = fixture(&emit(&[monitor_record(1)]), Some(SystemScheme::Light));
        let started = f.monitor.start().unwrap();
        assert_eq!(f.pid_file().read(), Ok(Some(started.pid)));

        assert!(wait_until(Duration::from_secs(5), || !f.recorder.applied().is_empty()));
        thread::sleep(TEST_POLL * 4);
        assert_eq!(
            f.recorder.applied(),
            vec![(SystemScheme::Dark, Some(SystemScheme::Light))]
        );
        f.monitor.stop();
    }

    #[test]
    fn burst_is_coalesced_to_last_record() {
        let burst = [monitor_record(1), monitor_record(2), monitor_record(1)];
        let f = fixture(&emit(&burst), Some(SystemScheme::Light));
        f.monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || !f.recorder.applied().is_empty()));
        thread::sleep(TEST_POLL * 4);
        assert_eq!(
            f.recorder.applied(),
            vec![(SystemScheme::Dark, Some(SystemScheme::Light))]
        );
        f.monitor.stop();
    }

    #[test]
    fn successive_records_chain_previous_scheme() {
        let script = format!(
            "sleep 0.3; printf '%s\\n' '{}'; sleep 0.5; printf '%s\\n' '{}'; sleep 30",
            monitor_record(2),
            monitor_record(1)
        );
        let f = fixture(&script, None);
        f.monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || f.recorder.applied().len() == 2));
        assert_eq!(
            f.recorder.applied(),
            vec![
                (SystemScheme::Light, None),
                (SystemScheme::Dark, Some(SystemScheme::Light)),
            ]
        );
        f.monitor.stop();
    }

    #[test]
    fn malformed_records_are_skipped() {
        let script = format!(
            "sleep 0.3; echo 'not json'; sleep 0.3; printf '%s\\n' '{}'; sleep 0.3; printf '%s\\n' '{}'; sleep 30",
            monitor_record(9),
            monitor_record(2)
        );
        let f = fixture(&script, Some(SystemScheme::Dark));
        f.monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || !f.recorder.applied().is_empty()));
        assert_eq!(f.monitor.state(), MonitorState::Running);
        assert_eq!(
            f.recorder.applied(),
            vec![(SystemScheme::Light, Some(SystemScheme::Dark))]
        );
        f.monitor.stop();
    }

    // ── subscriber exit ───────────────────────────────────────────────────────

    #[test]
    fn subscriber_exit_stops_monitor_and_clears_record() {
        let f = fixture("sleep 0.3; exit 1", None);
        let started = f.monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            f.monitor.state() == MonitorState::Stopped
        }));
        assert_eq!(*f.recorder.closed.lock().unwrap(), vec![started.pid]);
        assert!(!f.pid_file().path().exists());
        assert_eq!(f.monitor.subscriber_pid(), None);

        // The handle is reusable after a self-stop.
        f.monitor.stop();
        let again = f.monitor.start().unwrap();
        assert_ne!(again.pid, started.pid);
        f.monitor.stop();
    }

    #[test]
    fn final_record_before_exit_is_delivered() {
        let script = format!("sleep 0.3; printf '%s\\n' '{}'; exit 0", monitor_record(1));
        let f = fixture(&script, Some(SystemScheme::Light));
        let started = f.monitor.start().unwrap();

        assert!(wait_until(Duration::from_secs(5), || {
            f.monitor.state() == MonitorState::Stopped
        }));
        assert_eq!(
            f.recorder.applied(),
            vec![(SystemScheme::Dark, Some(SystemScheme::Light))]
        );
        assert_eq!(*f.recorder.closed.lock().unwrap(), vec![started.pid]);
    }

    #[test]
    fn stop_from_another_handle_joins_worker() {
        let f = fixture("sleep 30", None);
        let started = f.monitor.start().unwrap();
        let handle = f.monitor.clone();

        thread::spawn(move || handle.stop()).join().unwrap();
        assert_eq!(f.monitor.state(), MonitorState::Stopped);
        assert!(!is_alive(started.pid));
    }
}
