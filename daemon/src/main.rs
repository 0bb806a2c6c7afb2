mod change_stream;
mod config;
mod event;
mod host;
mod logging;
mod monitor;
mod paths;
mod pid_file;
mod scheme;
mod settings_watcher;
mod status;
mod theme_query;
mod theme_switch;

use std::sync::{Arc, OnceLock};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::change_stream::SubscriberCommand;
use crate::event::{ChannelApplier, DaemonEvent};
use crate::host::Host;
use crate::logging::LogHandle;
use crate::monitor::{Monitor, MonitorConfig};
use crate::pid_file::PidFile;
use crate::scheme::Mode;
use crate::settings_watcher::{SettingsStore, SettingsWatcher};
use crate::theme_query::BusctlQuery;
use crate::theme_switch::ThemeSwitcher;

#[derive(Parser)]
#[command(version, about = "Follows the desktop's dark/light preference")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon (default).
    Run,
    /// Store a new appearance mode in the config file.
    Set { mode: Mode },
    /// Exit successfully if `mode` is the configured mode.
    IsCurrent { mode: Mode },
    /// Print the status last written by the daemon.
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse().command.unwrap_or(Command::Run) {
        Command::Run => run().await,
        Command::Set { mode } => {
            config::save_mode(&paths::config_file_path()?, mode)?;
            println!("Mode set to '{mode}'");
            Ok(())
        }
        Command::IsCurrent { mode } => {
            let config = config::load_or_default(&paths::config_file_path()?)?;
            let current = config.mode == mode;
            println!("{current}");
            if !current {
                std::process::exit(1);
            }
            Ok(())
        }
        Command::Status => {
            let status = status::read_status(&paths::status_file_path()?)?;
            print!("{}", toml::to_string_pretty(&status)?);
            Ok(())
        }
    }
}

async fn run() -> Result<()> {
    if !cfg!(target_os = "linux") {
        bail!("autodark only works on Linux");
    }

    // ── Configuration ─────────────────────────────────────────────────────────
    let config_path = paths::config_file_path()?;
    let initial_config = config::load_or_default(&config_path).unwrap_or_else(|e| {
        eprintln!("[config] Error (using defaults): {e:#}");
        config::Config::default()
    });
    let log = logging::init(initial_config.debug)?;

    if !initial_config.busctl.is_file() {
        bail!(
            "autodark requires systemd's busctl; {} does not exist",
            initial_config.busctl.display()
        );
    }

    // ── Settings watchers ─────────────────────────────────────────────────────
    // Declared before the store exists; they bind on their first poll.
    let settings_slot: Arc<OnceLock<SettingsStore>> = Arc::new(OnceLock::new());
    let mut mode_watcher: SettingsWatcher<Mode> = SettingsWatcher::new("mode", {
        let slot = Arc::clone(&settings_slot);
        move || slot.get().cloned()
    });
    let mut debug_watcher: SettingsWatcher<bool> = SettingsWatcher::new("debug", {
        let slot = Arc::clone(&settings_slot);
        move || slot.get().cloned()
    });

    let store = SettingsStore::new(initial_config.to_table()?);
    let _ = settings_slot.set(store.clone());

    // ── Monitor ───────────────────────────────────────────────────────────────
    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<DaemonEvent>();
    let monitor = Monitor::new(
        MonitorConfig {
            subscriber: SubscriberCommand::busctl(&initial_config.busctl),
            pid_file: PidFile::new(paths::pid_file_path()?),
            poll_interval: initial_config.poll_interval(),
        },
        Arc::new(BusctlQuery::new(
            &initial_config.busctl,
            initial_config.query_timeout_secs,
        )),
        Arc::new(ChannelApplier::new(event_tx.clone())),
    );
    let mut host = Host::new(
        monitor,
        ThemeSwitcher::new(initial_config.appearance.clone()),
        initial_config.mode,
        paths::status_file_path()?,
    );

    // ── Background tasks ──────────────────────────────────────────────────────
    tokio::spawn(config::watch_config(config_path, event_tx.clone()));

    {
        let tx = event_tx.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            let _ = tx.send(DaemonEvent::Shutdown);
        });
    }

    info!("autodark-daemon v{} started", env!("CARGO_PKG_VERSION"));
    poll_settings(&mut host, &mut mode_watcher, &mut debug_watcher, &log);

    // ── Event loop ────────────────────────────────────────────────────────────
    while let Some(evt) = event_rx.recv().await {
        match evt {
            DaemonEvent::ConfigReloaded(new_config) => {
                info!("Config reloaded");
                if new_config.busctl != initial_config.busctl
                    || new_config.poll_interval_ms != initial_config.poll_interval_ms
                    || new_config.query_timeout_secs != initial_config.query_timeout_secs
                {
                    warn!("busctl and timing settings take effect after a restart");
                }
                match new_config.to_table() {
                    Ok(table) => store.replace(table),
                    Err(e) => {
                        warn!("{e:#}");
                        continue;
                    }
                }
                host.set_appearance(new_config.appearance);
                poll_settings(&mut host, &mut mode_watcher, &mut debug_watcher, &log);
            }

            DaemonEvent::SchemeChanged { new, old } => host.scheme_changed(new, old),

            DaemonEvent::SubscriberExited(pid) => host.subscriber_exited(pid),

            DaemonEvent::Shutdown => {
                tokio::task::block_in_place(|| host.shutdown());
                break;
            }
        }
    }

    Ok(())
}

/// Fires the watchers whose value changed since the last poll.
fn poll_settings(
    host: &mut Host,
    mode_watcher: &mut SettingsWatcher<Mode>,
    debug_watcher: &mut SettingsWatcher<bool>,
    log: &LogHandle,
) {
    debug_watcher.poll(|debug, _| {
        if let Err(e) = log.set_debug(*debug) {
            warn!("{e:#}");
        }
    });
    mode_watcher.poll(|new, old| {
        tokio::task::block_in_place(|| host.set_mode(*new, old.copied()));
    });
}

/// Resolves on Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
