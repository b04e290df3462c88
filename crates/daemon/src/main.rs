// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! packrat daemon (packratd)
//!
//! Background process that owns the backup scheduler loop.
//!
//! Architecture:
//! - Listener Task: Spawned task handling control-socket I/O, forwards
//!   requests into the command channel
//! - Scheduler Loop: Main task serializing commands, worker reaping,
//!   dispatch, and artifact GC

use packrat_core::SystemClock;
use packrat_daemon::lifecycle::{self, Config, LifecycleError};
use packrat_daemon::listener::Listener;
use packrat_daemon::{env, Scheduler, SchedulerConfig, SECONDS_TO_WAIT_CLIENT};
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing::{error, info};

/// Capacity of the listener → scheduler command channel.
const COMMAND_CHANNEL_CAPACITY: usize = 64;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // --help/--version short-circuit everything else. There are no other
    // flags: runtime configuration comes from the state directory and
    // the environment.
    if let Some(flag) = std::env::args().nth(1) {
        match flag.as_str() {
            "--version" | "-V" | "-v" => {
                println!("packratd {}", env!("CARGO_PKG_VERSION"));
                return Ok(());
            }
            "--help" | "-h" | "help" => {
                print_help();
                return Ok(());
            }
            other => {
                eprintln!("error: unexpected argument '{other}'");
                eprintln!("Usage: packratd [--help | --version]");
                std::process::exit(1);
            }
        }
    }

    let config = Config::load()?;

    archive_large_log(&config.log_path);
    let log_guard = init_logging(&config)?;

    info!("Starting backup scheduler daemon");

    let startup = match lifecycle::startup(&config) {
        Ok(result) => result,
        Err(LifecycleError::LockFailed(_)) => {
            // Benign: a second copy was launched. Report who owns the
            // state directory instead of dumping the raw lock error.
            eprintln!("packratd is already running");
            if let Ok(pid) = std::fs::read_to_string(&config.lock_path) {
                let pid = pid.trim();
                if !pid.is_empty() {
                    eprintln!("  pid: {pid}");
                }
            }
            std::process::exit(1);
        }
        Err(e) => {
            error!("Failed to start daemon: {}", e);
            drop(log_guard);
            return Err(e.into());
        }
    };

    // Spawn listener task feeding the scheduler's command channel
    let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
    tokio::spawn(Listener::new(startup.listener, command_tx).run());

    let mut scheduler = Scheduler::new(
        SchedulerConfig {
            backup_dir: config.backup_dir.clone(),
            max_workers: config.max_workers,
        },
        startup.store,
        command_rx,
        SystemClock,
    );

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    info!(
        "Daemon ready, listening on {}",
        config.socket_path.display()
    );

    // Supervisors (and any CLI that forked us) wait for this line before
    // talking to the socket.
    println!("READY");

    let poll = env::poll_wait_ms().unwrap_or(SECONDS_TO_WAIT_CLIENT);

    let result: Result<(), Box<dyn std::error::Error>> = tokio::select! {
        // The scheduler returns only on a fatal error, with its workers
        // already aborted.
        err = scheduler.run(poll) => {
            error!("Scheduler aborted: {}", err);
            Err(err.into())
        }

        // Graceful shutdown on SIGTERM
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
            Ok(())
        }

        // Graceful shutdown on SIGINT
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
            Ok(())
        }
    };

    scheduler.terminate_workers();
    lifecycle::shutdown(&config);
    info!("Daemon stopped");
    drop(log_guard);
    result
}

fn print_help() {
    println!("packratd {}", env!("CARGO_PKG_VERSION"));
    println!("packrat daemon - centralized backup scheduler");
    println!();
    println!("USAGE:");
    println!("    packratd");
    println!();
    println!("The daemon listens on a Unix socket for control commands");
    println!("(add/remove nodes and tasks, query history) and pulls");
    println!("backups from node agents on the configured cadence.");
    println!();
    println!("OPTIONS:");
    println!("    -h, --help       Print help information");
    println!("    -v, --version    Print version information");
}

/// Log size past which startup moves the file aside.
const LOG_ARCHIVE_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Move an oversized log to `<name>.old`, replacing any earlier archive.
///
/// Best-effort: a log that cannot be archived must not stop the daemon.
fn archive_large_log(log_path: &std::path::Path) {
    let oversized = std::fs::metadata(log_path)
        .map(|meta| meta.len() > LOG_ARCHIVE_THRESHOLD)
        .unwrap_or(false);
    if !oversized {
        return;
    }

    let mut archive = log_path.as_os_str().to_os_string();
    archive.push(".old");
    let _ = std::fs::rename(log_path, archive);
}

/// File logging through a non-blocking appender. The returned guard
/// flushes buffered lines when dropped; keep it alive until exit.
fn init_logging(
    config: &Config,
) -> Result<tracing_appender::non_blocking::WorkerGuard, LifecycleError> {
    use tracing_subscriber::filter::LevelFilter;
    use tracing_subscriber::EnvFilter;

    let log_dir = config.log_path.parent().ok_or(LifecycleError::NoStateDir)?;
    let log_name = config
        .log_path
        .file_name()
        .ok_or(LifecycleError::NoStateDir)?;
    std::fs::create_dir_all(log_dir)?;

    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::never(log_dir, log_name));

    // RUST_LOG wins when set; info otherwise.
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    Ok(guard)
}
