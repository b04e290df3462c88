// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon lifecycle management: configuration, startup, shutdown.

use std::fs::File;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use packrat_storage::{Store, StoreError};
use serde::Deserialize;
use thiserror::Error;
use tokio::net::UnixListener;
use tracing::{info, warn};

/// Default bound on concurrently running backup workers.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Root state directory (e.g. ~/.local/state/packrat)
    pub state_dir: PathBuf,
    /// Path to the control socket
    pub socket_path: PathBuf,
    /// Path to lock/PID file
    pub lock_path: PathBuf,
    /// Path to daemon log file
    pub log_path: PathBuf,
    /// Path to the catalog/history store
    pub store_path: PathBuf,
    /// Directory artifacts are written to
    pub backup_dir: PathBuf,
    /// Bound on concurrently running backup workers
    pub max_workers: usize,
}

/// Optional settings read from `config.toml` in the state directory.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    backup_dir: Option<PathBuf>,
    max_workers: Option<usize>,
}

impl Config {
    /// Load configuration for the daemon.
    ///
    /// Uses fixed paths under the state directory (see [`crate::env::state_dir`]);
    /// `config.toml` there may override the backup directory and worker bound.
    pub fn load() -> Result<Self, LifecycleError> {
        let state_dir = crate::env::state_dir()?;
        Self::load_from(state_dir)
    }

    /// Load configuration rooted at an explicit state directory.
    pub fn load_from(state_dir: PathBuf) -> Result<Self, LifecycleError> {
        let file = read_config_file(&state_dir.join("config.toml"))?;

        Ok(Self {
            socket_path: state_dir.join("control.sock"),
            lock_path: state_dir.join("packratd.pid"),
            log_path: state_dir.join("packratd.log"),
            store_path: state_dir.join("store.json"),
            backup_dir: file
                .backup_dir
                .unwrap_or_else(|| state_dir.join("backups")),
            max_workers: file.max_workers.unwrap_or(DEFAULT_MAX_WORKERS),
            state_dir,
        })
    }
}

fn read_config_file(path: &Path) -> Result<ConfigFile, LifecycleError> {
    if !path.exists() {
        return Ok(ConfigFile::default());
    }
    let text = std::fs::read_to_string(path)?;
    Ok(toml::from_str(&text)?)
}

/// Lifecycle errors
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("Could not determine state directory")]
    NoStateDir,

    #[error("Failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("Failed to bind socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error("Invalid config file: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of daemon startup.
///
/// The listener socket is returned separately so it can be spawned as the
/// listener task; the lock file must be kept alive for the daemon's
/// lifetime.
pub struct StartupResult {
    /// The opened catalog/history store
    pub store: Store,
    /// The bound control socket
    pub listener: UnixListener,
    /// Owns the exclusive PID-file lock; keep it for the daemon's
    /// lifetime, dropping it releases the instance lock.
    pub lock_file: File,
}

/// Start the daemon: acquire the instance lock, open the store, bind the
/// control socket.
pub fn startup(config: &Config) -> Result<StartupResult, LifecycleError> {
    match startup_inner(config) {
        Ok(result) => Ok(result),
        Err(e) => {
            // On LockFailed the socket and PID file belong to the daemon
            // that beat us; every other failure is ours to clean up.
            if !matches!(e, LifecycleError::LockFailed(_)) {
                cleanup_on_failure(config);
            }
            Err(e)
        }
    }
}

fn startup_inner(config: &Config) -> Result<StartupResult, LifecycleError> {
    std::fs::create_dir_all(&config.state_dir)?;
    std::fs::create_dir_all(&config.backup_dir)?;

    // One daemon per state directory. The PID file doubles as the
    // instance lock: open it without truncating (a losing contender must
    // not wipe the winner's recorded PID), then take the flock.
    let mut lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&config.lock_path)?;
    lock_file
        .try_lock_exclusive()
        .map_err(LifecycleError::LockFailed)?;

    // Holding the lock now; record our PID over whatever was there.
    lock_file.set_len(0)?;
    {
        use std::io::Write;
        writeln!(lock_file, "{}", std::process::id())?;
    }

    let store = Store::open(&config.store_path)?;
    info!(
        "Opened store: {} nodes, {} tasks",
        store.node_names().len(),
        store.all_tasks().len()
    );

    // Bind the control socket once the lock and store are in hand. A
    // socket file left behind by a dead daemon would make the bind fail,
    // so it is removed first; the flock proves nobody is serving it.
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    let listener = UnixListener::bind(&config.socket_path)
        .map_err(|e| LifecycleError::BindFailed(config.socket_path.clone(), e))?;

    info!("Daemon started");

    Ok(StartupResult {
        store,
        listener,
        lock_file,
    })
}

/// Shutdown cleanup: remove the socket and PID files.
///
/// The lock itself is released when the startup result's lock file drops.
pub fn shutdown(config: &Config) {
    info!("Shutting down daemon...");

    if config.socket_path.exists() {
        if let Err(e) = std::fs::remove_file(&config.socket_path) {
            warn!("Failed to remove socket file: {}", e);
        }
    }
    if config.lock_path.exists() {
        if let Err(e) = std::fs::remove_file(&config.lock_path) {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    info!("Daemon shutdown complete");
}

/// Clean up resources on startup failure
fn cleanup_on_failure(config: &Config) {
    if config.socket_path.exists() {
        let _ = std::fs::remove_file(&config.socket_path);
    }
    if config.lock_path.exists() {
        let _ = std::fs::remove_file(&config.lock_path);
    }
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
