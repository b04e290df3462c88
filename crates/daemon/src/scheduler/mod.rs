// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The scheduler engine.
//!
//! A single logical loop serializes control-command handling, worker
//! reaping, dispatch, and artifact GC. Backup work runs in detached
//! tasks bounded by `max_workers`; the sentinel-file protocol (see
//! [`crate::worker`]) is the only channel back from a worker, so the
//! loop's reap step is where outcomes become history.
//!
//! The loop's only suspension point is the bounded poll on the command
//! channel; reaping and dispatch are non-blocking.

mod gc;

pub use gc::MAX_FINISHED_TASKS_TO_STORE;

use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use packrat_core::{safe_base64, Clock, FinishedTask, NodeName, ScheduledTask, TaskKey};
use packrat_storage::{Store, StoreError};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::commands::{self, CommandError};
use crate::digest;
use crate::listener::ControlRequest;
use crate::protocol::{Reply, Request};
use crate::worker::{self, WorkerParams};

/// How long the loop waits for a control request before servicing workers.
pub const SECONDS_TO_WAIT_CLIENT: Duration = Duration::from_secs(10);

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory artifacts are written to.
    pub backup_dir: PathBuf,
    /// Bound on concurrently running workers.
    pub max_workers: usize,
}

/// An active worker plus the artifact path it writes.
pub struct RunningTask {
    write_file_path: PathBuf,
    handle: JoinHandle<()>,
}

impl RunningTask {
    fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    fn abort(&self) {
        self.handle.abort();
    }

    pub fn write_file_path(&self) -> &Path {
        &self.write_file_path
    }
}

/// Fatal scheduler errors. Worker and command failures never surface
/// here; these are store/filesystem failures the loop cannot absorb.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The scheduler engine. Owns the store, the materialized schedule, the
/// running-task table, and the pending queue; commands arrive through
/// the mpsc receiver fed by the listener.
pub struct Scheduler<C: Clock> {
    config: SchedulerConfig,
    store: Store,
    clock: C,
    commands: mpsc::Receiver<ControlRequest>,
    schedule: Vec<ScheduledTask>,
    running: HashMap<TaskKey, RunningTask>,
    /// Pending (node, path, last_checksum) triples, newest-due at the front.
    queue: VecDeque<(NodeName, String, String)>,
    started_at: Instant,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(
        config: SchedulerConfig,
        store: Store,
        commands: mpsc::Receiver<ControlRequest>,
        clock: C,
    ) -> Self {
        Self {
            config,
            store,
            clock,
            commands,
            schedule: Vec::new(),
            running: HashMap::new(),
            queue: VecDeque::new(),
            started_at: Instant::now(),
        }
    }

    /// Run forever with the given command-poll window.
    ///
    /// Returns only on a fatal error, after aborting every live worker.
    pub async fn run(&mut self, poll: Duration) -> SchedulerError {
        match self.run_loop(poll).await {
            Ok(never) => match never {},
            Err(err) => {
                error!(error = %err, "aborting backup scheduler");
                self.terminate_workers();
                err
            }
        }
    }

    async fn run_loop(&mut self, poll: Duration) -> Result<Infallible, SchedulerError> {
        std::fs::create_dir_all(&self.config.backup_dir)?;
        self.rebuild_schedule();
        self.clean_backup_dir()?;
        loop {
            self.run_once(poll).await?;
        }
    }

    /// One loop iteration: bounded command poll, reap, dispatch.
    ///
    /// Public so tests and embedders can drive the loop step by step.
    pub async fn run_once(&mut self, poll: Duration) -> Result<(), SchedulerError> {
        match tokio::time::timeout(poll, self.commands.recv()).await {
            Ok(Some(ctrl)) => self.handle_command(ctrl)?,
            Ok(None) => {
                // Command channel closed (listener gone). Sleep out the
                // poll window so the loop keeps its cadence.
                tokio::time::sleep(poll).await;
            }
            Err(_) => {} // poll window elapsed with no command
        }
        self.reap_finished()?;
        self.dispatch_due();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    fn handle_command(&mut self, ctrl: ControlRequest) -> Result<(), SchedulerError> {
        debug!(command = %ctrl.request.command, "handling control command");
        let reply = match self.apply_command(&ctrl.request) {
            Ok((data, tasks_changed)) => {
                if tasks_changed {
                    self.rebuild_schedule();
                    self.clean_backup_dir()?;
                }
                Reply::ok(data)
            }
            Err(e) => {
                warn!(command = %ctrl.request.command, error = %e, "control command failed");
                Reply::error(e)
            }
        };
        // The client may have gone away; a dropped reply is fine.
        let _ = ctrl.reply_tx.send(reply);
        Ok(())
    }

    fn apply_command(&mut self, request: &Request) -> Result<(Value, bool), CommandError> {
        match request.command.as_str() {
            // Loop-level status: these counters live here, not in the store.
            "status" => Ok((
                json!({
                    "uptime_secs": self.started_at.elapsed().as_secs(),
                    "scheduled": self.schedule.len(),
                    "queued": self.queue.len(),
                    "running": self.running.len(),
                }),
                false,
            )),
            _ => commands::apply(&mut self.store, &request.command, &request.args),
        }
    }

    // ------------------------------------------------------------------
    // Schedule view
    // ------------------------------------------------------------------

    /// Rebuild the materialized schedule from the store: every configured
    /// task joined with its node address and newest finished record.
    pub fn rebuild_schedule(&mut self) {
        debug!("reloading backup schedule");
        let mut schedule = Vec::new();
        for name in self.store.node_names() {
            let Some(address) = self.store.node_address(name.as_str()) else {
                continue;
            };
            for task in self.store.tasks_for_node(name.as_str()) {
                let history = self.store.finished_tasks(name.as_str(), &task.path);
                let newest = history.first();
                schedule.push(ScheduledTask {
                    node_name: name.clone(),
                    address: address.clone(),
                    path: task.path,
                    frequency_minutes: task.frequency_minutes,
                    last_checksum: newest.map(|ft| ft.checksum.clone()).unwrap_or_default(),
                    last_backup: newest.map(|ft| ft.timestamp),
                });
            }
        }
        self.schedule = schedule;
    }

    // ------------------------------------------------------------------
    // Reaping
    // ------------------------------------------------------------------

    /// Reap exited workers: interpret sentinels, record history, release
    /// the slot.
    fn reap_finished(&mut self) -> Result<(), SchedulerError> {
        let finished: Vec<TaskKey> = self
            .running
            .iter()
            .filter(|(_, task)| task.is_finished())
            .map(|(key, _)| key.clone())
            .collect();

        for key in finished {
            if let Some(task) = self.running.remove(&key) {
                self.reap_one(&key, &task)?;
            }
        }
        Ok(())
    }

    fn reap_one(&mut self, key: &TaskKey, task: &RunningTask) -> Result<(), SchedulerError> {
        let write_path = task.write_file_path();
        let correct = worker::correct_path(write_path);
        let same = worker::same_path(write_path);

        if correct.exists() {
            std::fs::remove_file(&correct)?;
            let kb_size = std::fs::metadata(write_path)?.len() as f64 / 1024.0;
            let checksum = digest::file_sha256(write_path)?;
            let finished = FinishedTask {
                result_path: write_path.display().to_string(),
                kb_size,
                timestamp: self.clock.now(),
                checksum,
            };
            self.store
                .register_finished_task(key.node.as_str(), &key.path, finished)?;
            info!(node = %key.node, path = %key.path, "backup finished successfully");
            self.rebuild_schedule();
            self.clean_backup_dir()?;
        } else if same.exists() {
            std::fs::remove_file(&same)?;
            match self
                .store
                .finished_tasks(key.node.as_str(), &key.path)
                .first()
                .cloned()
            {
                Some(previous) => {
                    let finished = FinishedTask {
                        timestamp: self.clock.now(),
                        ..previous
                    };
                    self.store
                        .register_finished_task(key.node.as_str(), &key.path, finished)?;
                    info!(node = %key.node, path = %key.path, "backup unchanged since last run");
                    self.rebuild_schedule();
                    self.clean_backup_dir()?;
                }
                None => {
                    // A remove/re-add raced the worker; there is nothing
                    // to clone, so the run records nothing.
                    warn!(
                        node = %key.node,
                        path = %key.path,
                        "unchanged backup has no history record, treating as failed"
                    );
                }
            }
        } else {
            error!(node = %key.node, path = %key.path, "backup failed");
            remove_if_exists(write_path)?;
            remove_if_exists(&worker::wip_path(write_path))?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Enqueue due tasks, then drain the queue into free worker slots.
    fn dispatch_due(&mut self) {
        let now = self.clock.now();
        for task in &self.schedule {
            if self.running.contains_key(&task.key()) {
                continue;
            }
            let entry = (
                task.node_name.clone(),
                task.path.clone(),
                task.last_checksum.clone(),
            );
            if task.should_run(now) && !self.queue.contains(&entry) {
                self.queue.push_front(entry);
            }
        }

        while self.running.len() < self.config.max_workers {
            let Some((node, path, last_checksum)) = self.queue.pop_back() else {
                break;
            };
            // The node may have been removed while the entry sat queued.
            let Some(address) = self.store.node_address(node.as_str()) else {
                debug!(node = %node, path = %path, "dropping queued backup for removed node");
                continue;
            };
            let write_file_path = self.write_file_path(&node, &path);
            let handle = worker::spawn(WorkerParams {
                address,
                node_path: path.clone(),
                write_file_path: write_file_path.clone(),
                previous_checksum: last_checksum,
            });
            debug!(node = %node, path = %path, "backup order launched");
            self.running.insert(
                TaskKey::new(node, path),
                RunningTask {
                    write_file_path,
                    handle,
                },
            );
        }
    }

    /// `backup_{nanos}_{node}_{safe_base64(path)}` under the backup dir.
    ///
    /// Integer nanoseconds keep the name dot-free, which the GC prefix
    /// rule depends on.
    fn write_file_path(&self, node: &NodeName, path: &str) -> PathBuf {
        let nanos = self.clock.now().timestamp_nanos_opt().unwrap_or_default();
        self.config
            .backup_dir
            .join(format!("backup_{}_{}_{}", nanos, node, safe_base64(path)))
    }

    // ------------------------------------------------------------------
    // GC & shutdown
    // ------------------------------------------------------------------

    /// Delete backup-directory entries owned by neither tracked history
    /// nor a live worker.
    pub fn clean_backup_dir(&self) -> Result<(), SchedulerError> {
        gc::clean_backup_dir(&self.config.backup_dir, &self.store, &self.running)
    }

    /// Forcibly terminate every live worker.
    pub fn terminate_workers(&mut self) {
        for (key, task) in self.running.drain() {
            if !task.is_finished() {
                warn!(node = %key.node, path = %key.path, "aborting live worker");
                task.abort();
            }
        }
    }

    // ------------------------------------------------------------------
    // Inspection (status command, tests)
    // ------------------------------------------------------------------

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Mutable store access for embedders; the scheduler stays the single
    /// writer at runtime. Call [`Self::rebuild_schedule`] after mutating.
    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn schedule(&self) -> &[ScheduledTask] {
        &self.schedule
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    pub fn running_len(&self) -> usize {
        self.running.len()
    }

    pub fn running_task(&self, key: &TaskKey) -> Option<&RunningTask> {
        self.running.get(key)
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
#[path = "../scheduler_tests.rs"]
mod tests;
