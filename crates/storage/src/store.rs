// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable catalog and history store.
//!
//! A single JSON document holds the registered nodes, their task
//! configurations, and the per-(node, path) history of finished backups.
//! Every mutation rewrites the backing file atomically (write to `.tmp`,
//! fsync, rename) before returning, so callers may treat a returned `Ok`
//! as durable. An unreadable file is set aside as a numbered `.bak`
//! generation and the store starts empty rather than refusing to boot.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use packrat_core::{FinishedTask, NodeAddress, NodeName, TaskConfig};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown node: {0}")]
    UnknownNode(String),

    #[error("node already exists: {0}")]
    DuplicateNode(String),

    #[error("task already exists: {0}:{1}")]
    DuplicateTask(String, String),

    #[error("unknown task: {0}:{1}")]
    UnknownTask(String, String),
}

/// A registered node: its address plus the backup tasks configured on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct NodeRecord {
    address: NodeAddress,
    tasks: Vec<TaskConfig>,
}

/// The persisted document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Catalog {
    /// Nodes in registration order.
    nodes: IndexMap<String, NodeRecord>,
    /// Finished runs per `node:path` key, newest-first.
    history: IndexMap<String, Vec<FinishedTask>>,
}

/// Durable store for configuration and backup history.
pub struct Store {
    path: PathBuf,
    catalog: Catalog,
}

/// History key for a (node, path) pair. Node names cannot contain `:`,
/// so splitting at the first colon recovers the pair.
fn task_key(node: &str, path: &str) -> String {
    format!("{node}:{path}")
}

impl Store {
    /// Open the store at `path`, creating an empty catalog if the file
    /// does not exist. A file that fails to parse is set aside as a
    /// `.bak` generation.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let catalog = match Self::load(path)? {
            Some(catalog) => catalog,
            None => Catalog::default(),
        };
        Ok(Self {
            path: path.to_path_buf(),
            catalog,
        })
    }

    fn load(path: &Path) -> Result<Option<Catalog>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }

        let file = File::open(path)?;
        let reader = BufReader::new(file);
        match serde_json::from_reader(reader) {
            Ok(catalog) => Ok(Some(catalog)),
            Err(e) => {
                let set_aside = set_aside_corrupt(path)?;
                warn!(
                    error = %e,
                    store = %path.display(),
                    set_aside = %set_aside.display(),
                    "unreadable store file set aside, starting empty",
                );
                Ok(None)
            }
        }
    }

    /// Persist the catalog atomically. The rename is the durability point.
    fn save(&self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp_path = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp_path)?;
            let mut writer = BufWriter::new(file);
            serde_json::to_writer(&mut writer, &self.catalog)?;
            let file = writer.into_inner().map_err(|e| e.into_error())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Names of all registered nodes, in registration order.
    pub fn node_names(&self) -> Vec<NodeName> {
        self.catalog
            .nodes
            .keys()
            .map(|name| NodeName::new(name.as_str()))
            .collect()
    }

    /// Address of a node, if registered.
    pub fn node_address(&self, name: &str) -> Option<NodeAddress> {
        self.catalog.nodes.get(name).map(|n| n.address.clone())
    }

    /// All registered nodes with their addresses.
    pub fn nodes(&self) -> Vec<(NodeName, NodeAddress)> {
        self.catalog
            .nodes
            .iter()
            .map(|(name, record)| (NodeName::new(name.as_str()), record.address.clone()))
            .collect()
    }

    /// Task configurations for a node; empty for unknown nodes.
    pub fn tasks_for_node(&self, name: &str) -> Vec<TaskConfig> {
        self.catalog
            .nodes
            .get(name)
            .map(|n| n.tasks.clone())
            .unwrap_or_default()
    }

    /// Every configured task across all nodes.
    pub fn all_tasks(&self) -> Vec<(NodeName, TaskConfig)> {
        self.catalog
            .nodes
            .iter()
            .flat_map(|(name, record)| {
                record
                    .tasks
                    .iter()
                    .map(|task| (NodeName::new(name.as_str()), task.clone()))
            })
            .collect()
    }

    /// Finished runs for a (node, path), newest-first.
    pub fn finished_tasks(&self, node: &str, path: &str) -> &[FinishedTask] {
        self.catalog
            .history
            .get(&task_key(node, path))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    // ------------------------------------------------------------------
    // Mutations (durable before return)
    // ------------------------------------------------------------------

    /// Register a node.
    pub fn add_node(&mut self, name: &NodeName, address: NodeAddress) -> Result<(), StoreError> {
        if self.catalog.nodes.contains_key(name.as_str()) {
            return Err(StoreError::DuplicateNode(name.to_string()));
        }
        self.catalog.nodes.insert(
            name.to_string(),
            NodeRecord {
                address,
                tasks: Vec::new(),
            },
        );
        self.save()
    }

    /// Remove a node along with its task configurations and history.
    pub fn remove_node(&mut self, name: &str) -> Result<(), StoreError> {
        if self.catalog.nodes.shift_remove(name).is_none() {
            return Err(StoreError::UnknownNode(name.to_string()));
        }
        let prefix = format!("{name}:");
        self.catalog.history.retain(|key, _| !key.starts_with(&prefix));
        self.save()
    }

    /// Configure a backup task on a node. Unique by (node, path).
    pub fn add_task(
        &mut self,
        node: &str,
        path: &str,
        frequency_minutes: u32,
    ) -> Result<(), StoreError> {
        let record = self
            .catalog
            .nodes
            .get_mut(node)
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))?;
        if record.tasks.iter().any(|t| t.path == path) {
            return Err(StoreError::DuplicateTask(
                node.to_string(),
                path.to_string(),
            ));
        }
        record.tasks.push(TaskConfig {
            path: path.to_string(),
            frequency_minutes,
        });
        self.save()
    }

    /// Remove a task configuration. History is kept; artifacts for
    /// unconfigured tasks fall out of the GC's valid set.
    pub fn remove_task(&mut self, node: &str, path: &str) -> Result<(), StoreError> {
        let record = self
            .catalog
            .nodes
            .get_mut(node)
            .ok_or_else(|| StoreError::UnknownNode(node.to_string()))?;
        let before = record.tasks.len();
        record.tasks.retain(|t| t.path != path);
        if record.tasks.len() == before {
            return Err(StoreError::UnknownTask(node.to_string(), path.to_string()));
        }
        self.save()
    }

    /// Append a finished run at the front of the (node, path) history.
    pub fn register_finished_task(
        &mut self,
        node: &str,
        path: &str,
        finished: FinishedTask,
    ) -> Result<(), StoreError> {
        self.catalog
            .history
            .entry(task_key(node, path))
            .or_default()
            .insert(0, finished);
        self.save()
    }
}

/// How many corrupt-store generations are kept.
const STORE_BAK_GENERATIONS: u32 = 3;

/// Move an unreadable store file out of the way and return where it went.
///
/// The newest lands at `<store>.bak.1`; earlier generations shift to
/// `.bak.2` and `.bak.3`, and whatever held the last slot is clobbered
/// by the rename. Shift failures are ignored, losing a generation at
/// worst; the final rename must succeed so `open` can start fresh.
fn set_aside_corrupt(path: &Path) -> std::io::Result<PathBuf> {
    let generation = |n: u32| path.with_extension(format!("bak.{n}"));

    for n in (1..STORE_BAK_GENERATIONS).rev() {
        let _ = fs::rename(generation(n), generation(n + 1));
    }

    let newest = generation(1);
    fs::rename(path, &newest)?;
    Ok(newest)
}

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;
