// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Backup task configuration, history records, and the materialized
//! schedule entry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::{NodeAddress, NodeName};

/// A configured backup: a path on a node, pulled every `frequency_minutes`.
///
/// Unique by (node, path); the owning node is implied by where the config
/// is stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub path: String,
    pub frequency_minutes: u32,
}

/// Immutable record of one successful backup run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinishedTask {
    /// Absolute path of the artifact in the backup directory.
    pub result_path: String,
    /// Artifact size in kilobytes.
    pub kb_size: f64,
    /// When the run finished.
    pub timestamp: DateTime<Utc>,
    /// Content digest of the artifact.
    pub checksum: String,
}

/// Identity of a backup target: (node, path on node).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey {
    pub node: NodeName,
    pub path: String,
}

impl TaskKey {
    pub fn new(node: impl Into<NodeName>, path: impl Into<String>) -> Self {
        Self {
            node: node.into(),
            path: path.into(),
        }
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.path)
    }
}

/// One entry of the materialized schedule: a task config joined with its
/// node address and the newest history record.
#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledTask {
    pub node_name: NodeName,
    pub address: NodeAddress,
    pub path: String,
    pub frequency_minutes: u32,
    /// Checksum of the newest finished run, empty when there is none.
    pub last_checksum: String,
    pub last_backup: Option<DateTime<Utc>>,
}

impl ScheduledTask {
    /// Whether the task is due: never backed up, or strictly more than
    /// `frequency_minutes` of wall-clock time elapsed since the newest
    /// finished record.
    pub fn should_run(&self, now: DateTime<Utc>) -> bool {
        match self.last_backup {
            None => true,
            Some(last) => (now - last).num_seconds() > i64::from(self.frequency_minutes) * 60,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.node_name.clone(), self.path.clone())
    }
}

#[cfg(test)]
#[path = "task_tests.rs"]
mod tests;
