// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Artifact directory garbage collection.
//!
//! Artifacts and their sentinels share a filename prefix (everything up
//! to the first `.`), so one valid-prefix set covers orphaned sentinels,
//! orphaned partial transfers, and history past the retention bound.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use packrat_core::TaskKey;
use packrat_storage::Store;
use tracing::{debug, warn};

use super::{RunningTask, SchedulerError};

/// History depth protected from collection, per (node, path).
pub const MAX_FINISHED_TASKS_TO_STORE: usize = 10;

/// Delete every entry in `backup_dir` whose prefix is neither a tracked
/// artifact of a configured task's newest [`MAX_FINISHED_TASKS_TO_STORE`]
/// finished runs nor the write path of a live worker.
pub(super) fn clean_backup_dir(
    backup_dir: &Path,
    store: &Store,
    running: &HashMap<TaskKey, RunningTask>,
) -> Result<(), SchedulerError> {
    let mut valid: HashSet<PathBuf> = HashSet::new();
    for node in store.node_names() {
        for task in store.tasks_for_node(node.as_str()) {
            for finished in store
                .finished_tasks(node.as_str(), &task.path)
                .iter()
                .take(MAX_FINISHED_TASKS_TO_STORE)
            {
                valid.insert(PathBuf::from(&finished.result_path));
            }
        }
    }
    valid.extend(running.values().map(|task| task.write_file_path.clone()));

    for entry in std::fs::read_dir(backup_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let name = file_name.to_string_lossy();
        let prefix = name.split('.').next().unwrap_or("");
        if valid.contains(&backup_dir.join(prefix)) {
            continue;
        }
        if !entry.file_type()?.is_file() {
            warn!(entry = %name, "skipping non-file entry in backup directory");
            continue;
        }
        debug!(file = %name, "removing unreferenced backup file");
        if let Err(e) = std::fs::remove_file(entry.path()) {
            warn!(file = %name, error = %e, "failed to remove unreferenced file");
        }
    }
    Ok(())
}

#[cfg(test)]
#[path = "gc_tests.rs"]
mod tests;
