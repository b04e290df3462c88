// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Environment knobs the daemon reads at startup.

use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::LifecycleError;

/// Where daemon state lives.
///
/// `PACKRAT_STATE_DIR` wins when set. Otherwise the XDG state convention
/// applies: `$XDG_STATE_HOME/packrat` when that variable is set, and the
/// conventional `~/.local/state/packrat` when it is not. Empty variables
/// count as unset.
pub fn state_dir() -> Result<PathBuf, LifecycleError> {
    if let Some(dir) = var_path("PACKRAT_STATE_DIR") {
        return Ok(dir);
    }

    match var_path("XDG_STATE_HOME") {
        Some(xdg) => Ok(xdg.join("packrat")),
        None => {
            let home = var_path("HOME").ok_or(LifecycleError::NoStateDir)?;
            Ok(home.join(".local").join("state").join("packrat"))
        }
    }
}

/// Scheduler poll override, mostly for tests and local debugging.
///
/// `PACKRAT_POLL_MS` is read as whole milliseconds; values that do not
/// parse are ignored.
pub fn poll_wait_ms() -> Option<Duration> {
    let raw = std::env::var("PACKRAT_POLL_MS").ok()?;
    let ms = raw.trim().parse().ok()?;
    Some(Duration::from_millis(ms))
}

fn var_path(key: &str) -> Option<PathBuf> {
    std::env::var_os(key)
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
