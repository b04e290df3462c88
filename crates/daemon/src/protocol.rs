// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control protocol for daemon communication.
//!
//! Requests and replies are JSON, framed on the socket by a u32
//! big-endian byte count (see [`wire`]).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

#[path = "protocol_wire.rs"]
pub mod wire;

/// Protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds the {max}-byte limit")]
    MessageTooLarge { size: usize, max: usize },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("timed out")]
    Timeout,
}

/// Maximum message size (1 MB). Control traffic is names and history
/// listings, never artifact payloads.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Default per-request read/write timeout
pub const DEFAULT_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(5);

/// A control request: a command name plus named arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub command: String,
    #[serde(default)]
    pub args: serde_json::Map<String, Value>,
}

impl Request {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: serde_json::Map::new(),
        }
    }

    pub fn arg(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args.insert(key.into(), value.into());
        self
    }
}

/// Reply envelope: `status` is `"OK"` or `"Error {message}:"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: String,
    pub data: Value,
}

impl Reply {
    pub fn ok(data: Value) -> Self {
        Self {
            status: "OK".to_string(),
            data,
        }
    }

    /// The trailing colon is part of the documented envelope format.
    pub fn error(message: impl std::fmt::Display) -> Self {
        Self {
            status: format!("Error {message}:"),
            data: Value::Null,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

#[cfg(test)]
#[path = "protocol_tests.rs"]
mod tests;
