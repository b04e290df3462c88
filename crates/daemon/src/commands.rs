// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command adapter: maps control requests onto store operations.
//!
//! Each recognized command produces a reply payload plus a flag telling
//! the scheduler whether the mutation may have invalidated the schedule
//! view. Errors surface through the reply envelope; the loop continues.

use packrat_core::{NodeAddress, NodeName};
use packrat_storage::{Store, StoreError};
use serde_json::{json, Map, Value};
use thiserror::Error;

/// Errors from command parsing or execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    #[error("missing argument: {0}")]
    MissingArg(&'static str),

    #[error("invalid argument {0}: expected {1}")]
    InvalidArg(&'static str, &'static str),

    #[error("invalid node name: {0}")]
    InvalidNodeName(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Apply one command to the store.
///
/// Returns the reply payload and whether tasks changed.
pub fn apply(
    store: &mut Store,
    command: &str,
    args: &Map<String, Value>,
) -> Result<(Value, bool), CommandError> {
    match command {
        "add_node" => {
            let name = str_arg(args, "name")?;
            if !NodeName::is_valid(name) {
                return Err(CommandError::InvalidNodeName(name.to_string()));
            }
            let host = str_arg(args, "host")?;
            let port = port_arg(args, "port")?;
            store.add_node(&NodeName::new(name), NodeAddress::new(host, port))?;
            Ok((Value::Null, true))
        }

        "remove_node" => {
            let name = str_arg(args, "name")?;
            store.remove_node(name)?;
            Ok((Value::Null, true))
        }

        "list_nodes" => {
            let nodes: Vec<Value> = store
                .nodes()
                .into_iter()
                .map(|(name, address)| {
                    json!({
                        "name": name.as_str(),
                        "host": address.host,
                        "port": address.port,
                    })
                })
                .collect();
            Ok((Value::Array(nodes), false))
        }

        "add_task" => {
            let node = str_arg(args, "node")?;
            let path = str_arg(args, "path")?;
            let frequency = u32_arg(args, "frequency_minutes")?;
            store.add_task(node, path, frequency)?;
            Ok((Value::Null, true))
        }

        "remove_task" => {
            let node = str_arg(args, "node")?;
            let path = str_arg(args, "path")?;
            store.remove_task(node, path)?;
            Ok((Value::Null, true))
        }

        "list_tasks" => {
            let filter = opt_str_arg(args, "node")?;
            let tasks: Vec<Value> = store
                .all_tasks()
                .into_iter()
                .filter(|(node, _)| filter.map_or(true, |f| node.as_str() == f))
                .map(|(node, task)| {
                    json!({
                        "node": node.as_str(),
                        "path": task.path,
                        "frequency_minutes": task.frequency_minutes,
                    })
                })
                .collect();
            Ok((Value::Array(tasks), false))
        }

        "history" => {
            let node = str_arg(args, "node")?;
            let path = str_arg(args, "path")?;
            let history = serde_json::to_value(store.finished_tasks(node, path))
                .map_err(StoreError::from)?;
            Ok((history, false))
        }

        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn str_arg<'a>(args: &'a Map<String, Value>, key: &'static str) -> Result<&'a str, CommandError> {
    args.get(key)
        .ok_or(CommandError::MissingArg(key))?
        .as_str()
        .ok_or(CommandError::InvalidArg(key, "string"))
}

fn opt_str_arg<'a>(
    args: &'a Map<String, Value>,
    key: &'static str,
) -> Result<Option<&'a str>, CommandError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_str()
            .map(Some)
            .ok_or(CommandError::InvalidArg(key, "string")),
    }
}

fn u32_arg(args: &Map<String, Value>, key: &'static str) -> Result<u32, CommandError> {
    let value = args.get(key).ok_or(CommandError::MissingArg(key))?;
    value
        .as_u64()
        .and_then(|n| u32::try_from(n).ok())
        .ok_or(CommandError::InvalidArg(key, "unsigned integer"))
}

fn port_arg(args: &Map<String, Value>, key: &'static str) -> Result<u16, CommandError> {
    let value = args.get(key).ok_or(CommandError::MissingArg(key))?;
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or(CommandError::InvalidArg(key, "port number"))
}

#[cfg(test)]
#[path = "commands_tests.rs"]
mod tests;
