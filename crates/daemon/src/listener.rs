// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for the control socket.
//!
//! The listener runs in a spawned task, accepting connections and
//! handling them without blocking the scheduler loop. Each request is
//! forwarded into the scheduler's command channel together with a oneshot
//! reply handle; the scheduler answers while it serializes the command
//! against reaping and dispatch.

use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, warn};

use crate::protocol::{self, wire, Reply, Request};

/// A control request paired with its reply handle.
pub struct ControlRequest {
    pub request: Request,
    pub reply_tx: oneshot::Sender<Reply>,
}

/// Listener task for accepting control connections.
pub struct Listener {
    socket: UnixListener,
    commands: mpsc::Sender<ControlRequest>,
}

/// Errors from connection handling.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Scheduler unavailable")]
    SchedulerUnavailable,
}

impl Listener {
    pub fn new(socket: UnixListener, commands: mpsc::Sender<ControlRequest>) -> Self {
        Self { socket, commands }
    }

    /// Run the accept loop, spawning a task per connection.
    pub async fn run(self) {
        loop {
            match self.socket.accept().await {
                Ok((stream, _)) => {
                    let commands = self.commands.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, commands).await {
                            log_connection_error(&e);
                        }
                    });
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                }
            }
        }
    }
}

/// Clients hanging up early is ordinary; everything else deserves noise.
fn log_connection_error(e: &ConnectionError) {
    match e {
        ConnectionError::Protocol(protocol::ProtocolError::ConnectionClosed) => {
            debug!("client went away mid-request")
        }
        ConnectionError::Protocol(protocol::ProtocolError::Timeout) => {
            warn!("control connection timed out")
        }
        other => error!("control connection failed: {other}"),
    }
}

/// Handle a single control connection: one request, one reply.
async fn handle_connection(
    stream: UnixStream,
    commands: mpsc::Sender<ControlRequest>,
) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();

    let request = wire::read_request(&mut reader).await?;
    debug!(command = %request.command, "received control request");

    let (reply_tx, reply_rx) = oneshot::channel();
    commands
        .send(ControlRequest { request, reply_tx })
        .await
        .map_err(|_| ConnectionError::SchedulerUnavailable)?;

    // No timeout here: the scheduler replies once the command is handled,
    // which can wait behind a full reap/dispatch pass.
    let reply = reply_rx
        .await
        .map_err(|_| ConnectionError::SchedulerUnavailable)?;

    wire::write_reply(&mut writer, &reply).await?;
    Ok(())
}

#[cfg(test)]
#[path = "listener_tests.rs"]
mod tests;
