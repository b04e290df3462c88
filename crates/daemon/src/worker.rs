// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Node handler: one-shot pull of a single path from a node agent.
//!
//! The handler connects to the node's sidecar, asks for a snapshot of one
//! path, and streams it into the backup directory. Its only outputs are
//! the artifact file, the sentinel set, and task exit:
//!
//! - `.SAME`    — the node reported the content unchanged; no artifact.
//! - `.WIP`     — transfer in progress; left behind (with the partial
//!                artifact) when the handler dies mid-transfer.
//! - `.CORRECT` — transfer complete; `.WIP` removed.
//!
//! A handler that exits with no sentinel failed before any bytes moved.

use std::path::{Path, PathBuf};
use std::time::Duration;

use packrat_core::NodeAddress;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Chunk size for the payload stream.
const SOCKET_BUFFER_SIZE: usize = 4096;

/// Bound on establishing the sidecar connection. The data phase itself is
/// unbounded; a stuck transfer holds its worker slot.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

const WIP_SUFFIX: &str = ".WIP";
const CORRECT_SUFFIX: &str = ".CORRECT";
const SAME_SUFFIX: &str = ".SAME";

/// `{write_file_path}.WIP`
pub fn wip_path(write_file_path: &Path) -> PathBuf {
    sentinel_path(write_file_path, WIP_SUFFIX)
}

/// `{write_file_path}.CORRECT`
pub fn correct_path(write_file_path: &Path) -> PathBuf {
    sentinel_path(write_file_path, CORRECT_SUFFIX)
}

/// `{write_file_path}.SAME`
pub fn same_path(write_file_path: &Path) -> PathBuf {
    sentinel_path(write_file_path, SAME_SUFFIX)
}

fn sentinel_path(write_file_path: &Path, suffix: &str) -> PathBuf {
    let mut name = write_file_path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// Inputs for one pull.
#[derive(Debug, Clone)]
pub struct WorkerParams {
    pub address: NodeAddress,
    pub node_path: String,
    pub write_file_path: PathBuf,
    pub previous_checksum: String,
}

/// Errors from a node handler run.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connect timeout to {0}")]
    ConnectTimeout(String),

    #[error("node closed the connection")]
    ConnectionClosed,

    #[error("invalid size header: {0:?}")]
    InvalidSizeHeader(String),
}

/// The snapshot request sent to the sidecar.
#[derive(Serialize)]
struct SnapshotRequest<'a> {
    checksum: &'a str,
    path: &'a str,
}

/// Spawn a detached node handler task.
///
/// Errors are logged here; the scheduler learns the outcome from the
/// sentinel set at reap time.
pub fn spawn(params: WorkerParams) -> JoinHandle<()> {
    tokio::spawn(async move {
        let node = params.address.clone();
        let path = params.node_path.clone();
        if let Err(e) = run(params).await {
            warn!(node = %node, path = %path, error = %e, "node handler failed");
        }
    })
}

/// Run one pull against the node's sidecar.
pub async fn run(params: WorkerParams) -> Result<(), WorkerError> {
    debug!(
        node = %params.address,
        path = %params.node_path,
        "starting node handler"
    );

    let mut sock = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((params.address.host.as_str(), params.address.port)),
    )
    .await
    .map_err(|_| WorkerError::ConnectTimeout(params.address.to_string()))??;

    let request = serde_json::to_vec(&SnapshotRequest {
        checksum: &params.previous_checksum,
        path: &params.node_path,
    })?;
    sock.write_all(&request).await?;

    // First reply frame: the literal SAME, or the payload byte-count.
    let mut header = [0u8; 1024];
    let n = sock.read(&mut header).await?;
    if n == 0 {
        return Err(WorkerError::ConnectionClosed);
    }
    let header = &header[..n];

    if header == b"SAME".as_slice() {
        debug!(node = %params.address, path = %params.node_path, "backup unchanged on node");
        touch(&same_path(&params.write_file_path)).await?;
        return Ok(());
    }

    let text = String::from_utf8_lossy(header);
    let file_size: u64 = text
        .trim()
        .parse()
        .map_err(|_| WorkerError::InvalidSizeHeader(text.into_owned()))?;
    sock.write_all(b"OK").await?;

    // From here on a crash leaves .WIP plus the partial artifact for the
    // reaper to collect.
    touch(&wip_path(&params.write_file_path)).await?;
    receive_payload(&mut sock, &params.write_file_path, file_size).await?;

    sock.write_all(b"OK").await?;
    let mut checksum_buf = [0u8; SOCKET_BUFFER_SIZE];
    let n = sock.read(&mut checksum_buf).await?;
    let server_checksum = String::from_utf8_lossy(&checksum_buf[..n])
        .trim_end()
        .to_string();

    verify_checksum(&params.write_file_path, &server_checksum).await?;

    touch(&correct_path(&params.write_file_path)).await?;
    tokio::fs::remove_file(wip_path(&params.write_file_path)).await?;

    info!(
        node = %params.address,
        path = %params.node_path,
        "node handler finished"
    );
    Ok(())
}

/// Stream exactly `file_size` bytes into the artifact file, appending in
/// chunks of up to [`SOCKET_BUFFER_SIZE`].
async fn receive_payload(
    sock: &mut TcpStream,
    write_file_path: &Path,
    file_size: u64,
) -> Result<(), WorkerError> {
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(write_file_path)
        .await?;

    let mut remaining = file_size;
    let mut buf = [0u8; SOCKET_BUFFER_SIZE];
    while remaining > 0 {
        let want = remaining.min(SOCKET_BUFFER_SIZE as u64) as usize;
        let n = sock.read(&mut buf[..want]).await?;
        if n == 0 {
            return Err(WorkerError::ConnectionClosed);
        }
        file.write_all(&buf[..n]).await?;
        remaining -= n as u64;
    }
    file.flush().await?;
    debug!(file = %write_file_path.display(), "file data received");
    Ok(())
}

/// Compare the artifact digest against the server's checksum.
///
/// A mismatch is logged but does not fail the run.
async fn verify_checksum(write_file_path: &Path, server_checksum: &str) -> Result<(), WorkerError> {
    let path = write_file_path.to_path_buf();
    let local = tokio::task::spawn_blocking(move || crate::digest::file_sha256(&path))
        .await
        .map_err(std::io::Error::other)??;

    if local == server_checksum {
        debug!(checksum = %local, "backup checksum verified");
    } else {
        error!(
            local = %local,
            server = %server_checksum,
            "checksum mismatch on backup artifact"
        );
    }
    Ok(())
}

async fn touch(path: &Path) -> std::io::Result<()> {
    tokio::fs::File::create(path).await.map(|_| ())
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
