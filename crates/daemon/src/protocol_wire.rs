// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Framing for control-socket messages.
//!
//! Every message travels as a u32 big-endian byte count followed by that
//! many bytes of JSON. Frames above [`MAX_MESSAGE_SIZE`] are refused in
//! both directions, so a garbled length prefix cannot trigger a huge
//! allocation.

use std::future::Future;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{ProtocolError, Reply, Request, DEFAULT_TIMEOUT, MAX_MESSAGE_SIZE};

/// Serialize `msg` and write it as a single length-prefixed frame.
pub async fn send<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(msg)?;
    check_frame_size(body.len())?;

    // Prefix and body go out as one write so a frame is never split by a
    // failure between the two.
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame and deserialize it.
///
/// EOF before the length prefix reads as [`ProtocolError::ConnectionClosed`];
/// EOF inside a frame is an I/O error.
pub async fn recv<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut prefix = [0u8; 4];
    if let Err(e) = reader.read_exact(&mut prefix).await {
        return Err(match e.kind() {
            std::io::ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed,
            _ => ProtocolError::Io(e),
        });
    }

    let len = u32::from_be_bytes(prefix) as usize;
    check_frame_size(len)?;

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Receive a request, bounded by [`DEFAULT_TIMEOUT`].
pub async fn read_request<R>(reader: &mut R) -> Result<Request, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    with_deadline(recv(reader)).await
}

/// Send a reply, bounded by [`DEFAULT_TIMEOUT`].
pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    with_deadline(send(writer, reply)).await
}

fn check_frame_size(len: usize) -> Result<(), ProtocolError> {
    if len > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }
    Ok(())
}

async fn with_deadline<T>(
    op: impl Future<Output = Result<T, ProtocolError>>,
) -> Result<T, ProtocolError> {
    match tokio::time::timeout(DEFAULT_TIMEOUT, op).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
