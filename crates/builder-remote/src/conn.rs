// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Framed connection plumbing shared by coordinator and worker.
//!
//! Each TCP connection gets a writer task fed by an unbounded channel of
//! pre-encoded frames and a read half drained through a growable buffer.
//! Messages are decoded with [`builder_proto::decode_message`]; a decode
//! error poisons the connection (the peer is told once when possible, then
//! the connection closes).

use builder_proto::{decode_message, Message, WireError};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::debug;

/// Sender half: pre-encoded frames queued for the writer task.
pub(crate) type FrameSender = mpsc::UnboundedSender<Vec<u8>>;

/// Spawn the writer task for a connection.
pub(crate) fn spawn_writer(mut write: OwnedWriteHalf) -> FrameSender {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if write.write_all(&frame).await.is_err() {
                debug!("connection writer closed");
                return;
            }
        }
    });
    tx
}

/// Read one message from the stream, buffering partial frames.
///
/// Returns `Ok(None)` on clean EOF.
pub(crate) async fn read_message(
    read: &mut OwnedReadHalf,
    buf: &mut Vec<u8>,
) -> Result<Option<(Message, u64)>, WireError> {
    loop {
        match decode_message(buf)? {
            Some((message, correlation, consumed)) => {
                buf.drain(..consumed);
                return Ok(Some((message, correlation)));
            }
            None => {
                let mut chunk = [0u8; 16 * 1024];
                match read.read(&mut chunk).await {
                    Ok(0) => return Ok(None),
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(err) => {
                        debug!(error = %err, "connection read failed");
                        return Ok(None);
                    }
                }
            }
        }
    }
}
