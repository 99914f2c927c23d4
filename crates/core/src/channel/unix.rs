use std::path::PathBuf;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::UnixStream;
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{ConnectFuture, Connector, Link};
use crate::Error;
use crate::config::MAX_ARCHIVE_BYTES;
use crate::protocol::{MAX_FRAME_BYTES, Message, decode_line, encode_line};

/// Connects to the daemon's channel socket.
pub struct UnixConnector {
    socket_path: PathBuf,
}

impl UnixConnector {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
        }
    }
}

impl Connector for UnixConnector {
    fn connect(&self) -> ConnectFuture<'_> {
        Box::pin(async move {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                debug!(
                    event = "channel.unix_connect_failed",
                    path = %self.socket_path.display(),
                    error = %e,
                    "channel.unix_connect_failed"
                );
                Error::TransportDisconnected
            })?;
            Ok(spawn_link(stream))
        })
    }
}

/// Wraps a connected stream as a [`Link`] speaking NDJSON. Used on both ends
/// of the socket.
pub fn spawn_link(stream: UnixStream) -> Link {
    spawn_link_limited(stream, MAX_FRAME_BYTES)
}

fn spawn_link_limited(stream: UnixStream, max_frame: usize) -> Link {
    let (r, w) = stream.into_split();
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let reply = out_tx.downgrade();
    tokio::spawn(write_frames(w, out_rx));
    tokio::spawn(read_frames(r, in_tx, reply, max_frame));
    Link {
        outbound: out_tx,
        inbound: in_rx,
    }
}

async fn write_frames(w: OwnedWriteHalf, mut rx: mpsc::UnboundedReceiver<Message>) {
    let mut w = BufWriter::new(w);
    while let Some(message) = rx.recv().await {
        let line = match encode_line(&message) {
            Ok(line) => line,
            Err(e) => {
                warn!(event = "channel.encode_failed", error = %e, "channel.encode_failed");
                continue;
            }
        };
        if w.write_all(&line).await.is_err() || w.flush().await.is_err() {
            break;
        }
    }
    let _ = w.shutdown().await;
}

/// `reply` is weak so the writer still closes once the link owner drops its
/// outbound sender.
async fn read_frames(
    r: OwnedReadHalf,
    tx: mpsc::UnboundedSender<Message>,
    reply: mpsc::WeakUnboundedSender<Message>,
    max_frame: usize,
) {
    let mut r = BufReader::new(r);
    let mut buf: Vec<u8> = Vec::new();
    loop {
        buf.clear();
        let limit = max_frame as u64 + 1;
        match (&mut r).take(limit).read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(event = "channel.read_failed", error = %e, "channel.read_failed");
                break;
            }
        }
        if buf.len() > max_frame {
            let frame_bytes = match discard_line(&mut r).await {
                Ok(rest) => buf.len() as u64 + rest,
                Err(e) => {
                    debug!(event = "channel.read_failed", error = %e, "channel.read_failed");
                    break;
                }
            };
            warn!(
                event = "channel.frame_too_large",
                frame_bytes,
                limit = max_frame as u64,
                "channel.frame_too_large"
            );
            // Only archives get this big; base64 inflates them by 4/3.
            let err = Error::ArchiveTooLarge {
                size: (frame_bytes / 4 * 3) as usize,
                limit: MAX_ARCHIVE_BYTES as usize,
            };
            if let Some(reply) = reply.upgrade() {
                let _ = reply.send(Message::rejected(&err));
            }
            continue;
        }
        if buf.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match decode_line(&buf) {
            Ok(message) => {
                if tx.send(message).is_err() {
                    break;
                }
            }
            Err(e) => {
                warn!(event = "channel.decode_failed", error = %e, "channel.decode_failed");
            }
        }
    }
}

/// Skips the rest of the current line without buffering it. Returns the
/// number of bytes skipped, newline included.
async fn discard_line(r: &mut BufReader<OwnedReadHalf>) -> std::io::Result<u64> {
    let mut skipped = 0u64;
    loop {
        let chunk = r.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(skipped);
        }
        let (n, done) = match chunk.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (chunk.len(), false),
        };
        r.consume(n);
        skipped += n as u64;
        if done {
            return Ok(skipped);
        }
    }
}
