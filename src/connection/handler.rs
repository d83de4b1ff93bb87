//! Client Connection Handling
//!
//! One task per accepted socket. The handler owns nothing but its byte
//! buffers and two channels: decoded commands go up to the reactor, replies
//! come back down on this connection's own channel. Reads and reply writes
//! are multiplexed in one select loop, so a client blocked in BRPOP or
//! parked in SUBSCRIBE still receives its out-of-band deliveries promptly.
//!
//! Malformed frames are fatal: whatever fully decoded commands preceded the
//! bad frame are forwarded, then the connection is dropped.

use bytes::{Buf, BytesMut};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::protocol::{decode_commands, FrameError};
use crate::server::reactor::EngineMessage;
use crate::storage::ConnectionId;

/// Read buffer cap; a client that streams an oversized pipeline without a
/// single complete frame gets disconnected.
pub const MAX_BUFFER_SIZE: usize = 4 * 1024 * 1024;

const INITIAL_BUFFER_SIZE: usize = 4 * 1024;

/// Reasons a connection task ends abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    #[error("read buffer exceeded {MAX_BUFFER_SIZE} bytes")]
    BufferFull,

    #[error("engine queue closed")]
    EngineGone,
}

/// Services one client for the lifetime of its socket. Registers the
/// session with the reactor on entry and always deregisters on exit, so
/// engine-side state (watchers, waiters, subscriptions) cannot leak.
pub async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    id: ConnectionId,
    engine: mpsc::UnboundedSender<EngineMessage>,
) {
    let (reply_tx, reply_rx) = mpsc::unbounded_channel();
    if engine
        .send(EngineMessage::Connect {
            id,
            replies: reply_tx,
        })
        .is_err()
    {
        return;
    }

    match serve(stream, id, &engine, reply_rx).await {
        Ok(()) => debug!(conn = id, %addr, "client disconnected"),
        Err(err) => warn!(conn = id, %addr, %err, "connection closed"),
    }

    let _ = engine.send(EngineMessage::Disconnect { id });
}

async fn serve(
    stream: TcpStream,
    id: ConnectionId,
    engine: &mpsc::UnboundedSender<EngineMessage>,
    mut replies: mpsc::UnboundedReceiver<crate::protocol::Reply>,
) -> Result<(), ConnectionError> {
    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    let mut buffer = BytesMut::with_capacity(INITIAL_BUFFER_SIZE);
    let mut out = Vec::new();
    // Bytes the buffer must reach before the pending partial frame can
    // complete; re-decoding below this is wasted work on a large frame
    // arriving over many reads.
    let mut pending = 0;

    loop {
        tokio::select! {
            read = reader.read_buf(&mut buffer) => {
                if read? == 0 {
                    return Ok(());
                }
                if buffer.len() > MAX_BUFFER_SIZE {
                    return Err(ConnectionError::BufferFull);
                }
                if buffer.len() < pending {
                    continue;
                }

                let decoded = decode_commands(&buffer);
                for argv in decoded.commands {
                    trace!(conn = id, argc = argv.len(), "command received");
                    engine
                        .send(EngineMessage::Command { id, argv })
                        .map_err(|_| ConnectionError::EngineGone)?;
                }
                buffer.advance(decoded.consumed);
                pending = decoded.needed.unwrap_or(0);

                if let Some(err) = decoded.error {
                    return Err(ConnectionError::Protocol(err));
                }
            }

            reply = replies.recv() => {
                let Some(reply) = reply else {
                    return Ok(());
                };
                out.clear();
                reply.encode_into(&mut out);
                // Coalesce whatever else is already queued into one write.
                while let Ok(next) = replies.try_recv() {
                    next.encode_into(&mut out);
                }
                writer.write_all(&out).await?;
                writer.flush().await?;
            }
        }
    }
}
