//! Pipe transport for targets launched with `--remote-debugging-pipe`.
//!
//! Works over any AsyncRead/AsyncWrite pair (child stdio, inherited fds, sockets).

use futures::{SinkExt, StreamExt, stream};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::{ConnectionEvent, EventStream, QueuedConnection};
use crate::bridge::codec::MessageCodec;

/// Attach to an already-open pipe pair.
///
/// Unlike the WebSocket transport there is no handshake, so the stream starts
/// with [`ConnectionEvent::Open`] immediately and ends with a
/// [`ConnectionEvent::Close`] once the reader reaches EOF.
pub fn attach<R, W>(reader: R, writer: W) -> (QueuedConnection, EventStream)
where
    R: AsyncRead + Send + Unpin + 'static,
    W: AsyncWrite + Send + Unpin + 'static,
{
    let (connection, mut outbound) = QueuedConnection::new();

    let mut framed_writer = FramedWrite::new(writer, MessageCodec::new());
    tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = framed_writer.send(text).await {
                tracing::warn!(error = %e, "Pipe write failed");
                break;
            }
        }
        tracing::debug!("Pipe writer task exiting");
    });

    let frames = FramedRead::new(reader, MessageCodec::new()).map(|frame| match frame {
        Ok(text) => ConnectionEvent::Message(text),
        Err(e) => ConnectionEvent::Error(e.to_string()),
    });

    let events = stream::once(async { ConnectionEvent::Open })
        .chain(frames)
        .chain(stream::once(async { ConnectionEvent::Close { reason: None } }));

    (connection, Box::pin(events))
}
