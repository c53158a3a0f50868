//! WebSocket transport to a DevTools endpoint.
//!
//! Endpoint format: `ws://{host}:{port}/devtools/browser/{id}` (or `/devtools/page/{id}`),
//! usually obtained through [`crate::discovery::discover`].

use futures::{SinkExt, StreamExt, stream};
use tokio_tungstenite::tungstenite::{self, Message};

use super::{ConnectionEvent, EventStream, QueuedConnection, TransportError};

/// Connect and split into a queued outbound handle and an inbound event stream.
///
/// The stream starts with [`ConnectionEvent::Open`] and always ends with a
/// [`ConnectionEvent::Close`], even if the socket drops without a close frame.
pub async fn connect(url: &str) -> Result<(QueuedConnection, EventStream), TransportError> {
    tracing::info!(url, "Connecting to DevTools WebSocket");

    let (ws, _) = tokio_tungstenite::connect_async(url)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    let (mut sink, source) = ws.split();

    let (connection, mut outbound) = QueuedConnection::new();
    tokio::spawn(async move {
        while let Some(text) = outbound.recv().await {
            if let Err(e) = sink.send(Message::text(text)).await {
                tracing::warn!(error = %e, "WebSocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
        tracing::debug!("WebSocket writer task exiting");
    });

    tracing::info!(url, "DevTools WebSocket connection established");

    let events = stream::once(async { ConnectionEvent::Open })
        .chain(source.filter_map(|frame| async move { map_frame(frame) }))
        .chain(stream::once(async { ConnectionEvent::Close { reason: None } }));

    Ok((connection, Box::pin(events)))
}

fn map_frame(frame: Result<Message, tungstenite::Error>) -> Option<ConnectionEvent> {
    match frame {
        Ok(Message::Text(text)) => Some(ConnectionEvent::Message(text.as_str().to_string())),
        Ok(Message::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
            Ok(text) => Some(ConnectionEvent::Message(text)),
            Err(_) => Some(ConnectionEvent::Error(
                "binary frame is not valid UTF-8".to_string(),
            )),
        },
        Ok(Message::Close(frame)) => Some(ConnectionEvent::Close {
            reason: frame
                .map(|f| f.reason.as_str().to_string())
                .filter(|reason| !reason.is_empty()),
        }),
        Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => None,
        Err(e) => Some(ConnectionEvent::Error(e.to_string())),
    }
}
