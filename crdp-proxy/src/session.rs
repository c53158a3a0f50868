//! One debugger client attached to one channel.
//!
//! Client text frames go to [`Channel::send`]; channel messages go back as text frames.
//! An upstream close is forwarded as a close frame. Listeners are removed on exit; the
//! channel slot itself stays allocated.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use crdp_mux::{Channel, ConnectionEvent, ErrorKind, EventKind, Listener, MuxError};
use futures::{SinkExt, StreamExt};

/// A channel with its listeners already registered, waiting for a socket.
///
/// Attaching arms the channel's discard timer, so a session whose upgrade never
/// completes still lets the channel drop its pending buffer.
pub struct Session {
    channel: Channel,
    messages: Listener<String>,
    closed: Listener<ConnectionEvent>,
}

impl Session {
    pub fn attach(channel: Channel) -> Result<Self, MuxError> {
        let messages = channel.on_message()?;
        let closed = channel.on_event(EventKind::Close)?;
        Ok(Self {
            channel,
            messages,
            closed,
        })
    }

    pub async fn run(self, socket: WebSocket) {
        let Self {
            channel,
            mut messages,
            mut closed,
        } = self;
        let id = channel.id();

        tracing::info!(channel = %id, name = channel.name(), "Client attached");
        let (mut sink, mut stream) = socket.split();

        loop {
            tokio::select! {
                message = messages.recv() => {
                    let Some(text) = message else {
                        break;
                    };
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        tracing::debug!(channel = %id, error = %e, "Client write failed");
                        break;
                    }
                }
                event = closed.recv() => {
                    let reason = match event {
                        Some(ConnectionEvent::Close { reason }) => reason.unwrap_or_default(),
                        _ => String::new(),
                    };
                    let frame = CloseFrame {
                        code: close_code::AWAY,
                        reason: reason.into(),
                    };
                    let _ = sink.send(Message::Close(Some(frame))).await;
                    break;
                }
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        if let Err(e) = channel.send(text.as_str()) {
                            match e.kind() {
                                ErrorKind::Closed | ErrorKind::Transport => {
                                    tracing::warn!(channel = %id, error = %e, "Upstream unavailable");
                                    break;
                                }
                                _ => {
                                    tracing::warn!(channel = %id, error = %e, "Dropped client message");
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(channel = %id, error = %e, "Client read failed");
                        break;
                    }
                },
            }
        }

        let _ = channel.remove_listener(messages.id());
        let _ = channel.remove_listener(closed.id());
        tracing::info!(channel = %id, "Client detached");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crdp_mux::{ConnectionEvent, Multiplexor, MuxConfig, QueuedConnection};
    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::Message;

    use super::Session;
    use crate::server::serve_on;

    async fn start(mux: Multiplexor) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, mux, std::future::pending()));
        format!("ws://{addr}")
    }

    #[tokio::test]
    async fn client_traffic_is_multiplexed() {
        let (connection, mut wire) = QueuedConnection::new();
        let mux = Multiplexor::new(connection);
        mux.add_channel("reserved").unwrap();
        let base = start(mux.clone()).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("{base}/channel/ide"))
            .await
            .unwrap();

        client
            .send(Message::text(r#"{"id":7,"method":"Runtime.evaluate"}"#))
            .await
            .unwrap();
        let outbound = wire.recv().await.unwrap();
        assert_eq!(outbound, r#"{"id":71,"method":"Runtime.evaluate"}"#);

        mux.on_message(r#"{"id":71,"result":{"value":2}}"#).unwrap();
        let reply = client.next().await.unwrap().unwrap();
        assert_eq!(reply, Message::text(r#"{"id":7,"result":{"value":2}}"#));
    }

    #[tokio::test]
    async fn upstream_close_closes_client() {
        let (connection, _wire) = QueuedConnection::new();
        let mux = Multiplexor::new(connection);
        let base = start(mux.clone()).await;

        let (mut client, _) = tokio_tungstenite::connect_async(format!("{base}/channel/ide"))
            .await
            .unwrap();

        // Wait until the session has registered its listeners.
        while mux.snapshot().first().map(|c| c.listeners) != Some(1) {
            tokio::task::yield_now().await;
        }
        mux.on_event(ConnectionEvent::Close {
            reason: Some("browser exited".to_string()),
        })
        .unwrap();

        match client.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => assert_eq!(frame.reason.as_str(), "browser exited"),
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_upgrade_still_discards_buffer() {
        let (connection, _wire) = QueuedConnection::new();
        let config = MuxConfig::new().with_discard_after(Duration::from_secs(5));
        let mux = Multiplexor::with_config(connection, config);
        let channel = mux.add_channel("ide").unwrap();

        let session = Session::attach(channel.clone()).unwrap();
        assert_eq!(channel.snapshot().unwrap().listeners, 1);
        // The upgrade callback never runs.
        drop(session);

        mux.on_message(r#"{"method":"Debugger.paused","params":{}}"#)
            .unwrap();
        assert_eq!(channel.snapshot().unwrap().buffered, Some(1));

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(channel.snapshot().unwrap().buffered, None);
    }
}
