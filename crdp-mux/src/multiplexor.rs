//! Multiplexor - owns the physical connection and routes messages between channels.
//!
//! Flow:
//! 1. `Channel::send` → id rewritten to `id * 10 + channel` → one write to the connection
//! 2. Inbound response → channel decoded from the id → original id restored → that channel only
//! 3. Inbound notification → every channel, each applying its own domain filter
//! 4. Open/Close/Error → every listener registered for that event kind, unchanged

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::bridge::protocol::{
    ChannelId, Inbound, Request, decode_channel, decode_id, response_text,
};
use crate::channel::{Channel, ChannelSnapshot, ChannelState};
use crate::error::{MuxError, Result};
use crate::listener::{Listener, ListenerId, Registration};
use crate::transport::{Connection, ConnectionEvent, EventKind};

pub const DEFAULT_DISCARD_AFTER: Duration = Duration::from_secs(60);

/// Lock a mutex, recovering the data if a previous holder panicked.
///
/// All guarded state is left consistent between statements, so a poisoned lock
/// carries no half-applied update.
pub(crate) fn lock<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| {
        tracing::error!("Multiplexor mutex poisoned - recovering");
        poisoned.into_inner()
    })
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// Grace period between a channel's first listener and the discard of its
    /// not-yet-enabled notifications.
    pub discard_after: Duration,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            discard_after: std::env::var("CRDP_MUX_DISCARD_SECS")
                .ok()
                .and_then(|s| s.parse::<f64>().ok())
                .filter(|secs| secs.is_finite() && *secs >= 0.0)
                .map(Duration::from_secs_f64)
                .unwrap_or(DEFAULT_DISCARD_AFTER),
        }
    }
}

impl MuxConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_discard_after(mut self, after: Duration) -> Self {
        self.discard_after = after;
        self
    }
}

pub(crate) struct Shared {
    connection: Box<dyn Connection>,
    config: MuxConfig,
    /// Arena indexed by `ChannelId`; append-only.
    channels: StdMutex<Vec<Arc<StdMutex<ChannelState>>>>,
    events: StdMutex<Vec<(EventKind, Registration<ConnectionEvent>)>>,
    next_listener: AtomicU64,
    timers: CancellationToken,
}

impl Shared {
    pub fn config(&self) -> &MuxConfig {
        &self.config
    }

    pub fn state(&self, id: ChannelId) -> Option<Arc<StdMutex<ChannelState>>> {
        lock(&self.channels).get(id.index()).cloned()
    }

    fn states(&self) -> Vec<Arc<StdMutex<ChannelState>>> {
        lock(&self.channels).clone()
    }

    pub fn next_listener_id(&self) -> ListenerId {
        ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed))
    }

    pub fn write(&self, text: String) -> Result<()> {
        self.connection.send(text).map_err(|e| {
            tracing::warn!(error = %e, "Failed to queue outbound message");
            MuxError::from(e)
        })
    }

    pub fn add_event_listener(&self, kind: EventKind) -> Listener<ConnectionEvent> {
        let id = self.next_listener_id();
        let (listener, tx) = Listener::new(id);
        lock(&self.events).push((kind, Registration::new(id, tx)));
        tracing::trace!(?kind, listener = %id, "Event listener added");
        listener
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        let mut events = lock(&self.events);
        let before = events.len();
        events.retain(|(_, registration)| registration.id != id);
        events.len() != before
    }

    fn broadcast_event(&self, event: ConnectionEvent) {
        let Some(kind) = event.kind() else {
            return;
        };
        lock(&self.events).retain(|(registered, registration)| {
            *registered != kind || registration.deliver(event.clone())
        });
    }

    /// Arm the one-shot discard timer for a channel.
    ///
    /// The task only holds a weak reference and is cancelled when the multiplexor
    /// is dropped.
    pub fn spawn_discard_timer(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
        channel: ChannelId,
    ) {
        let shared = Arc::downgrade(self);
        let cancelled = self.timers.child_token();
        let after = self.config.discard_after;

        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    tracing::trace!(%channel, "Discard timer cancelled");
                }
                _ = tokio::time::sleep(after) => {
                    let Some(shared) = shared.upgrade() else {
                        return;
                    };
                    if let Some(state) = shared.state(channel) {
                        let dropped = lock(&state).discard();
                        tracing::debug!(%channel, dropped, "Pending notification buffer discarded");
                    }
                }
            }
        });
    }

    fn on_message(&self, text: &str) -> Result<()> {
        let inbound = Inbound::parse(text).inspect_err(|e| {
            tracing::error!(error = %e, "Malformed inbound message");
        })?;

        match inbound {
            Inbound::Response { id, fields } => {
                let channel = decode_channel(id);
                let Some(state) = self.state(channel) else {
                    let err = MuxError::UnknownChannel {
                        encoded: id,
                        channel,
                    };
                    tracing::error!(error = %err, "Response for unregistered channel");
                    return Err(err);
                };
                let original = decode_id(id);
                let text = response_text(original, fields)?;
                tracing::trace!(%channel, id = original, "Routing response");
                lock(&state).emit(text);
            }
            Inbound::Notification { method } => {
                tracing::trace!(%method, "Broadcasting notification");
                for state in self.states() {
                    lock(&state).deliver(method.domain(), text.to_string());
                }
            }
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.timers.cancel();
    }
}

/// Shares one connection between up to ten channels.
///
/// Cloning yields another handle to the same multiplexor; it is torn down (and
/// every pending discard timer cancelled) when the last handle is dropped.
#[derive(Clone)]
pub struct Multiplexor {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Multiplexor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexor")
            .field("channels", &self.channel_count())
            .field("config", &self.shared.config)
            .finish()
    }
}

impl Multiplexor {
    pub fn new(connection: impl Connection + 'static) -> Self {
        Self::with_config(connection, MuxConfig::default())
    }

    pub fn with_config(connection: impl Connection + 'static, config: MuxConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                connection: Box::new(connection),
                config,
                channels: StdMutex::new(Vec::new()),
                events: StdMutex::new(Vec::new()),
                next_listener: AtomicU64::new(1),
                timers: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &MuxConfig {
        &self.shared.config
    }

    /// Register a new channel with the next free id.
    pub fn add_channel(&self, name: impl Into<String>) -> Result<Channel> {
        let name: Arc<str> = Arc::from(name.into());
        let mut channels = lock(&self.shared.channels);

        let Some(id) = ChannelId::new(channels.len()) else {
            tracing::warn!(%name, "Channel limit reached");
            return Err(MuxError::TooManyChannels);
        };

        channels.push(Arc::new(StdMutex::new(ChannelState::new(
            id,
            Arc::clone(&name),
        ))));
        tracing::info!(channel = %id, %name, "Channel added");

        Ok(Channel::new(id, name, Arc::downgrade(&self.shared)))
    }

    pub fn channel(&self, id: ChannelId) -> Option<Channel> {
        let state = self.shared.state(id)?;
        let name = Arc::clone(lock(&state).name());
        Some(Channel::new(id, name, Arc::downgrade(&self.shared)))
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.shared.channels).len()
    }

    /// Rewrite the request id for `channel` and write it to the connection.
    ///
    /// This bypasses domain tracking; use [`Channel::send`] for client traffic.
    pub fn send(&self, channel: &Channel, text: &str) -> Result<()> {
        if !channel.belongs_to(&self.shared) {
            return Err(MuxError::Closed);
        }
        let request = Request::parse(text).inspect_err(|e| {
            tracing::error!(channel = %channel.id(), error = %e, "Rejected outbound message");
        })?;
        let encoded = request.encode(channel.id())?;
        self.shared.write(encoded)
    }

    /// Route one inbound message.
    pub fn on_message(&self, text: &str) -> Result<()> {
        self.shared.on_message(text)
    }

    /// Route any connection event: messages are multiplexed, everything else is broadcast.
    pub fn on_event(&self, event: ConnectionEvent) -> Result<()> {
        match event {
            ConnectionEvent::Message(text) => self.on_message(&text),
            other => {
                tracing::debug!(?other, "Connection event");
                self.shared.broadcast_event(other);
                Ok(())
            }
        }
    }

    pub fn add_event_listener(&self, kind: EventKind) -> Listener<ConnectionEvent> {
        self.shared.add_event_listener(kind)
    }

    pub fn remove_event_listener(&self, id: ListenerId) -> bool {
        self.shared.remove_event_listener(id)
    }

    pub fn snapshot(&self) -> Vec<ChannelSnapshot> {
        self.shared
            .states()
            .iter()
            .map(|state| lock(state).snapshot())
            .collect()
    }

    /// Drive the multiplexor from a connection's event stream.
    ///
    /// Returns after a `Close` event or when the stream ends. A protocol violation
    /// stops the loop and is returned to the caller.
    pub async fn run<S>(&self, mut events: S) -> Result<()>
    where
        S: Stream<Item = ConnectionEvent> + Unpin,
    {
        while let Some(event) = events.next().await {
            let closing = matches!(event, ConnectionEvent::Close { .. });
            self.on_event(event)?;
            if closing {
                tracing::info!("Connection closed");
                return Ok(());
            }
        }
        tracing::info!("Connection event stream ended");
        Ok(())
    }
}
