//! Channel - one logical debugger session on the shared connection.
//!
//! Each channel runs two independent, irreversible state machines:
//! - per domain: `disabled → enabled`, triggered by sending `<Domain>.enable`
//! - buffer-wide: `buffering → discarded`, triggered by the discard timer, which the
//!   first message listener arms
//!
//! Notifications for a domain the channel has not enabled are held while buffering
//! and replayed in arrival order once the domain is enabled. Domains are never
//! disabled, and enabling is treated as effective as soon as the request is sent.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};

use serde::Serialize;

use crate::bridge::protocol::{ChannelId, Request};
use crate::error::{MuxError, Result};
use crate::listener::{Listener, ListenerId, Registration};
use crate::multiplexor::{Shared, lock};
use crate::transport::{ConnectionEvent, EventKind};

/// Notifications held back for domains that are not enabled yet.
#[derive(Debug)]
pub enum PendingBuffer {
    Buffering(HashMap<String, VecDeque<String>>),
    Discarded,
}

impl PendingBuffer {
    /// Number of held payloads, `None` once discarded.
    pub fn buffered(&self) -> Option<usize> {
        match self {
            Self::Buffering(queues) => Some(queues.values().map(VecDeque::len).sum()),
            Self::Discarded => None,
        }
    }
}

/// What a channel does with one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Deliver,
    Buffer,
    Drop,
}

/// Filter applied to every broadcast notification.
pub fn disposition(domain: &str, enabled: &HashSet<String>, pending: &PendingBuffer) -> Disposition {
    if enabled.contains(domain) {
        return Disposition::Deliver;
    }
    match pending {
        PendingBuffer::Buffering(_) => Disposition::Buffer,
        PendingBuffer::Discarded => Disposition::Drop,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiscardTimer {
    Unarmed,
    Armed,
    Fired,
}

/// Diagnostic view of a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub name: String,
    pub enabled_domains: Vec<String>,
    /// Payloads waiting for their domain; `None` once the buffer was discarded.
    pub buffered: Option<usize>,
    pub listeners: usize,
}

pub(crate) struct ChannelState {
    id: ChannelId,
    name: Arc<str>,
    enabled: HashSet<String>,
    pending: PendingBuffer,
    listeners: Vec<Registration<String>>,
    timer: DiscardTimer,
}

impl ChannelState {
    pub fn new(id: ChannelId, name: Arc<str>) -> Self {
        Self {
            id,
            name,
            enabled: HashSet::new(),
            pending: PendingBuffer::Buffering(HashMap::new()),
            listeners: Vec::new(),
            timer: DiscardTimer::Unarmed,
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Returns true if the domain was not enabled before.
    pub fn enable(&mut self, domain: &str) -> bool {
        self.enabled.insert(domain.to_string())
    }

    pub fn deliver(&mut self, domain: &str, payload: String) {
        match disposition(domain, &self.enabled, &self.pending) {
            Disposition::Deliver => self.emit(payload),
            Disposition::Buffer => {
                if let PendingBuffer::Buffering(queues) = &mut self.pending {
                    tracing::trace!(channel = %self.id, domain, "Buffering notification");
                    queues
                        .entry(domain.to_string())
                        .or_default()
                        .push_back(payload);
                }
            }
            Disposition::Drop => {
                tracing::trace!(channel = %self.id, domain, "Dropping notification (buffer discarded)");
            }
        }
    }

    /// Hand a payload to every listener in registration order, pruning dead ones.
    pub fn emit(&mut self, payload: String) {
        self.listeners
            .retain(|listener| listener.deliver(payload.clone()));
    }

    pub fn has_live_listener(&self) -> bool {
        self.listeners.iter().any(Registration::is_live)
    }

    /// Replay and drop the queue held for `domain`. Returns the number replayed.
    pub fn flush(&mut self, domain: &str) -> usize {
        if !self.has_live_listener() {
            return 0;
        }
        let queue = match &mut self.pending {
            PendingBuffer::Buffering(queues) => queues.remove(domain),
            PendingBuffer::Discarded => None,
        };
        let Some(queue) = queue else {
            return 0;
        };
        let replayed = queue.len();
        for payload in queue {
            self.deliver(domain, payload);
        }
        replayed
    }

    pub fn needs_timer(&self) -> bool {
        self.timer == DiscardTimer::Unarmed
    }

    pub fn mark_armed(&mut self) {
        self.timer = DiscardTimer::Armed;
    }

    pub fn add_listener(&mut self, id: ListenerId) -> Listener<String> {
        let (listener, tx) = Listener::new(id);
        self.listeners.push(Registration::new(id, tx));
        listener
    }

    pub fn remove_listener(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|listener| listener.id != id);
        self.listeners.len() != before
    }

    /// Drop every held payload for good. Returns how many were lost.
    pub fn discard(&mut self) -> usize {
        self.timer = DiscardTimer::Fired;
        std::mem::replace(&mut self.pending, PendingBuffer::Discarded)
            .buffered()
            .unwrap_or(0)
    }

    pub fn snapshot(&self) -> ChannelSnapshot {
        let mut enabled_domains: Vec<String> = self.enabled.iter().cloned().collect();
        enabled_domains.sort();
        ChannelSnapshot {
            id: self.id,
            name: self.name.to_string(),
            enabled_domains,
            buffered: self.pending.buffered(),
            listeners: self.listeners.iter().filter(|l| l.is_live()).count(),
        }
    }
}

/// Handle to one channel, presenting the shared connection as a private session.
///
/// Holds only a weak reference to the multiplexor; every operation fails with
/// [`MuxError::Closed`] once the multiplexor is gone.
#[derive(Debug, Clone)]
pub struct Channel {
    id: ChannelId,
    name: Arc<str>,
    shared: Weak<Shared>,
}

impl Channel {
    pub(crate) fn new(id: ChannelId, name: Arc<str>, shared: Weak<Shared>) -> Self {
        Self { id, name, shared }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn belongs_to(&self, shared: &Arc<Shared>) -> bool {
        std::ptr::eq(self.shared.as_ptr(), Arc::as_ptr(shared))
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared.upgrade().ok_or(MuxError::Closed)
    }

    /// Send a request on this channel.
    ///
    /// A `<Domain>.enable` request marks the domain enabled before it is written and
    /// then replays whatever was buffered for it. The whole sequence runs under the
    /// channel lock, so no inbound notification can slip in between.
    pub fn send(&self, text: &str) -> Result<()> {
        let shared = self.shared()?;
        let request = Request::parse(text).inspect_err(|e| {
            tracing::error!(channel = %self.id, error = %e, "Rejected outbound message");
        })?;
        let encoded = request.encode(self.id)?;
        let domain = request.enabled_domain();

        let state = shared.state(self.id).ok_or(MuxError::Closed)?;
        let mut state = lock(&state);

        if let Some(domain) = domain
            && state.enable(domain)
        {
            tracing::debug!(channel = %self.id, domain, "Domain enabled");
        }

        tracing::trace!(channel = %self.id, id = request.id(), method = ?request.method(), "Sending request");
        shared.write(encoded)?;

        if let Some(domain) = domain {
            let replayed = state.flush(domain);
            if replayed > 0 {
                tracing::debug!(channel = %self.id, domain, replayed, "Replayed buffered notifications");
            }
        }
        Ok(())
    }

    /// Register a message listener.
    ///
    /// The first registration ever arms the discard timer, which needs a tokio
    /// runtime; later registrations never re-arm it.
    pub fn on_message(&self) -> Result<Listener<String>> {
        let shared = self.shared()?;
        let state = shared.state(self.id).ok_or(MuxError::Closed)?;
        let mut state = lock(&state);

        let runtime = if state.needs_timer() {
            Some(
                tokio::runtime::Handle::try_current()
                    .map_err(|e| MuxError::Runtime(e.to_string()))?,
            )
        } else {
            None
        };

        let listener = state.add_listener(shared.next_listener_id());
        if let Some(runtime) = runtime {
            state.mark_armed();
            shared.spawn_discard_timer(&runtime, self.id);
            tracing::debug!(
                channel = %self.id,
                after_secs = shared.config().discard_after.as_secs_f64(),
                "Discard timer armed"
            );
        }
        Ok(listener)
    }

    /// Register for a connection-level event; shared with every other channel.
    pub fn on_event(&self, kind: EventKind) -> Result<Listener<ConnectionEvent>> {
        Ok(self.shared()?.add_event_listener(kind))
    }

    /// Remove a listener returned by [`Channel::on_message`] or [`Channel::on_event`].
    pub fn remove_listener(&self, id: ListenerId) -> Result<bool> {
        let shared = self.shared()?;
        let removed = match shared.state(self.id) {
            Some(state) => lock(&state).remove_listener(id),
            None => false,
        };
        Ok(removed || shared.remove_event_listener(id))
    }

    pub fn snapshot(&self) -> Result<ChannelSnapshot> {
        let shared = self.shared()?;
        let state = shared.state(self.id).ok_or(MuxError::Closed)?;
        let snapshot = lock(&state).snapshot();
        Ok(snapshot)
    }
}
