//! Listener registrations handed out by channels and the multiplexor.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;

/// Identity of one registration, used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub(crate) u64);

impl std::fmt::Display for ListenerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

/// Receiving end of a registration.
///
/// Dropping it is equivalent to removing the listener; the sender side is pruned
/// on the next delivery.
#[derive(Debug)]
pub struct Listener<T> {
    id: ListenerId,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Listener<T> {
    pub(crate) fn new(id: ListenerId) -> (Self, mpsc::UnboundedSender<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, rx }, tx)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Wait for the next item. `None` once the listener was removed or the
    /// multiplexor is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next item if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Listener<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Sender side kept in a registry.
#[derive(Debug)]
pub(crate) struct Registration<T> {
    pub id: ListenerId,
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Registration<T> {
    pub fn new(id: ListenerId, tx: mpsc::UnboundedSender<T>) -> Self {
        Self { id, tx }
    }

    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Returns false when the receiving side is gone.
    pub fn deliver(&self, item: T) -> bool {
        self.tx.send(item).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn delivered_items_arrive_in_order() {
        let (mut listener, tx) = Listener::new(ListenerId(1));
        let registration = Registration::new(listener.id(), tx);

        assert!(registration.deliver("first"));
        assert!(registration.deliver("second"));

        assert_eq!(listener.recv().await, Some("first"));
        assert_eq!(listener.next().await, Some("second"));
        assert_eq!(listener.try_recv(), None);
    }

    #[test]
    fn dropped_listener_is_not_live() {
        let (listener, tx) = Listener::<String>::new(ListenerId(2));
        let registration = Registration::new(listener.id(), tx);
        assert!(registration.is_live());

        drop(listener);
        assert!(!registration.is_live());
        assert!(!registration.deliver("gone".to_string()));
    }
}
