//! Notification router.
//!
//! Demultiplexes attribute-change events to per-characteristic
//! subscribers. Delivery happens in registration order over unbounded
//! channels, so a subscriber that never drains cannot stall the event
//! pump or other subscribers. An event for a handle with no subscribers
//! is dropped silently; late notifications after an unsubscribe are
//! expected, not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::{mpsc, Mutex};

use crate::types::Handle;

/// Identity of one registered notification consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

/// Stream of value updates for one characteristic subscription.
///
/// The stream ends (`recv` returns `None`) when the subscription is
/// removed, the connection is torn down, or the link is lost.
#[derive(Debug)]
pub struct Notifications {
    id: SubscriberId,
    handle: Handle,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

impl Notifications {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// The characteristic value handle this subscription is for.
    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub async fn recv(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking poll, mainly for tests and draining.
    pub fn try_recv(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

/// Per-connection router from value handles to subscribers.
pub(crate) struct NotificationRouter {
    subscribers: Mutex<HashMap<Handle, Vec<Subscriber>>>,
    next_id: AtomicU64,
}

impl NotificationRouter {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
        }
    }

    /// Register a consumer for a handle. Registration order is
    /// preserved for delivery.
    pub(crate) async fn register(&self, handle: Handle) -> Notifications {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .await
            .entry(handle)
            .or_default()
            .push(Subscriber { id, tx });
        Notifications { id, handle, rx }
    }

    /// Remove a consumer. Returns `(removed, now_empty)` so the caller
    /// can decide whether the configuration descriptor should be
    /// disabled on the peripheral.
    pub(crate) async fn unregister(&self, handle: Handle, id: SubscriberId) -> (bool, bool) {
        let mut subs = self.subscribers.lock().await;
        let Some(list) = subs.get_mut(&handle) else {
            return (false, false);
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() < before;
        let now_empty = list.is_empty();
        if now_empty {
            subs.remove(&handle);
        }
        (removed, now_empty)
    }

    /// Deliver a value change to every subscriber of the handle, in
    /// registration order. Subscribers whose stream was dropped are
    /// pruned on the way through.
    pub(crate) async fn deliver(&self, handle: Handle, value: &[u8]) {
        let mut subs = self.subscribers.lock().await;
        let Some(list) = subs.get_mut(&handle) else {
            log::trace!("notification on {} with no subscribers; dropped", handle);
            return;
        };
        list.retain(|s| s.tx.send(value.to_vec()).is_ok());
        if list.is_empty() {
            subs.remove(&handle);
        }
    }

    /// Drop every subscription, ending all streams.
    pub(crate) async fn clear(&self) {
        self.subscribers.lock().await.clear();
    }

    #[cfg(test)]
    async fn subscriber_count(&self, handle: Handle) -> usize {
        self.subscribers
            .lock()
            .await
            .get(&handle)
            .map(|l| l.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivery_in_registration_order() {
        let router = NotificationRouter::new();
        let handle = Handle(0x0010);
        let mut first = router.register(handle).await;
        let mut second = router.register(handle).await;

        router.deliver(handle, &[0xAB]).await;

        assert_eq!(first.recv().await, Some(vec![0xAB]));
        assert_eq!(second.recv().await, Some(vec![0xAB]));
    }

    #[tokio::test]
    async fn test_zero_subscribers_is_a_no_op() {
        let router = NotificationRouter::new();
        router.deliver(Handle(0x0010), &[0x01]).await;
    }

    #[tokio::test]
    async fn test_slow_subscriber_does_not_block_others() {
        let router = NotificationRouter::new();
        let handle = Handle(0x0010);
        let slow = router.register(handle).await;
        let mut live = router.register(handle).await;

        for i in 0..100u8 {
            router.deliver(handle, &[i]).await;
        }

        // The undrained subscriber buffered everything; the live one
        // still sees each value promptly.
        assert_eq!(live.recv().await, Some(vec![0]));
        drop(slow);
    }

    #[tokio::test]
    async fn test_unregister_reports_last_consumer() {
        let router = NotificationRouter::new();
        let handle = Handle(0x0010);
        let first = router.register(handle).await;
        let second = router.register(handle).await;

        assert_eq!(router.unregister(handle, first.id()).await, (true, false));
        assert_eq!(router.unregister(handle, second.id()).await, (true, true));
        assert_eq!(router.unregister(handle, second.id()).await, (false, false));
    }

    #[tokio::test]
    async fn test_clear_ends_streams() {
        let router = NotificationRouter::new();
        let mut stream = router.register(Handle(0x0010)).await;
        router.clear().await;
        assert_eq!(stream.recv().await, None);
    }

    #[tokio::test]
    async fn test_dropped_streams_are_pruned() {
        let router = NotificationRouter::new();
        let handle = Handle(0x0010);
        let stream = router.register(handle).await;
        drop(stream);
        router.deliver(handle, &[0x01]).await;
        assert_eq!(router.subscriber_count(handle).await, 0);
    }
}
