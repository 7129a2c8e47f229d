//! Event bus: routes each driver event to its single owner.
//!
//! Connection-scoped events go to the mailbox registered for the peer;
//! events for peers nobody owns are dropped with a debug log. Mailboxes
//! are unbounded so routing never blocks the pump task behind a slow
//! connection.

use std::collections::HashMap;

use tokio::sync::{mpsc, Mutex};

use crate::driver::DriverEvent;
use crate::types::PeerAddress;

pub(crate) struct EventBus {
    peers: Mutex<HashMap<PeerAddress, mpsc::UnboundedSender<DriverEvent>>>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
        }
    }

    /// Register the mailbox owning a peer's events. Replaces any prior
    /// registration, closing the old mailbox.
    pub(crate) async fn register(
        &self,
        peer: PeerAddress,
        mailbox: mpsc::UnboundedSender<DriverEvent>,
    ) {
        self.peers.lock().await.insert(peer, mailbox);
    }

    pub(crate) async fn unregister(&self, peer: &PeerAddress) {
        self.peers.lock().await.remove(peer);
    }

    /// Deliver a connection-scoped event to exactly its owner.
    pub(crate) async fn route(&self, event: DriverEvent) {
        let Some(peer) = event.peer().cloned() else {
            log::debug!("unroutable driver event: {:?}", event);
            return;
        };
        let peers = self.peers.lock().await;
        match peers.get(&peer) {
            Some(mailbox) => {
                if mailbox.send(event).is_err() {
                    log::debug!("mailbox for {} is closed; event dropped", peer);
                }
            }
            None => log::debug!("no owner for event from {}; dropped", peer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::LinkState;

    #[tokio::test]
    async fn test_routes_to_owner_only() {
        let bus = EventBus::new();
        let peer_a = PeerAddress::Public([1, 1, 1, 1, 1, 1]);
        let peer_b = PeerAddress::Public([2, 2, 2, 2, 2, 2]);
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        bus.register(peer_a.clone(), tx_a).await;
        bus.register(peer_b.clone(), tx_b).await;

        bus.route(DriverEvent::ConnectionStateChanged {
            peer: peer_a.clone(),
            state: LinkState::Connected,
        })
        .await;

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unowned_events_are_dropped() {
        let bus = EventBus::new();
        bus.route(DriverEvent::ConnectionStateChanged {
            peer: PeerAddress::Public([3, 3, 3, 3, 3, 3]),
            state: LinkState::Disconnected,
        })
        .await;
    }
}
