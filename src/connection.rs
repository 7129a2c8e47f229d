//! Per-peer connection lifecycle.
//!
//! A [`Connection`] owns all state for one peer: the lifecycle state
//! machine, the negotiated MTU, the attribute table published by
//! discovery, the single pending-request slot, and the notification
//! router. All transitions for a peer are serialized through its
//! operation lock and its event pump; connections to different peers
//! are fully independent.

use std::fmt;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};

use crate::central::CentralConfig;
use crate::driver::{DriverEvent, RadioDriver};
use crate::error::CentralError;
use crate::io::Pending;
use crate::notify::NotificationRouter;
use crate::types::{AttributeTable, PeerAddress};

/// MTU in effect before negotiation.
pub const DEFAULT_MTU: u16 = 23;

/// Lifecycle of a connection.
///
/// Legal transitions: Disconnected → Connecting → Connected →
/// Disconnecting → Disconnected. Link loss reported by the driver is
/// the only push transition and jumps straight to Disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        };
        f.write_str(name)
    }
}

/// An active (or establishing) connection to one peer.
pub struct Connection {
    pub(crate) peer: PeerAddress,
    pub(crate) driver: Arc<dyn RadioDriver>,
    pub(crate) config: CentralConfig,
    pub(crate) state_tx: watch::Sender<ConnectionState>,
    pub(crate) negotiated_mtu: AtomicU16,
    pub(crate) table: Mutex<Option<Arc<AttributeTable>>>,
    /// At most one request is in flight per connection; the transport
    /// is request/response, not pipelined.
    pub(crate) pending: Mutex<Option<Pending>>,
    pub(crate) router: NotificationRouter,
    /// Fair queue serializing operations; callers complete in FIFO
    /// order.
    pub(crate) op_lock: Mutex<()>,
}

impl Connection {
    pub(crate) fn new(
        peer: PeerAddress,
        driver: Arc<dyn RadioDriver>,
        config: CentralConfig,
    ) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Connecting);
        Arc::new(Self {
            peer,
            driver,
            config,
            state_tx,
            negotiated_mtu: AtomicU16::new(DEFAULT_MTU),
            table: Mutex::new(None),
            pending: Mutex::new(None),
            router: NotificationRouter::new(),
            op_lock: Mutex::new(()),
        })
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// The MTU negotiated with the peer, 23 until negotiation ran.
    pub fn mtu(&self) -> u16 {
        self.negotiated_mtu.load(Ordering::Relaxed)
    }

    /// Observe lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The attribute table, once discovery has completed.
    pub async fn attribute_table(&self) -> Option<Arc<AttributeTable>> {
        self.table.lock().await.clone()
    }

    pub(crate) fn ensure_connected(&self) -> Result<(), CentralError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(CentralError::NotConnected)
        }
    }

    /// Driver confirmed the link. Only meaningful while Connecting.
    pub(crate) fn mark_link_up(&self) {
        let moved = self.state_tx.send_if_modified(|s| {
            if *s == ConnectionState::Connecting {
                *s = ConnectionState::Connected;
                true
            } else {
                false
            }
        });
        if !moved {
            log::debug!("link-up for {} ignored in state {}", self.peer, self.state());
        }
    }

    /// Begin an orderly disconnect: move to Disconnecting and abort
    /// any in-flight request so its caller is released promptly.
    pub(crate) async fn begin_disconnect(&self) {
        self.state_tx.send_if_modified(|s| match s {
            ConnectionState::Connecting | ConnectionState::Connected => {
                *s = ConnectionState::Disconnecting;
                true
            }
            _ => false,
        });
        self.fail_pending(CentralError::NotConnected).await;
    }

    /// Final teardown: the connection is Disconnected, the attribute
    /// table is discarded, all subscriptions end, and any in-flight
    /// request fails with `NotConnected`.
    pub(crate) async fn teardown(&self) {
        self.state_tx.send_replace(ConnectionState::Disconnected);
        self.fail_pending(CentralError::NotConnected).await;
        *self.table.lock().await = None;
        self.router.clear().await;
    }

    pub(crate) async fn fail_pending(&self, err: CentralError) {
        if let Some(pending) = self.pending.lock().await.take() {
            pending.fail(err);
        }
    }

    pub(crate) fn apply_mtu(&self, mtu: u16) {
        self.negotiated_mtu.store(mtu, Ordering::Relaxed);
        log::debug!("mtu for {} is now {}", self.peer, mtu);
    }

    /// Dispatch one routed driver event. Link state changes are
    /// handled by the owning pump, which also needs the registry.
    pub(crate) async fn handle_event(&self, event: DriverEvent) {
        if let DriverEvent::AttributeChanged { handle, value, .. } = &event {
            self.router.deliver(*handle, value).await;
            return;
        }
        if let DriverEvent::MtuChanged { mtu, .. } = &event {
            self.apply_mtu(*mtu);
        }
        self.complete_pending(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::simulated::SimRadio;

    fn test_connection() -> Arc<Connection> {
        let (radio, _events) = SimRadio::new();
        Connection::new(
            PeerAddress::Public([1, 2, 3, 4, 5, 6]),
            radio,
            CentralConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_new_connection_is_connecting() {
        let conn = test_connection();
        assert_eq!(conn.state(), ConnectionState::Connecting);
        assert!(!conn.is_connected());
        assert_eq!(conn.mtu(), DEFAULT_MTU);
    }

    #[tokio::test]
    async fn test_link_up_only_from_connecting() {
        let conn = test_connection();
        conn.mark_link_up();
        assert_eq!(conn.state(), ConnectionState::Connected);

        conn.teardown().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // A stale link-up after teardown must not resurrect the link.
        conn.mark_link_up();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_begin_disconnect_transitions() {
        let conn = test_connection();
        conn.mark_link_up();
        conn.begin_disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnecting);

        // Idempotent once already past Disconnecting.
        conn.begin_disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnecting);
    }

    #[tokio::test]
    async fn test_watch_observes_transitions() {
        let conn = test_connection();
        let mut rx = conn.watch_state();
        conn.mark_link_up();
        let state = rx
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .expect("watch alive");
        assert_eq!(*state, ConnectionState::Connected);
    }

    #[test]
    fn test_state_display() {
        assert_eq!(ConnectionState::Connecting.to_string(), "connecting");
        assert_eq!(ConnectionState::Disconnected.to_string(), "disconnected");
    }
}
