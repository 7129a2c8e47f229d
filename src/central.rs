//! Central facade.
//!
//! [`Central`] owns the radio driver handle, the event pump feeding the
//! bus, the per-peer connection registry, and the scanner. Connections
//! to different peers are independent; the registry enforces that at
//! most one Connecting/Connected entry exists per peer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex};

use crate::bus::EventBus;
use crate::connection::{Connection, ConnectionState};
use crate::driver::{DriverEvent, LinkState, RadioDriver};
use crate::error::CentralError;
use crate::scanner::Scanner;
use crate::types::PeerAddress;

/// Engine tuning knobs.
#[derive(Debug, Clone)]
pub struct CentralConfig {
    /// Time allowed for the driver to settle a connect attempt.
    pub connect_timeout: Duration,
    /// Time allowed for each driver response; the I/O coordinator
    /// retries once on expiry before surfacing `RequestTimeout`.
    pub request_timeout: Duration,
    /// MTU requested once the link is up. `None` skips negotiation
    /// and leaves the default of 23 in effect.
    pub preferred_mtu: Option<u16>,
    /// Run discovery as part of `connect`, so the returned connection
    /// is ready for attribute I/O.
    pub discover_on_connect: bool,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            preferred_mtu: Some(517),
            discover_on_connect: true,
        }
    }
}

pub(crate) struct Shared {
    connections: Mutex<HashMap<PeerAddress, Arc<Connection>>>,
    pub(crate) bus: EventBus,
    disconnects: broadcast::Sender<PeerAddress>,
}

impl Shared {
    /// Remove a connection from the registry and the bus, but only if
    /// the registry still maps the peer to this exact connection. A
    /// newer connection under the same address is left alone.
    async fn release(&self, conn: &Arc<Connection>) {
        let peer = conn.peer().clone();
        let removed = {
            let mut connections = self.connections.lock().await;
            match connections.get(&peer) {
                Some(current) if Arc::ptr_eq(current, conn) => {
                    connections.remove(&peer);
                    true
                }
                _ => false,
            }
        };
        if removed {
            self.bus.unregister(&peer).await;
        }
    }
}

/// BLE Central-role engine over a [`RadioDriver`].
pub struct Central {
    driver: Arc<dyn RadioDriver>,
    config: CentralConfig,
    scanner: Arc<Scanner>,
    shared: Arc<Shared>,
}

impl Central {
    /// Build an engine over a driver and its event channel.
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        events: mpsc::UnboundedReceiver<DriverEvent>,
    ) -> Self {
        Self::with_config(driver, events, CentralConfig::default())
    }

    pub fn with_config(
        driver: Arc<dyn RadioDriver>,
        events: mpsc::UnboundedReceiver<DriverEvent>,
        config: CentralConfig,
    ) -> Self {
        let scanner = Scanner::new(Arc::clone(&driver));
        let (disconnects, _) = broadcast::channel(16);
        let shared = Arc::new(Shared {
            connections: Mutex::new(HashMap::new()),
            bus: EventBus::new(),
            disconnects,
        });
        spawn_event_pump(Arc::clone(&shared), Arc::clone(&scanner), events);
        Self {
            driver,
            config,
            scanner,
            shared,
        }
    }

    /// The discovery-mode scanner. One scan session exists per radio.
    pub fn scanner(&self) -> Arc<Scanner> {
        Arc::clone(&self.scanner)
    }

    pub fn config(&self) -> &CentralConfig {
        &self.config
    }

    /// Peers whose link was lost without a requested disconnect.
    pub fn disconnections(&self) -> broadcast::Receiver<PeerAddress> {
        self.shared.disconnects.subscribe()
    }

    /// The live connection for a peer, if one exists.
    pub async fn connection(&self, peer: &PeerAddress) -> Option<Arc<Connection>> {
        self.shared.connections.lock().await.get(peer).cloned()
    }

    /// Connect to a peer.
    ///
    /// Fails with `AlreadyConnecting` when a connection for the peer is
    /// already Connecting or Connected. On success the link is up, the
    /// MTU is negotiated, and (with `discover_on_connect`) the
    /// attribute table is published.
    pub async fn connect(&self, peer: &PeerAddress) -> Result<Arc<Connection>, CentralError> {
        let conn = {
            let mut connections = self.shared.connections.lock().await;
            if let Some(existing) = connections.get(peer) {
                match existing.state() {
                    ConnectionState::Connecting | ConnectionState::Connected => {
                        return Err(CentralError::AlreadyConnecting(peer.clone()));
                    }
                    _ => {
                        connections.remove(peer);
                    }
                }
            }
            let conn = Connection::new(
                peer.clone(),
                Arc::clone(&self.driver),
                self.config.clone(),
            );
            // The mailbox is registered before the connect command goes
            // out, so no driver event can be lost in between.
            let (mailbox_tx, mailbox_rx) = mpsc::unbounded_channel();
            self.shared.bus.register(peer.clone(), mailbox_tx).await;
            connections.insert(peer.clone(), Arc::clone(&conn));
            spawn_connection_pump(
                Arc::clone(&self.shared),
                Arc::clone(&conn),
                mailbox_rx,
            );
            conn
        };

        if let Err(e) = self.driver.connect(peer).await {
            conn.teardown().await;
            self.shared.release(&conn).await;
            return Err(e);
        }

        let mut state_rx = conn.watch_state();
        let settled = state_rx.wait_for(|s| *s != ConnectionState::Connecting);
        // Copy the state out before acting on it: the watch ref from
        // wait_for holds a read lock that teardown's state update
        // would contend with.
        let settled = match tokio::time::timeout(self.config.connect_timeout, settled).await {
            Ok(Ok(state)) => Some(*state),
            Ok(Err(_closed)) => Some(ConnectionState::Disconnected),
            Err(_elapsed) => None,
        };
        match settled {
            Some(ConnectionState::Connected) => {}
            Some(_) => {
                // Driver reported failure; the pump races the same
                // cleanup, which release() tolerates.
                conn.teardown().await;
                self.shared.release(&conn).await;
                return Err(CentralError::ConnectFailed(peer.clone()));
            }
            None => {
                log::warn!("connect to {} timed out; cancelling", peer);
                let _ = self.driver.disconnect(peer).await;
                conn.teardown().await;
                self.shared.release(&conn).await;
                return Err(CentralError::ConnectFailed(peer.clone()));
            }
        }
        log::info!("connected to {}", peer);

        if let Some(size) = self.config.preferred_mtu {
            if let Err(e) = conn.request_mtu(size).await {
                log::warn!("mtu negotiation with {} failed: {}", peer, e);
            }
        }
        if self.config.discover_on_connect {
            if let Err(e) = conn.discover().await {
                let _ = self.disconnect(peer).await;
                return Err(e);
            }
        }
        Ok(conn)
    }

    /// Disconnect from a peer. A peer with no connection is a no-op,
    /// so calling this twice never errors.
    pub async fn disconnect(&self, peer: &PeerAddress) -> Result<(), CentralError> {
        let conn = { self.shared.connections.lock().await.get(peer).cloned() };
        let Some(conn) = conn else {
            return Ok(());
        };
        conn.begin_disconnect().await;
        if let Err(e) = self.driver.disconnect(peer).await {
            log::warn!(
                "disconnect command for {} failed: {}; forcing local teardown",
                peer,
                e
            );
            conn.teardown().await;
            self.shared.release(&conn).await;
            return Ok(());
        }
        let mut state_rx = conn.watch_state();
        let confirmed = state_rx.wait_for(|s| *s == ConnectionState::Disconnected);
        if tokio::time::timeout(self.config.request_timeout, confirmed)
            .await
            .is_err()
        {
            log::warn!("no disconnect confirmation for {}; forcing local teardown", peer);
        }
        conn.teardown().await;
        self.shared.release(&conn).await;
        log::info!("disconnected from {}", peer);
        Ok(())
    }
}

/// Route driver events to their single owner: advertisements to the
/// scanner, everything else to the addressed peer's mailbox.
fn spawn_event_pump(
    shared: Arc<Shared>,
    scanner: Arc<Scanner>,
    mut events: mpsc::UnboundedReceiver<DriverEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                DriverEvent::AdvertisementReceived(sighting) => {
                    scanner.ingest(sighting).await;
                }
                event => shared.bus.route(event).await,
            }
        }
        log::debug!("driver event stream ended");
    });
}

/// Per-connection pump: applies link transitions and hands the rest to
/// the connection. Ends when the link goes down or the mailbox closes.
fn spawn_connection_pump(
    shared: Arc<Shared>,
    conn: Arc<Connection>,
    mut mailbox: mpsc::UnboundedReceiver<DriverEvent>,
) {
    tokio::spawn(async move {
        while let Some(event) = mailbox.recv().await {
            match event {
                DriverEvent::ConnectionStateChanged {
                    state: LinkState::Connected,
                    ..
                } => conn.mark_link_up(),
                DriverEvent::ConnectionStateChanged {
                    state: LinkState::Disconnected,
                    ..
                } => {
                    let was = conn.state();
                    conn.teardown().await;
                    shared.release(&conn).await;
                    if was == ConnectionState::Connected {
                        // Unsolicited link loss is the only push
                        // transition; requested disconnects pass
                        // through Disconnecting first.
                        log::info!("link to {} lost", conn.peer());
                        let _ = shared.disconnects.send(conn.peer().clone());
                    }
                    break;
                }
                event => conn.handle_event(event).await,
            }
        }
    });
}
