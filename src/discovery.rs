//! Discovery engine.
//!
//! Enumerates services, their characteristics, and the configuration
//! descriptors of notifiable characteristics, publishing the result as
//! one immutable [`AttributeTable`]. Discovery is all-or-nothing: a
//! step that fails, times out, or is cut short by link loss publishes
//! nothing and surfaces `DiscoveryIncomplete`. A second call on a
//! discovered connection returns the cached table without reissuing
//! commands.

use std::sync::Arc;

use crate::connection::Connection;
use crate::error::CentralError;
use crate::io::{Expect, Outcome, RequestKind};
use crate::types::{cccd_uuid, AttributeTable, Characteristic, Descriptor, Service};

impl Connection {
    /// Run discovery, or return the already-published table.
    pub async fn discover(&self) -> Result<Arc<AttributeTable>, CentralError> {
        let _op = self.op_lock.lock().await;
        if let Some(table) = self.table.lock().await.clone() {
            return Ok(table);
        }
        self.ensure_connected()?;

        let service_infos = match self.discovery_exchange(Expect::Services).await? {
            Outcome::Services(infos) => infos,
            _ => return Err(CentralError::DiscoveryIncomplete),
        };

        let mut services = Vec::with_capacity(service_infos.len());
        for info in service_infos {
            let characteristic_infos = match self
                .discovery_exchange(Expect::Characteristics { service: info.uuid })
                .await?
            {
                Outcome::Characteristics(infos) => infos,
                _ => return Err(CentralError::DiscoveryIncomplete),
            };

            let mut characteristics = Vec::with_capacity(characteristic_infos.len());
            for c in characteristic_infos {
                let mut cccd = None;
                let mut descriptors = Vec::new();
                if c.properties.can_subscribe() {
                    let descriptor_infos = match self
                        .discovery_exchange(Expect::Descriptors {
                            characteristic: c.value_handle,
                        })
                        .await?
                    {
                        Outcome::Descriptors(infos) => infos,
                        _ => return Err(CentralError::DiscoveryIncomplete),
                    };
                    for d in descriptor_infos {
                        if d.uuid == cccd_uuid() {
                            cccd = Some(d.handle);
                        }
                        descriptors.push(Descriptor {
                            uuid: d.uuid,
                            handle: d.handle,
                        });
                    }
                }
                characteristics.push(Characteristic {
                    uuid: c.uuid,
                    properties: c.properties,
                    value_handle: c.value_handle,
                    cccd,
                    descriptors,
                });
            }
            services.push(Service {
                uuid: info.uuid,
                characteristics,
            });
        }

        let table = Arc::new(AttributeTable::new(services));
        *self.table.lock().await = Some(Arc::clone(&table));
        log::debug!(
            "discovery for {} complete: {} services",
            self.peer,
            table.services().len()
        );
        Ok(table)
    }

    /// One enumeration step: issue the matching driver command and
    /// await its completion event. Every failure mode collapses to
    /// `DiscoveryIncomplete` so no caller can observe a partial run.
    async fn discovery_exchange(&self, expect: Expect) -> Result<Outcome, CentralError> {
        self.ensure_connected()
            .map_err(|_| CentralError::DiscoveryIncomplete)?;
        let rx = self.arm(RequestKind::Discovery, expect.clone()).await;
        let issued = match &expect {
            Expect::Services => self.driver.enumerate_services(&self.peer).await,
            Expect::Characteristics { service } => {
                self.driver
                    .enumerate_characteristics(&self.peer, *service)
                    .await
            }
            Expect::Descriptors { characteristic } => {
                self.driver
                    .enumerate_descriptors(&self.peer, *characteristic)
                    .await
            }
            _ => Ok(()),
        };
        if let Err(e) = issued {
            self.disarm().await;
            log::debug!("discovery command for {} failed: {}", self.peer, e);
            return Err(CentralError::DiscoveryIncomplete);
        }
        self.await_response(rx).await.map_err(|e| {
            log::debug!("discovery step for {} aborted: {}", self.peer, e);
            CentralError::DiscoveryIncomplete
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::central::CentralConfig;
    use crate::driver::simulated::{SimCommand, SimPeripheral, SimRadio};
    use crate::driver::{DriverEvent, RadioDriver};
    use crate::types::{uuid16, CharacteristicProperties, Handle, PeerAddress};

    /// Forward driver events into the connection the way the central's
    /// pump would, minus registry bookkeeping.
    fn pump_events(
        conn: Arc<Connection>,
        mut rx: tokio::sync::mpsc::UnboundedReceiver<DriverEvent>,
    ) {
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match event {
                    DriverEvent::ConnectionStateChanged { .. } => {}
                    other => conn.handle_event(other).await,
                }
            }
        });
    }

    async fn connected_pair() -> (Arc<SimRadio>, Arc<Connection>, PeerAddress) {
        let (radio, events) = SimRadio::new();
        let peer = PeerAddress::Public([1, 2, 3, 4, 5, 6]);
        radio
            .add_peripheral(
                SimPeripheral::new(peer.clone())
                    .with_service(uuid16(0x180F))
                    .with_characteristic(
                        uuid16(0x2A19),
                        CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                        Handle(0x0003),
                        &[0x64],
                    ),
            )
            .await;
        let conn = Connection::new(
            peer.clone(),
            Arc::clone(&radio) as Arc<dyn RadioDriver>,
            CentralConfig::default(),
        );
        radio.connect(&peer).await.expect("sim connect");
        conn.mark_link_up();
        pump_events(Arc::clone(&conn), events);
        (radio, conn, peer)
    }

    #[tokio::test]
    async fn test_discover_builds_table_with_cccd() {
        let (_radio, conn, _peer) = connected_pair().await;
        let table = conn.discover().await.expect("discovery");

        assert_eq!(table.services().len(), 1);
        let characteristic = table
            .characteristic(Handle(0x0003))
            .expect("characteristic present");
        assert_eq!(characteristic.uuid, uuid16(0x2A19));
        assert_eq!(characteristic.cccd, Some(Handle(0x0004)));
    }

    #[tokio::test]
    async fn test_discover_is_idempotent() {
        let (radio, conn, _peer) = connected_pair().await;
        let first = conn.discover().await.expect("first discovery");
        let commands_after_first = radio.commands().await.len();

        let second = conn.discover().await.expect("second discovery");
        assert_eq!(first, second);
        assert_eq!(radio.commands().await.len(), commands_after_first);
    }

    #[tokio::test]
    async fn test_discover_requires_connected() {
        let (_radio, conn, _peer) = connected_pair().await;
        conn.teardown().await;
        assert_eq!(conn.discover().await, Err(CentralError::NotConnected));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_enumeration_is_incomplete_with_no_table() {
        let (radio, conn, _peer) = connected_pair().await;
        radio.set_respond_to_enumeration(false).await;

        assert_eq!(
            conn.discover().await,
            Err(CentralError::DiscoveryIncomplete)
        );
        assert!(conn.attribute_table().await.is_none());

        // Services were enumerated; the stall happened one level down.
        let commands = radio.commands().await;
        assert!(commands
            .iter()
            .any(|c| matches!(c, SimCommand::EnumerateServices(_))));
    }
}
