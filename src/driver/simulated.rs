//! In-process simulated radio driver.
//!
//! Provides a scriptable [`RadioDriver`] backed by a registry of
//! peripheral definitions, so the whole engine can be exercised
//! without BLE hardware. Tests inject link loss, notifications, and
//! advertisements directly, and assert on the command log.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{
    CharacteristicInfo, DescriptorInfo, DriverEvent, LinkState, RadioDriver, ServiceInfo,
};
use crate::error::CentralError;
use crate::types::{
    cccd_uuid, AdvertisementSighting, CharacteristicProperties, Handle, PeerAddress,
};

#[derive(Debug, Clone)]
struct SimCharacteristic {
    uuid: Uuid,
    properties: CharacteristicProperties,
    value_handle: Handle,
    cccd: Option<Handle>,
}

#[derive(Debug, Clone)]
struct SimService {
    uuid: Uuid,
    characteristics: Vec<SimCharacteristic>,
}

/// Definition of a simulated peripheral.
///
/// Built with the fluent methods and registered on a [`SimRadio`].
/// Characteristics that support notify or indicate get a configuration
/// descriptor at `value_handle + 1`, mirroring the usual attribute
/// layout on real peripherals.
#[derive(Debug, Clone)]
pub struct SimPeripheral {
    address: PeerAddress,
    name: Option<String>,
    mtu: u16,
    services: Vec<SimService>,
    initial_values: Vec<(Handle, Vec<u8>)>,
}

impl SimPeripheral {
    pub fn new(address: PeerAddress) -> Self {
        Self {
            address,
            name: None,
            mtu: 247,
            services: Vec::new(),
            initial_values: Vec::new(),
        }
    }

    /// A peripheral with a generated 128-bit address.
    pub fn with_random_address() -> Self {
        Self::new(PeerAddress::Uuid(Uuid::new_v4()))
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// The MTU this peripheral will negotiate down to.
    pub fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    pub fn with_service(mut self, uuid: Uuid) -> Self {
        self.services.push(SimService {
            uuid,
            characteristics: Vec::new(),
        });
        self
    }

    /// Add a characteristic to the most recently added service.
    pub fn with_characteristic(
        mut self,
        uuid: Uuid,
        properties: CharacteristicProperties,
        value_handle: Handle,
        initial_value: &[u8],
    ) -> Self {
        let cccd = properties.can_subscribe().then(|| Handle(value_handle.0 + 1));
        if let Some(service) = self.services.last_mut() {
            service.characteristics.push(SimCharacteristic {
                uuid,
                properties,
                value_handle,
                cccd,
            });
            self.initial_values.push((value_handle, initial_value.to_vec()));
        }
        self
    }
}

/// Commands recorded by the simulated driver, in issue order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SimCommand {
    Connect(PeerAddress),
    Disconnect(PeerAddress),
    EnumerateServices(PeerAddress),
    EnumerateCharacteristics(PeerAddress, Uuid),
    EnumerateDescriptors(PeerAddress, Handle),
    Read(PeerAddress, Handle),
    Write {
        peer: PeerAddress,
        handle: Handle,
        value: Vec<u8>,
        ack: bool,
    },
    StartScan,
    StopScan,
    RequestMtu(PeerAddress, u16),
}

struct SimState {
    peripherals: HashMap<PeerAddress, SimPeripheral>,
    connected: HashSet<PeerAddress>,
    values: HashMap<(PeerAddress, Handle), Vec<u8>>,
    commands: Vec<SimCommand>,
    powered: bool,
    respond_to_reads: bool,
    respond_to_writes: bool,
    respond_to_enumeration: bool,
    scanning: bool,
}

/// The simulated radio.
pub struct SimRadio {
    events: mpsc::UnboundedSender<DriverEvent>,
    state: Mutex<SimState>,
}

impl SimRadio {
    /// Create a radio and the event channel to feed into
    /// [`Central::new`](crate::Central::new).
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DriverEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let radio = Arc::new(Self {
            events,
            state: Mutex::new(SimState {
                peripherals: HashMap::new(),
                connected: HashSet::new(),
                values: HashMap::new(),
                commands: Vec::new(),
                powered: true,
                respond_to_reads: true,
                respond_to_writes: true,
                respond_to_enumeration: true,
                scanning: false,
            }),
        });
        (radio, rx)
    }

    pub async fn add_peripheral(&self, peripheral: SimPeripheral) {
        let mut state = self.state.lock().await;
        for (handle, value) in &peripheral.initial_values {
            state
                .values
                .insert((peripheral.address.clone(), *handle), value.clone());
        }
        state
            .peripherals
            .insert(peripheral.address.clone(), peripheral);
    }

    /// Power the radio on or off. Commands on a powered-off radio fail
    /// with `DriverUnavailable`.
    pub async fn set_powered(&self, powered: bool) {
        self.state.lock().await.powered = powered;
    }

    /// Stop answering read commands, leaving them to time out.
    pub async fn set_respond_to_reads(&self, respond: bool) {
        self.state.lock().await.respond_to_reads = respond;
    }

    /// Stop answering acknowledged writes, leaving them to time out.
    pub async fn set_respond_to_writes(&self, respond: bool) {
        self.state.lock().await.respond_to_writes = respond;
    }

    /// Stop answering characteristic and descriptor enumeration,
    /// stalling discovery mid-run.
    pub async fn set_respond_to_enumeration(&self, respond: bool) {
        self.state.lock().await.respond_to_enumeration = respond;
    }

    /// The commands issued so far, in order.
    pub async fn commands(&self) -> Vec<SimCommand> {
        self.state.lock().await.commands.clone()
    }

    /// Current stored value of an attribute, including descriptor
    /// values written through the engine.
    pub async fn value(&self, peer: &PeerAddress, handle: Handle) -> Option<Vec<u8>> {
        self.state
            .lock()
            .await
            .values
            .get(&(peer.clone(), handle))
            .cloned()
    }

    pub async fn is_scanning(&self) -> bool {
        self.state.lock().await.scanning
    }

    /// Inject a raw driver event.
    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn emit_advertisement(&self, sighting: AdvertisementSighting) {
        self.emit(DriverEvent::AdvertisementReceived(sighting));
    }

    /// Drop the link to a peer without a disconnect command, as a
    /// supervision timeout would.
    pub async fn emit_link_loss(&self, peer: &PeerAddress) {
        self.state.lock().await.connected.remove(peer);
        self.emit(DriverEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state: LinkState::Disconnected,
        });
    }

    /// Push a characteristic value change from the peripheral.
    pub fn notify(&self, peer: &PeerAddress, handle: Handle, value: &[u8]) {
        self.emit(DriverEvent::AttributeChanged {
            peer: peer.clone(),
            handle,
            value: value.to_vec(),
        });
    }

    fn ensure_powered(state: &SimState) -> Result<(), CentralError> {
        if state.powered {
            Ok(())
        } else {
            Err(CentralError::DriverUnavailable("radio is powered off".into()))
        }
    }
}

#[async_trait]
impl RadioDriver for SimRadio {
    async fn connect(&self, peer: &PeerAddress) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state.commands.push(SimCommand::Connect(peer.clone()));
        let link = if state.peripherals.contains_key(peer) {
            state.connected.insert(peer.clone());
            LinkState::Connected
        } else {
            LinkState::Disconnected
        };
        drop(state);
        self.emit(DriverEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state: link,
        });
        Ok(())
    }

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        state.commands.push(SimCommand::Disconnect(peer.clone()));
        state.connected.remove(peer);
        drop(state);
        self.emit(DriverEvent::ConnectionStateChanged {
            peer: peer.clone(),
            state: LinkState::Disconnected,
        });
        Ok(())
    }

    async fn enumerate_services(&self, peer: &PeerAddress) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state
            .commands
            .push(SimCommand::EnumerateServices(peer.clone()));
        if !state.connected.contains(peer) {
            return Ok(());
        }
        let services: Vec<ServiceInfo> = state
            .peripherals
            .get(peer)
            .map(|p| p.services.iter().map(|s| ServiceInfo { uuid: s.uuid }).collect())
            .unwrap_or_default();
        drop(state);
        self.emit(DriverEvent::ServicesDiscovered {
            peer: peer.clone(),
            services,
        });
        Ok(())
    }

    async fn enumerate_characteristics(
        &self,
        peer: &PeerAddress,
        service: Uuid,
    ) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state
            .commands
            .push(SimCommand::EnumerateCharacteristics(peer.clone(), service));
        if !state.connected.contains(peer) || !state.respond_to_enumeration {
            return Ok(());
        }
        let characteristics: Vec<CharacteristicInfo> = state
            .peripherals
            .get(peer)
            .and_then(|p| p.services.iter().find(|s| s.uuid == service))
            .map(|s| {
                s.characteristics
                    .iter()
                    .map(|c| CharacteristicInfo {
                        uuid: c.uuid,
                        properties: c.properties,
                        value_handle: c.value_handle,
                    })
                    .collect()
            })
            .unwrap_or_default();
        drop(state);
        self.emit(DriverEvent::CharacteristicsDiscovered {
            peer: peer.clone(),
            service,
            characteristics,
        });
        Ok(())
    }

    async fn enumerate_descriptors(
        &self,
        peer: &PeerAddress,
        characteristic: Handle,
    ) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state
            .commands
            .push(SimCommand::EnumerateDescriptors(peer.clone(), characteristic));
        if !state.connected.contains(peer) || !state.respond_to_enumeration {
            return Ok(());
        }
        let descriptors: Vec<DescriptorInfo> = state
            .peripherals
            .get(peer)
            .and_then(|p| {
                p.services
                    .iter()
                    .flat_map(|s| s.characteristics.iter())
                    .find(|c| c.value_handle == characteristic)
            })
            .and_then(|c| c.cccd)
            .map(|handle| {
                vec![DescriptorInfo {
                    uuid: cccd_uuid(),
                    handle,
                }]
            })
            .unwrap_or_default();
        drop(state);
        self.emit(DriverEvent::DescriptorsDiscovered {
            peer: peer.clone(),
            characteristic,
            descriptors,
        });
        Ok(())
    }

    async fn read_attribute(
        &self,
        peer: &PeerAddress,
        handle: Handle,
    ) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state.commands.push(SimCommand::Read(peer.clone(), handle));
        if !state.respond_to_reads {
            return Ok(());
        }
        let stored = state.values.get(&(peer.clone(), handle)).cloned();
        let ok = state.connected.contains(peer) && stored.is_some();
        drop(state);
        self.emit(DriverEvent::AttributeReadCompleted {
            peer: peer.clone(),
            handle,
            value: stored.unwrap_or_default(),
            ok,
        });
        Ok(())
    }

    async fn write_attribute(
        &self,
        peer: &PeerAddress,
        handle: Handle,
        value: &[u8],
        ack_required: bool,
    ) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state.commands.push(SimCommand::Write {
            peer: peer.clone(),
            handle,
            value: value.to_vec(),
            ack: ack_required,
        });
        let ok = state.connected.contains(peer);
        if ok {
            state.values.insert((peer.clone(), handle), value.to_vec());
        }
        let respond = ack_required && state.respond_to_writes;
        drop(state);
        if respond {
            self.emit(DriverEvent::AttributeWriteCompleted {
                peer: peer.clone(),
                handle,
                ok,
            });
        }
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state.commands.push(SimCommand::StartScan);
        state.scanning = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        state.commands.push(SimCommand::StopScan);
        state.scanning = false;
        Ok(())
    }

    async fn request_mtu(&self, peer: &PeerAddress, size: u16) -> Result<(), CentralError> {
        let mut state = self.state.lock().await;
        Self::ensure_powered(&state)?;
        state
            .commands
            .push(SimCommand::RequestMtu(peer.clone(), size));
        if !state.connected.contains(peer) {
            return Ok(());
        }
        let mtu = state
            .peripherals
            .get(peer)
            .map(|p| size.min(p.mtu))
            .unwrap_or(size);
        drop(state);
        self.emit(DriverEvent::MtuChanged {
            peer: peer.clone(),
            mtu,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery_peripheral() -> SimPeripheral {
        SimPeripheral::new(PeerAddress::Public([1, 2, 3, 4, 5, 6]))
            .named("sensor")
            .with_service(crate::types::uuid16(0x180F))
            .with_characteristic(
                crate::types::uuid16(0x2A19),
                CharacteristicProperties::READ | CharacteristicProperties::NOTIFY,
                Handle(0x0003),
                &[0x64],
            )
    }

    #[tokio::test]
    async fn test_connect_reports_link_up_for_known_peer() {
        let (radio, mut events) = SimRadio::new();
        let peripheral = battery_peripheral();
        let peer = peripheral.address().clone();
        radio.add_peripheral(peripheral).await;

        radio.connect(&peer).await.unwrap();
        match events.recv().await.unwrap() {
            DriverEvent::ConnectionStateChanged { peer: p, state } => {
                assert_eq!(p, peer);
                assert_eq!(state, LinkState::Connected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
        assert_eq!(radio.commands().await, vec![SimCommand::Connect(peer)]);
    }

    #[tokio::test]
    async fn test_connect_reports_failure_for_unknown_peer() {
        let (radio, mut events) = SimRadio::new();
        let peer = PeerAddress::Public([9, 9, 9, 9, 9, 9]);

        radio.connect(&peer).await.unwrap();
        match events.recv().await.unwrap() {
            DriverEvent::ConnectionStateChanged { state, .. } => {
                assert_eq!(state, LinkState::Disconnected);
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_powered_off_radio_refuses_commands() {
        let (radio, _events) = SimRadio::new();
        radio.set_powered(false).await;
        let peer = PeerAddress::Public([1, 2, 3, 4, 5, 6]);
        assert!(matches!(
            radio.connect(&peer).await,
            Err(CentralError::DriverUnavailable(_))
        ));
        assert!(matches!(
            radio.start_scan().await,
            Err(CentralError::DriverUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn test_cccd_assigned_next_to_value_handle() {
        let (radio, mut events) = SimRadio::new();
        let peripheral = battery_peripheral();
        let peer = peripheral.address().clone();
        radio.add_peripheral(peripheral).await;
        radio.connect(&peer).await.unwrap();
        let _ = events.recv().await;

        radio.enumerate_descriptors(&peer, Handle(0x0003)).await.unwrap();
        match events.recv().await.unwrap() {
            DriverEvent::DescriptorsDiscovered { descriptors, .. } => {
                assert_eq!(descriptors.len(), 1);
                assert_eq!(descriptors[0].handle, Handle(0x0004));
                assert_eq!(descriptors[0].uuid, cccd_uuid());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_silent_reads_when_disabled() {
        let (radio, mut events) = SimRadio::new();
        let peripheral = battery_peripheral();
        let peer = peripheral.address().clone();
        radio.add_peripheral(peripheral).await;
        radio.connect(&peer).await.unwrap();
        let _ = events.recv().await;

        radio.set_respond_to_reads(false).await;
        radio.read_attribute(&peer, Handle(0x0003)).await.unwrap();
        assert!(events.try_recv().is_err());
        // The command was still recorded.
        let commands = radio.commands().await;
        assert!(commands.contains(&SimCommand::Read(peer, Handle(0x0003))));
    }
}
