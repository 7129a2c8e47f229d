//! Radio driver boundary.
//!
//! The engine never talks to a platform BLE stack directly. Commands go
//! out through the [`RadioDriver`] trait; completions and unsolicited
//! events come back as [`DriverEvent`]s on the channel handed to
//! [`Central::new`](crate::Central::new). The [`simulated`] module
//! provides a complete in-process driver for tests and demos.

pub mod simulated;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CentralError;
use crate::types::{
    AdvertisementSighting, CharacteristicProperties, Handle, PeerAddress,
};

/// A service as reported by the driver during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
}

/// A characteristic as reported by the driver during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value_handle: Handle,
}

/// A descriptor as reported by the driver during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorInfo {
    pub uuid: Uuid,
    pub handle: Handle,
}

/// Link-layer connection state as reported by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connected,
    Disconnected,
}

/// Events emitted by the radio driver.
///
/// Each event is consumed by exactly one owner: the addressed peer's
/// connection, or the scanner for advertisements.
#[derive(Debug, Clone)]
pub enum DriverEvent {
    ConnectionStateChanged {
        peer: PeerAddress,
        state: LinkState,
    },
    ServicesDiscovered {
        peer: PeerAddress,
        services: Vec<ServiceInfo>,
    },
    CharacteristicsDiscovered {
        peer: PeerAddress,
        service: Uuid,
        characteristics: Vec<CharacteristicInfo>,
    },
    DescriptorsDiscovered {
        peer: PeerAddress,
        characteristic: Handle,
        descriptors: Vec<DescriptorInfo>,
    },
    AttributeReadCompleted {
        peer: PeerAddress,
        handle: Handle,
        value: Vec<u8>,
        ok: bool,
    },
    AttributeWriteCompleted {
        peer: PeerAddress,
        handle: Handle,
        ok: bool,
    },
    AttributeChanged {
        peer: PeerAddress,
        handle: Handle,
        value: Vec<u8>,
    },
    MtuChanged {
        peer: PeerAddress,
        mtu: u16,
    },
    AdvertisementReceived(AdvertisementSighting),
}

impl DriverEvent {
    /// The peer a connection-scoped event belongs to. Advertisements
    /// are not connection-scoped and return `None`.
    pub fn peer(&self) -> Option<&PeerAddress> {
        match self {
            DriverEvent::ConnectionStateChanged { peer, .. }
            | DriverEvent::ServicesDiscovered { peer, .. }
            | DriverEvent::CharacteristicsDiscovered { peer, .. }
            | DriverEvent::DescriptorsDiscovered { peer, .. }
            | DriverEvent::AttributeReadCompleted { peer, .. }
            | DriverEvent::AttributeWriteCompleted { peer, .. }
            | DriverEvent::AttributeChanged { peer, .. }
            | DriverEvent::MtuChanged { peer, .. } => Some(peer),
            DriverEvent::AdvertisementReceived(_) => None,
        }
    }
}

/// Commands the engine issues to the host radio.
///
/// Methods return once the driver has accepted the command; results
/// arrive later as [`DriverEvent`]s. Implementations must be cheap to
/// call from multiple tasks.
#[async_trait]
pub trait RadioDriver: Send + Sync {
    async fn connect(&self, peer: &PeerAddress) -> Result<(), CentralError>;

    async fn disconnect(&self, peer: &PeerAddress) -> Result<(), CentralError>;

    async fn enumerate_services(&self, peer: &PeerAddress) -> Result<(), CentralError>;

    async fn enumerate_characteristics(
        &self,
        peer: &PeerAddress,
        service: Uuid,
    ) -> Result<(), CentralError>;

    async fn enumerate_descriptors(
        &self,
        peer: &PeerAddress,
        characteristic: Handle,
    ) -> Result<(), CentralError>;

    async fn read_attribute(
        &self,
        peer: &PeerAddress,
        handle: Handle,
    ) -> Result<(), CentralError>;

    async fn write_attribute(
        &self,
        peer: &PeerAddress,
        handle: Handle,
        value: &[u8],
        ack_required: bool,
    ) -> Result<(), CentralError>;

    async fn start_scan(&self) -> Result<(), CentralError>;

    async fn stop_scan(&self) -> Result<(), CentralError>;

    async fn request_mtu(&self, peer: &PeerAddress, size: u16) -> Result<(), CentralError>;
}
