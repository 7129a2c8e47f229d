//! Core data model: peer addresses, attribute handles, the attribute
//! table published by discovery, and advertisement sightings.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::BitOr;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The Bluetooth base UUID with a 16-bit alias slotted in.
pub fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_0080_5f9b_34fb)
}

/// Client Characteristic Configuration Descriptor UUID (0x2902).
pub fn cccd_uuid() -> Uuid {
    uuid16(0x2902)
}

/// A peer device address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerAddress {
    /// A 6-byte MAC-style public or random address.
    Public([u8; 6]),
    /// A 128-bit identifier, used by platforms that hide the MAC
    /// and by the simulated driver.
    Uuid(Uuid),
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerAddress::Public(b) => write!(
                f,
                "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
                b[0], b[1], b[2], b[3], b[4], b[5]
            ),
            PeerAddress::Uuid(u) => write!(f, "{}", u),
        }
    }
}

/// Error from parsing a [`PeerAddress`] out of a string.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid peer address: {0:?}")]
pub struct AddressParseError(pub String);

impl FromStr for PeerAddress {
    type Err = AddressParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF` MAC notation or a hyphenated UUID.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() == 6 && parts.iter().all(|p| p.len() == 2) {
            let joined: String = parts.concat();
            let bytes =
                hex::decode(&joined).map_err(|_| AddressParseError(s.to_string()))?;
            let mut mac = [0u8; 6];
            mac.copy_from_slice(&bytes);
            return Ok(PeerAddress::Public(mac));
        }
        Uuid::parse_str(s)
            .map(PeerAddress::Uuid)
            .map_err(|_| AddressParseError(s.to_string()))
    }
}

/// An attribute handle on the peer's GATT server.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct Handle(pub u16);

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Characteristic property bitset, matching the on-air encoding.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize,
)]
pub struct CharacteristicProperties(pub u8);

impl CharacteristicProperties {
    pub const BROADCAST: Self = Self(0x01);
    pub const READ: Self = Self(0x02);
    pub const WRITE_WITHOUT_RESPONSE: Self = Self(0x04);
    pub const WRITE: Self = Self(0x08);
    pub const NOTIFY: Self = Self(0x10);
    pub const INDICATE: Self = Self(0x20);

    pub fn contains(&self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_read(&self) -> bool {
        self.contains(Self::READ)
    }

    pub fn can_write(&self) -> bool {
        self.contains(Self::WRITE)
    }

    pub fn can_write_without_response(&self) -> bool {
        self.contains(Self::WRITE_WITHOUT_RESPONSE)
    }

    pub fn can_notify(&self) -> bool {
        self.contains(Self::NOTIFY)
    }

    pub fn can_indicate(&self) -> bool {
        self.contains(Self::INDICATE)
    }

    /// True when the peripheral can push value changes at all.
    pub fn can_subscribe(&self) -> bool {
        self.can_notify() || self.can_indicate()
    }
}

impl BitOr for CharacteristicProperties {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// A descriptor attached to a characteristic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    pub uuid: Uuid,
    pub handle: Handle,
}

/// A characteristic within a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Characteristic {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub value_handle: Handle,
    /// Handle of the configuration descriptor, when the characteristic
    /// supports notify or indicate and the peripheral exposes one.
    pub cccd: Option<Handle>,
    pub descriptors: Vec<Descriptor>,
}

/// A service on the peer's GATT server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub uuid: Uuid,
    pub characteristics: Vec<Characteristic>,
}

/// The attribute table produced by discovery.
///
/// Services and characteristics are kept in the order the driver
/// reported them. The table is built once per connection, published
/// behind an `Arc`, and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeTable {
    services: Vec<Service>,
}

impl AttributeTable {
    pub(crate) fn new(services: Vec<Service>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &[Service] {
        &self.services
    }

    /// All characteristics across all services, in table order.
    pub fn characteristics(&self) -> impl Iterator<Item = &Characteristic> {
        self.services.iter().flat_map(|s| s.characteristics.iter())
    }

    /// Look up a characteristic by its value handle.
    pub fn characteristic(&self, handle: Handle) -> Option<&Characteristic> {
        self.characteristics().find(|c| c.value_handle == handle)
    }

    /// Look up a characteristic by UUID. Returns the first match in
    /// table order when a peripheral exposes the UUID more than once.
    pub fn characteristic_by_uuid(&self, uuid: &Uuid) -> Option<&Characteristic> {
        self.characteristics().find(|c| c.uuid == *uuid)
    }

    /// Resolve a characteristic UUID to its value handle.
    pub fn handle_of(&self, uuid: &Uuid) -> Option<Handle> {
        self.characteristic_by_uuid(uuid).map(|c| c.value_handle)
    }
}

/// A single received advertisement, deduplicated per peer by the
/// scanner engine (the most recent sighting wins).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementSighting {
    pub peer: PeerAddress,
    pub local_name: Option<String>,
    pub service_uuids: BTreeSet<Uuid>,
    /// Company identifier to payload bytes.
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    /// Advertised transmit power in dBm, when present in the payload.
    pub tx_power: Option<i8>,
    /// Received signal strength in dBm.
    pub rssi: i16,
    pub received_at: DateTime<Utc>,
}

impl AdvertisementSighting {
    pub fn new(peer: PeerAddress, rssi: i16) -> Self {
        Self {
            peer,
            local_name: None,
            service_uuids: BTreeSet::new(),
            manufacturer_data: HashMap::new(),
            service_data: HashMap::new(),
            tx_power: None,
            rssi,
            received_at: Utc::now(),
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.local_name = Some(name.into());
        self
    }

    pub fn advertising(mut self, service: Uuid) -> Self {
        self.service_uuids.insert(service);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_address_equality() {
        let a = PeerAddress::Public([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let b = PeerAddress::Public([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let c = PeerAddress::Public([0xFF, 0x02, 0x03, 0x04, 0x05, 0x06]);
        assert_eq!(a, b);
        assert_ne!(a, c);

        let u1 = PeerAddress::Uuid(Uuid::nil());
        let u2 = PeerAddress::Uuid(Uuid::nil());
        assert_eq!(u1, u2);

        // Public and Uuid are never equal
        assert_ne!(a, u1);
    }

    #[test]
    fn test_peer_address_display_and_parse() {
        let addr = PeerAddress::Public([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let rendered = addr.to_string();
        assert_eq!(rendered, "AA:BB:CC:DD:EE:FF");

        let parsed: PeerAddress = rendered.parse().expect("mac parses");
        assert_eq!(parsed, addr);

        let uuid = Uuid::new_v4();
        let parsed: PeerAddress = uuid.to_string().parse().expect("uuid parses");
        assert_eq!(parsed, PeerAddress::Uuid(uuid));

        assert!("not-an-address".parse::<PeerAddress>().is_err());
        assert!("AA:BB:CC:DD:EE".parse::<PeerAddress>().is_err());
    }

    #[test]
    fn test_uuid16_expands_onto_base() {
        assert_eq!(
            uuid16(0x2902).to_string(),
            "00002902-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(cccd_uuid(), uuid16(0x2902));
    }

    #[test]
    fn test_properties_bitset() {
        let props = CharacteristicProperties::READ | CharacteristicProperties::NOTIFY;
        assert!(props.can_read());
        assert!(props.can_notify());
        assert!(props.can_subscribe());
        assert!(!props.can_write());
        assert!(!props.can_indicate());

        let write_only = CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert!(write_only.can_write_without_response());
        assert!(!write_only.can_subscribe());
    }

    #[test]
    fn test_attribute_table_lookup() {
        let uuid_a = uuid16(0x2A19);
        let uuid_b = uuid16(0x2A6E);
        let table = AttributeTable::new(vec![Service {
            uuid: uuid16(0x180F),
            characteristics: vec![
                Characteristic {
                    uuid: uuid_a,
                    properties: CharacteristicProperties::READ,
                    value_handle: Handle(0x0003),
                    cccd: None,
                    descriptors: vec![],
                },
                Characteristic {
                    uuid: uuid_b,
                    properties: CharacteristicProperties::NOTIFY,
                    value_handle: Handle(0x0005),
                    cccd: Some(Handle(0x0006)),
                    descriptors: vec![],
                },
            ],
        }]);

        assert_eq!(table.characteristic(Handle(0x0003)).map(|c| c.uuid), Some(uuid_a));
        assert_eq!(table.handle_of(&uuid_b), Some(Handle(0x0005)));
        assert!(table.characteristic(Handle(0x0999)).is_none());
        assert_eq!(table.characteristics().count(), 2);
    }

    #[test]
    fn test_sighting_builder() {
        let svc = uuid16(0x180F);
        let s = AdvertisementSighting::new(
            PeerAddress::Public([1, 2, 3, 4, 5, 6]),
            -60,
        )
        .named("thermo")
        .advertising(svc);

        assert_eq!(s.local_name.as_deref(), Some("thermo"));
        assert!(s.service_uuids.contains(&svc));
        assert_eq!(s.rssi, -60);
    }
}
