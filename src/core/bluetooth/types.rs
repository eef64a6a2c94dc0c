//! Defines shared data structures for the Bluetooth module.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, stable identifier of a peripheral.
///
/// The platform decides its shape (a UUID on Apple platforms, an address
/// elsewhere). It is the only key an application may persist to find the
/// same device again later.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeripheralId(String);

impl PeripheralId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeripheralId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<Uuid> for PeripheralId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid.to_string())
    }
}

impl From<&str> for PeripheralId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Connection lifecycle of one peripheral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeripheralState {
    Discovered,
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

impl PeripheralState {
    /// Connecting, connected or disconnecting: a link exists or is being negotiated.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            PeripheralState::Connecting | PeripheralState::Connected | PeripheralState::Disconnecting
        )
    }
}

impl fmt::Display for PeripheralState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PeripheralState::Discovered => "discovered",
            PeripheralState::Connecting => "connecting",
            PeripheralState::Connected => "connected",
            PeripheralState::Disconnecting => "disconnecting",
            PeripheralState::Disconnected => "disconnected",
        };
        f.write_str(name)
    }
}

/// Manufacturer specific advertisement payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerData {
    pub company_id: u16,
    pub data: Vec<u8>,
}

/// One observation of an advertising peripheral.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdvertisementRecord {
    pub id: PeripheralId,
    /// Advertised local name, if any
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub services: Vec<Uuid>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub manufacturer_data: Option<ManufacturerData>,
    /// Wall clock time of the observation
    pub last_seen: DateTime<Utc>,
}

impl AdvertisementRecord {
    pub fn new(id: impl Into<PeripheralId>) -> Self {
        Self {
            id: id.into(),
            name: None,
            rssi: None,
            services: Vec::new(),
            service_data: HashMap::new(),
            manufacturer_data: None,
            last_seen: Utc::now(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_rssi(mut self, rssi: i16) -> Self {
        self.rssi = Some(rssi);
        self
    }

    pub fn with_service(mut self, service: Uuid) -> Self {
        self.services.push(service);
        self
    }

    pub fn with_manufacturer_data(mut self, company_id: u16, data: impl Into<Vec<u8>>) -> Self {
        self.manufacturer_data = Some(ManufacturerData {
            company_id,
            data: data.into(),
        });
        self
    }
}

/// Read-only view of a nearby peripheral, handed to UI layers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NearbyPeripheral {
    pub id: PeripheralId,
    pub name: Option<String>,
    pub rssi: Option<i16>,
    pub state: PeripheralState,
    pub last_seen: DateTime<Utc>,
}

/// Address of one characteristic on one peripheral.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CharacteristicTarget {
    pub peripheral: PeripheralId,
    pub service: Uuid,
    pub characteristic: Uuid,
}

impl CharacteristicTarget {
    pub fn new(peripheral: PeripheralId, service: Uuid, characteristic: Uuid) -> Self {
        Self {
            peripheral,
            service,
            characteristic,
        }
    }
}

impl fmt::Display for CharacteristicTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.peripheral, self.service, self.characteristic)
    }
}

/// A service as reported by the driver after service discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredService {
    pub uuid: Uuid,
    pub characteristics: Vec<Uuid>,
}

impl DiscoveredService {
    pub fn new(uuid: Uuid, characteristics: impl IntoIterator<Item = Uuid>) -> Self {
        Self {
            uuid,
            characteristics: characteristics.into_iter().collect(),
        }
    }

    pub fn has_characteristic(&self, uuid: Uuid) -> bool {
        self.characteristics.contains(&uuid)
    }
}

/// Whether `characteristic` of `service` is present in a discovery result.
pub(crate) fn is_reachable(services: &[DiscoveredService], service: Uuid, characteristic: Uuid) -> bool {
    services
        .iter()
        .any(|s| s.uuid == service && s.has_characteristic(characteristic))
}
