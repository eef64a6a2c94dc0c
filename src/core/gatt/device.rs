//! Declarative device models.
//!
//! A device model declares its services and characteristics once, through an
//! explicit registration call per field. Each call hands back the accessor the
//! model stores, while the declaration records the same accessor in a tree the
//! engine later walks to bind everything to a live connection.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::core::bluetooth::commands::LinkRequest;
use crate::core::bluetooth::types::{PeripheralId, PeripheralState};
use crate::core::gatt::characteristic::{Characteristic, CharacteristicBinding};
use crate::core::gatt::codec::CharacteristicValue;
use crate::error::{Error, Result};

/// A device type the engine can bind to a connected peripheral.
///
/// `declare` runs once per connection and must be cheap and side-effect
/// free; `configure` runs after every declared field is bound.
///
/// ```
/// use gatt_bridge::{Characteristic, DeviceDeclaration, DeviceModel};
/// use gatt_bridge::core::bluetooth::{UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE};
///
/// struct Thermometer {
///     battery_level: Characteristic<u8>,
/// }
///
/// impl DeviceModel for Thermometer {
///     fn declare(device: &mut DeviceDeclaration) -> Self {
///         let battery_level = device.service(UUID_BATTERY_SERVICE, |service| {
///             service.notifying_characteristic(UUID_BATTERY_LEVEL)
///         });
///         Thermometer { battery_level }
///     }
/// }
/// ```
pub trait DeviceModel: Send + Sync + Sized + 'static {
    fn declare(device: &mut DeviceDeclaration) -> Self;

    /// Hook run once all services and characteristics are bound.
    fn configure(&self) {}
}

pub(crate) struct DeclaredCharacteristic {
    pub uuid: Uuid,
    pub notify: bool,
    pub binding: Arc<dyn CharacteristicBinding>,
}

pub(crate) struct DeclaredService {
    pub uuid: Uuid,
    pub characteristics: Vec<DeclaredCharacteristic>,
}

/// Collects the fields of one device model instance.
#[derive(Default)]
pub struct DeviceDeclaration {
    services: Vec<DeclaredService>,
    peripherals: Vec<PeripheralAccessor>,
}

impl DeviceDeclaration {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Declares a service; `build` declares its characteristics.
    pub fn service<S>(&mut self, uuid: Uuid, build: impl FnOnce(&mut ServiceDeclaration) -> S) -> S {
        let mut service = ServiceDeclaration {
            service: DeclaredService {
                uuid,
                characteristics: Vec::new(),
            },
        };
        let fields = build(&mut service);
        self.services.push(service.service);
        fields
    }

    /// Device-level accessor for connection state and actions.
    pub fn peripheral(&mut self) -> PeripheralAccessor {
        let accessor = PeripheralAccessor::new();
        self.peripherals.push(accessor.clone());
        accessor
    }

    pub(crate) fn finish(self) -> DeclaredDevice {
        DeclaredDevice {
            services: self.services,
            peripherals: self.peripherals,
        }
    }
}

pub struct ServiceDeclaration {
    service: DeclaredService,
}

impl ServiceDeclaration {
    pub fn uuid(&self) -> Uuid {
        self.service.uuid
    }

    pub fn characteristic<V: CharacteristicValue>(&mut self, uuid: Uuid) -> Characteristic<V> {
        self.declare(uuid, false)
    }

    /// A characteristic whose notifications are enabled as soon as it is bound.
    pub fn notifying_characteristic<V: CharacteristicValue>(&mut self, uuid: Uuid) -> Characteristic<V> {
        self.declare(uuid, true)
    }

    fn declare<V: CharacteristicValue>(&mut self, uuid: Uuid, notify: bool) -> Characteristic<V> {
        let characteristic = Characteristic::new(uuid, notify);
        self.service.characteristics.push(DeclaredCharacteristic {
            uuid,
            notify,
            binding: characteristic.binding(),
        });
        characteristic
    }
}

/// Visits a declared device depth first: each service, then its
/// characteristics, then the device-level accessors.
pub(crate) trait DeviceVisitor {
    fn visit_service(&mut self, _service: &DeclaredService) {}

    fn visit_characteristic(&mut self, _service: &DeclaredService, _characteristic: &DeclaredCharacteristic) {}

    fn visit_peripheral(&mut self, _accessor: &PeripheralAccessor) {}
}

/// The declared fields of one device model instance.
pub(crate) struct DeclaredDevice {
    services: Vec<DeclaredService>,
    peripherals: Vec<PeripheralAccessor>,
}

impl DeclaredDevice {
    pub fn accept(&self, visitor: &mut impl DeviceVisitor) {
        for service in &self.services {
            visitor.visit_service(service);
            for characteristic in &service.characteristics {
                visitor.visit_characteristic(service, characteristic);
            }
        }
        for accessor in &self.peripherals {
            visitor.visit_peripheral(accessor);
        }
    }

    /// Same nodes as [`accept`](Self::accept), children before parents, last first.
    pub fn accept_reverse(&self, visitor: &mut impl DeviceVisitor) {
        for accessor in self.peripherals.iter().rev() {
            visitor.visit_peripheral(accessor);
        }
        for service in self.services.iter().rev() {
            for characteristic in service.characteristics.iter().rev() {
                visitor.visit_characteristic(service, characteristic);
            }
            visitor.visit_service(service);
        }
    }
}

/// Immutable shape of a device model, shared by every peripheral of that type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceDescription {
    pub services: Vec<ServiceDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceDescription {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicDescription>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CharacteristicDescription {
    pub uuid: Uuid,
    pub notify: bool,
    pub value_type: &'static str,
}

impl DeviceDescription {
    /// Walks a throwaway instance of `D` to capture its shape.
    pub fn of<D: DeviceModel>() -> Self {
        let mut declaration = DeviceDeclaration::new();
        let _ = D::declare(&mut declaration);
        let mut visitor = DescriptionVisitor::default();
        declaration.finish().accept(&mut visitor);
        DeviceDescription {
            services: visitor.services,
        }
    }

    pub fn service(&self, uuid: Uuid) -> Option<&ServiceDescription> {
        self.services.iter().find(|s| s.uuid == uuid)
    }
}

#[derive(Default)]
struct DescriptionVisitor {
    services: Vec<ServiceDescription>,
}

impl DeviceVisitor for DescriptionVisitor {
    fn visit_service(&mut self, service: &DeclaredService) {
        self.services.push(ServiceDescription {
            uuid: service.uuid,
            characteristics: Vec::new(),
        });
    }

    fn visit_characteristic(&mut self, _service: &DeclaredService, characteristic: &DeclaredCharacteristic) {
        if let Some(service) = self.services.last_mut() {
            service.characteristics.push(CharacteristicDescription {
                uuid: characteristic.uuid,
                notify: characteristic.notify,
                value_type: characteristic.binding.value_type(),
            });
        }
    }
}

pub(crate) struct PeripheralLink {
    pub id: PeripheralId,
    pub state: watch::Receiver<PeripheralState>,
    pub requests: mpsc::WeakUnboundedSender<LinkRequest>,
}

/// Device-level field: identity, connection state and the disconnect action.
#[derive(Clone, Default)]
pub struct PeripheralAccessor {
    link: Arc<Mutex<Option<PeripheralLink>>>,
}

impl fmt::Debug for PeripheralAccessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralAccessor")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl PeripheralAccessor {
    fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Option<PeripheralLink>> {
        self.link.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn bind(&self, link: PeripheralLink) {
        *self.lock() = Some(link);
    }

    pub(crate) fn unbind(&self) {
        self.lock().take();
    }

    /// Identity of the bound peripheral; `None` once the connection is gone.
    pub fn id(&self) -> Option<PeripheralId> {
        self.lock().as_ref().map(|link| link.id.clone())
    }

    pub fn state(&self) -> PeripheralState {
        self.lock()
            .as_ref()
            .map(|link| *link.state.borrow())
            .unwrap_or(PeripheralState::Disconnected)
    }

    pub async fn disconnect(&self) -> Result<()> {
        let (peripheral, requests) = {
            let guard = self.lock();
            let link = guard.as_ref().ok_or(Error::Disconnected)?;
            let requests = link.requests.upgrade().ok_or(Error::EngineStopped)?;
            (link.id.clone(), requests)
        };
        let (reply, response) = oneshot::channel();
        requests
            .send(LinkRequest::Disconnect { peripheral, reply })
            .map_err(|_| Error::EngineStopped)?;
        response.await.map_err(|_| Error::EngineStopped)?
    }
}
