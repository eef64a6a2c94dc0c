//! Binding and unbinding a declared device to a connected peripheral.

use std::sync::Arc;

use log::{debug, warn};
use tokio::sync::{mpsc, watch};

use crate::core::bluetooth::commands::LinkRequest;
use crate::core::bluetooth::types::{
    is_reachable, CharacteristicTarget, DiscoveredService, PeripheralId, PeripheralState,
};
use crate::core::gatt::characteristic::{CharacteristicBinding, ContextLink};
use crate::core::gatt::device::{
    DeclaredCharacteristic, DeclaredService, DeviceVisitor, PeripheralAccessor, PeripheralLink,
};

/// A characteristic context routed to one connection.
pub(crate) struct BoundCharacteristic {
    pub target: CharacteristicTarget,
    pub binding: Arc<dyn CharacteristicBinding>,
    pub available: bool,
}

impl BoundCharacteristic {
    pub fn notify_by_default(&self) -> bool {
        self.binding.notify_by_default()
    }
}

/// Resolves every declared service and characteristic against the services
/// the peripheral reported and binds the accessors to the connection.
pub(crate) struct BindingVisitor<'a> {
    peripheral: PeripheralId,
    discovered: &'a [DiscoveredService],
    requests: mpsc::WeakUnboundedSender<LinkRequest>,
    state: watch::Receiver<PeripheralState>,
    bound: Vec<BoundCharacteristic>,
}

impl<'a> BindingVisitor<'a> {
    pub fn new(
        peripheral: PeripheralId,
        discovered: &'a [DiscoveredService],
        requests: mpsc::WeakUnboundedSender<LinkRequest>,
        state: watch::Receiver<PeripheralState>,
    ) -> Self {
        Self {
            peripheral,
            discovered,
            requests,
            state,
            bound: Vec::new(),
        }
    }

    pub fn into_bound(self) -> Vec<BoundCharacteristic> {
        self.bound
    }
}

impl DeviceVisitor for BindingVisitor<'_> {
    fn visit_service(&mut self, service: &DeclaredService) {
        if !self.discovered.iter().any(|s| s.uuid == service.uuid) {
            warn!("{} does not expose service {}", self.peripheral, service.uuid);
        }
    }

    fn visit_characteristic(&mut self, service: &DeclaredService, characteristic: &DeclaredCharacteristic) {
        let target = CharacteristicTarget::new(self.peripheral.clone(), service.uuid, characteristic.uuid);
        let available = is_reachable(self.discovered, service.uuid, characteristic.uuid);
        if !available {
            debug!("{} is not available", target);
        }
        characteristic.binding.bind(
            ContextLink {
                target: target.clone(),
                requests: self.requests.clone(),
            },
            available,
        );
        self.bound.push(BoundCharacteristic {
            target,
            binding: characteristic.binding.clone(),
            available,
        });
    }

    fn visit_peripheral(&mut self, accessor: &PeripheralAccessor) {
        accessor.bind(PeripheralLink {
            id: self.peripheral.clone(),
            state: self.state.clone(),
            requests: self.requests.clone(),
        });
    }
}

/// Detaches every accessor from its connection, innermost first.
pub(crate) struct UnbindVisitor;

impl DeviceVisitor for UnbindVisitor {
    fn visit_characteristic(&mut self, _service: &DeclaredService, characteristic: &DeclaredCharacteristic) {
        characteristic.binding.unbind();
    }

    fn visit_peripheral(&mut self, accessor: &PeripheralAccessor) {
        accessor.unbind();
    }
}
