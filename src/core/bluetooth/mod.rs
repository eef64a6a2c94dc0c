//! Connection and discovery engine.
//! Owns the nearby set, the per-peripheral connection state machines and the
//! notification bookkeeping, and talks to the radio through [`RadioDriver`].

#[cfg(feature = "bluest")]
mod bluest_driver;
pub(crate) mod commands;
mod connection;
pub mod constants;
mod discovery;
pub mod driver;
mod manager;
mod notification;
pub mod types;

#[cfg(feature = "bluest")]
pub use bluest_driver::BluestDriver;
pub use constants::*;
pub use driver::{DriverEvent, RadioDriver};
pub use manager::{CentralManager, ManagerEvent};
pub use types::{
    AdvertisementRecord, CharacteristicTarget, DiscoveredService, ManufacturerData, NearbyPeripheral, PeripheralId,
    PeripheralState,
};
