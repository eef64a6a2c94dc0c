//! Core functionality: the bluetooth engine, typed GATT access and the
//! Record Access protocol built on top of it.

pub mod bluetooth;
pub mod gatt;
pub mod record_access;

pub use bluetooth::{CentralManager, ManagerEvent, RadioDriver};
pub use gatt::{Characteristic, DeviceDeclaration, DeviceModel};
