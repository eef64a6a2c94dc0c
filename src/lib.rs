//! GATT bridge library
//! Keeps application-declared BLE device models synchronized with live
//! connections: discovery with staleness eviction, the connection lifecycle,
//! cached characteristic values with race-free notification management, and
//! the Record Access request/response protocol.

// Module declarations
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod utils;

pub use crate::config::EngineConfig;
pub use crate::core::bluetooth::{
    CentralManager, DriverEvent, ManagerEvent, NearbyPeripheral, PeripheralId, PeripheralState, RadioDriver,
};
pub use crate::core::gatt::{
    Availability, ByteCodec, ChangeSubscription, Characteristic, DeviceDeclaration, DeviceDescription, DeviceModel,
    PeripheralAccessor,
};
pub use crate::core::record_access::{RecordAccessControlPoint, RecordSelection};
pub use crate::error::{Error, Result};

/// Installs the broadcast logger, falling back to `env_logger` when another
/// logger is already in place.
pub fn setup_logging(level: log::Level) {
    if logging::BroadcastLogger::init(level).is_err() {
        let _ = env_logger::builder()
            .filter_level(level.to_level_filter())
            .try_init();
    }
    log::info!("Logging initialized");
}
