//! Constants used throughout the engine
//! Assigned numbers for the services and characteristics the engine and its
//! tests refer to, plus default timing values.

use std::time::Duration;

use uuid::Uuid;

/// Expands a 16-bit assigned number onto the Bluetooth base UUID.
pub const fn uuid16(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb)
}

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = uuid16(0x1800);
pub const UUID_DEVICE_INFORMATION_SERVICE: Uuid = uuid16(0x180a);
pub const UUID_BATTERY_SERVICE: Uuid = uuid16(0x180f);
pub const UUID_GLUCOSE_SERVICE: Uuid = uuid16(0x1808);
pub const UUID_BLOOD_PRESSURE_SERVICE: Uuid = uuid16(0x1810);
pub const UUID_WEIGHT_SCALE_SERVICE: Uuid = uuid16(0x181d);

/// Standard Bluetooth Characteristic UUIDs
pub const UUID_DEVICE_NAME: Uuid = uuid16(0x2a00);
pub const UUID_MANUFACTURER_NAME: Uuid = uuid16(0x2a29);
pub const UUID_MODEL_NUMBER: Uuid = uuid16(0x2a24);
pub const UUID_BATTERY_LEVEL: Uuid = uuid16(0x2a19);
pub const UUID_GLUCOSE_MEASUREMENT: Uuid = uuid16(0x2a18);
pub const UUID_BLOOD_PRESSURE_MEASUREMENT: Uuid = uuid16(0x2a35);
pub const UUID_RECORD_ACCESS_CONTROL_POINT: Uuid = uuid16(0x2a52);

/// Staleness timeout used when the configuration does not set one.
pub const DEFAULT_STALE_TIMEOUT: Duration = Duration::from_secs(10);

/// Lower bound accepted for the staleness timeout.
pub const MIN_STALE_TIMEOUT: Duration = Duration::from_secs(1);

/// Capacity of the engine's event broadcast channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 64;
