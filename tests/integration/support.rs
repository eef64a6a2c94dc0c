//! Device model and helpers shared by the integration scenarios.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use gatt_bridge::core::bluetooth::{
    AdvertisementRecord, CharacteristicTarget, DiscoveredService, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE,
    UUID_BLOOD_PRESSURE_MEASUREMENT, UUID_BLOOD_PRESSURE_SERVICE, UUID_GLUCOSE_SERVICE,
    UUID_RECORD_ACCESS_CONTROL_POINT,
};
use gatt_bridge::{
    CentralManager, Characteristic, DeviceDeclaration, DeviceModel, EngineConfig, ManagerEvent, PeripheralAccessor,
    PeripheralId, RecordAccessControlPoint,
};

use crate::mock_radio::MockRadio;

pub const TIMEOUT: Duration = Duration::from_secs(5);

/// Battery, a notifying measurement and a Record Access control point.
pub struct Sensor {
    pub peripheral: PeripheralAccessor,
    pub battery_level: Characteristic<u8>,
    pub measurement: Characteristic<u16>,
    pub records: RecordAccessControlPoint,
}

impl DeviceModel for Sensor {
    fn declare(device: &mut DeviceDeclaration) -> Self {
        let peripheral = device.peripheral();
        let battery_level = device.service(UUID_BATTERY_SERVICE, |s| s.characteristic(UUID_BATTERY_LEVEL));
        let measurement = device.service(UUID_BLOOD_PRESSURE_SERVICE, |s| {
            s.notifying_characteristic(UUID_BLOOD_PRESSURE_MEASUREMENT)
        });
        let records = device.service(UUID_GLUCOSE_SERVICE, |s| {
            RecordAccessControlPoint::new(s.notifying_characteristic(UUID_RECORD_ACCESS_CONTROL_POINT))
        });
        Sensor {
            peripheral,
            battery_level,
            measurement,
            records,
        }
    }
}

pub fn sensor_id() -> PeripheralId {
    PeripheralId::new("AA:BB:CC:DD:EE:01")
}

pub fn battery(peripheral: &PeripheralId) -> CharacteristicTarget {
    CharacteristicTarget::new(peripheral.clone(), UUID_BATTERY_SERVICE, UUID_BATTERY_LEVEL)
}

pub fn measurement(peripheral: &PeripheralId) -> CharacteristicTarget {
    CharacteristicTarget::new(
        peripheral.clone(),
        UUID_BLOOD_PRESSURE_SERVICE,
        UUID_BLOOD_PRESSURE_MEASUREMENT,
    )
}

pub fn control_point(peripheral: &PeripheralId) -> CharacteristicTarget {
    CharacteristicTarget::new(
        peripheral.clone(),
        UUID_GLUCOSE_SERVICE,
        UUID_RECORD_ACCESS_CONTROL_POINT,
    )
}

/// Every service [`Sensor`] declares.
pub fn full_gatt_table() -> Vec<DiscoveredService> {
    vec![
        DiscoveredService::new(UUID_BATTERY_SERVICE, [UUID_BATTERY_LEVEL]),
        DiscoveredService::new(UUID_BLOOD_PRESSURE_SERVICE, [UUID_BLOOD_PRESSURE_MEASUREMENT]),
        DiscoveredService::new(UUID_GLUCOSE_SERVICE, [UUID_RECORD_ACCESS_CONTROL_POINT]),
    ]
}

pub fn advertisement(peripheral: &PeripheralId) -> AdvertisementRecord {
    AdvertisementRecord::new(peripheral.clone())
        .with_name("Cuff")
        .with_rssi(-60)
        .with_service(UUID_BLOOD_PRESSURE_SERVICE)
}

pub fn engine(config: EngineConfig) -> (Arc<MockRadio>, CentralManager<Sensor>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let radio = MockRadio::new();
    let manager = CentralManager::new(radio.clone(), config).expect("valid config");
    (radio, manager)
}

/// Connects to a peripheral exposing the full GATT table and waits until the
/// default subscriptions are in place.
pub async fn connected_sensor(radio: &MockRadio, manager: &CentralManager<Sensor>) -> Arc<Sensor> {
    let id = sensor_id();
    radio.set_services(&id, full_gatt_table());
    let sensor = manager.connect(&id).await.expect("connect");
    wait_until(|| sensor.measurement.is_notifying() && sensor.records.characteristic().is_notifying()).await;
    sensor
}

/// Next event matching `wanted`, skipping everything else.
pub async fn wait_for_event<F>(events: &mut broadcast::Receiver<ManagerEvent>, wanted: F) -> ManagerEvent
where
    F: Fn(&ManagerEvent) -> bool,
{
    let wait = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => panic!("engine event channel closed"),
            }
        }
    };
    tokio::time::timeout(TIMEOUT, wait).await.expect("timed out waiting for event")
}

pub async fn wait_until<F: Fn() -> bool>(condition: F) {
    let wait = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    tokio::time::timeout(TIMEOUT, wait).await.expect("condition never held");
}
