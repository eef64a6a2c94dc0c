//! Connection lifecycle, binding and teardown.

use gatt_bridge::core::bluetooth::{
    DiscoveredService, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_BLOOD_PRESSURE_MEASUREMENT,
    UUID_BLOOD_PRESSURE_SERVICE, UUID_GLUCOSE_SERVICE, UUID_RECORD_ACCESS_CONTROL_POINT,
};
use gatt_bridge::{Availability, EngineConfig, Error, ManagerEvent, PeripheralState, RecordSelection};

use crate::mock_radio::RadioCall;
use crate::support::{
    battery, connected_sensor, control_point, engine, full_gatt_table, sensor_id, wait_for_event, wait_until,
};

fn without_glucose() -> Vec<DiscoveredService> {
    vec![
        DiscoveredService::new(UUID_BATTERY_SERVICE, [UUID_BATTERY_LEVEL]),
        DiscoveredService::new(UUID_BLOOD_PRESSURE_SERVICE, [UUID_BLOOD_PRESSURE_MEASUREMENT]),
    ]
}

#[tokio::test]
async fn connect_walks_the_lifecycle_and_binds_every_field() {
    let (radio, manager) = engine(EngineConfig::default());
    let mut events = manager.events();
    let sensor = connected_sensor(&radio, &manager).await;
    let id = sensor_id();

    let mut states = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let ManagerEvent::StateChanged { peripheral, state } = event {
            assert_eq!(peripheral, id);
            states.push(state);
        }
    }
    assert_eq!(states, vec![PeripheralState::Connecting, PeripheralState::Connected]);

    assert_eq!(sensor.peripheral.id(), Some(id.clone()));
    assert_eq!(sensor.peripheral.state(), PeripheralState::Connected);
    assert_eq!(sensor.battery_level.availability(), Availability::Available);
    assert!(!sensor.battery_level.is_notifying());
    assert_eq!(radio.count(&RadioCall::DiscoverServices(id.clone())), 1);

    // A second connect hands back the bound device without touching the radio.
    let again = manager.connect(&id).await.unwrap();
    assert!(std::sync::Arc::ptr_eq(&sensor, &again));
    assert_eq!(radio.count(&RadioCall::Connect(id)), 1);
}

#[tokio::test]
async fn failed_connect_reports_a_connection_error() {
    let (radio, manager) = engine(EngineConfig::default());
    radio.fail_connect("peripheral refused");

    let result = manager.connect(&sensor_id()).await;
    assert_eq!(result.err(), Some(Error::Connection("peripheral refused".into())));
    assert_eq!(manager.state(&sensor_id()).await, Some(PeripheralState::Disconnected));
    assert!(manager.device(&sensor_id()).await.is_none());
    // Nothing retries on its own.
    assert_eq!(radio.count(&RadioCall::Connect(sensor_id())), 1);
}

#[tokio::test]
async fn disconnect_clears_caches_and_fails_later_operations() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x64]);
    let sensor = connected_sensor(&radio, &manager).await;

    assert_eq!(sensor.battery_level.read().await, Ok(100));
    assert_eq!(sensor.battery_level.cached(), Some(100));

    manager.disconnect(&id).await.unwrap();
    assert_eq!(manager.state(&id).await, Some(PeripheralState::Disconnected));
    assert_eq!(sensor.battery_level.cached(), None);
    assert_eq!(sensor.battery_level.availability(), Availability::Disconnected);
    assert!(!sensor.measurement.is_notifying());
    assert_eq!(sensor.battery_level.read().await, Err(Error::Disconnected));
    assert_eq!(sensor.peripheral.id(), None);
    assert!(manager.device(&id).await.is_none());
    assert_eq!(radio.count(&RadioCall::Disconnect(id.clone())), 1);

    // Disconnecting again is a no-op.
    manager.disconnect(&id).await.unwrap();
    assert_eq!(radio.count(&RadioCall::Disconnect(id)), 1);
}

#[tokio::test]
async fn device_can_disconnect_itself() {
    let (radio, manager) = engine(EngineConfig::default());
    let sensor = connected_sensor(&radio, &manager).await;

    sensor.peripheral.disconnect().await.unwrap();
    assert_eq!(manager.state(&sensor_id()).await, Some(PeripheralState::Disconnected));
    assert_eq!(sensor.peripheral.disconnect().await, Err(Error::Disconnected));
}

#[tokio::test]
async fn link_loss_unbinds_the_device() {
    let (radio, manager) = engine(EngineConfig::default());
    let mut events = manager.events();
    let sensor = connected_sensor(&radio, &manager).await;
    let id = sensor_id();

    radio.drop_link(&id);
    wait_for_event(&mut events, |event| {
        matches!(event, ManagerEvent::StateChanged { state: PeripheralState::Disconnected, .. })
    })
    .await;

    assert_eq!(sensor.measurement.availability(), Availability::Disconnected);
    assert_eq!(sensor.records.report_number_of_stored_records(RecordSelection::All).await, Err(Error::Disconnected));
    // The engine never hangs up a link the radio already dropped.
    assert_eq!(radio.count(&RadioCall::Disconnect(id.clone())), 0);

    // A fresh connection binds a fresh device instance.
    let reconnected = manager.connect(&id).await.unwrap();
    assert!(!std::sync::Arc::ptr_eq(&sensor, &reconnected));
    assert_eq!(reconnected.measurement.availability(), Availability::Available);
    assert_eq!(sensor.measurement.availability(), Availability::Disconnected);
}

#[tokio::test]
async fn missing_service_leaves_its_characteristics_unavailable() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_services(&id, without_glucose());
    let sensor = manager.connect(&id).await.unwrap();

    let unavailable = Error::Unavailable {
        service: UUID_GLUCOSE_SERVICE,
        characteristic: UUID_RECORD_ACCESS_CONTROL_POINT,
    };
    let records = sensor.records.characteristic();
    assert_eq!(records.availability(), Availability::Missing);
    assert_eq!(records.read().await, Err(unavailable.clone()));
    assert_eq!(
        sensor.records.report_number_of_stored_records(RecordSelection::All).await,
        Err(unavailable)
    );
    // No subscription is attempted for what is not there.
    assert!(radio.notify_calls(&control_point(&id)).is_empty());
    assert_eq!(sensor.battery_level.availability(), Availability::Available);
}

#[tokio::test]
async fn services_changed_updates_availability_and_restores_subscriptions() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_services(&id, without_glucose());
    let sensor = manager.connect(&id).await.unwrap();
    let records = sensor.records.characteristic().clone();
    assert_eq!(records.availability(), Availability::Missing);

    radio.change_services(&id, full_gatt_table());
    radio.wait_for_call(&RadioCall::SetNotify(control_point(&id), true), 1).await;
    wait_until(|| records.is_notifying()).await;
    assert_eq!(records.availability(), Availability::Available);

    radio.change_services(&id, without_glucose());
    wait_until(|| records.availability() == Availability::Missing).await;
    assert!(!records.is_notifying());
    assert_eq!(records.cached(), None);
}

#[tokio::test]
async fn shutdown_disconnects_and_stops_the_engine() {
    let (radio, manager) = engine(EngineConfig::default());
    let sensor = connected_sensor(&radio, &manager).await;
    manager.start_scanning().await.unwrap();

    manager.shutdown().await;
    assert_eq!(radio.count(&RadioCall::Disconnect(sensor_id())), 1);
    assert_eq!(radio.count(&RadioCall::StopScan), 1);
    assert_eq!(sensor.battery_level.availability(), Availability::Disconnected);
    assert_eq!(manager.connect(&sensor_id()).await.err(), Some(Error::EngineStopped));
    assert_eq!(manager.start_scanning().await, Err(Error::EngineStopped));
}
