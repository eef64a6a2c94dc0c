//! Typed characteristic access against a connected peripheral.

use std::sync::{Arc, Mutex};

use futures_util::FutureExt;

use gatt_bridge::{EngineConfig, Error, ManagerEvent};

use crate::mock_radio::RadioCall;
use crate::support::{battery, connected_sensor, engine, measurement, sensor_id, wait_for_event, wait_until};

#[tokio::test]
async fn read_decodes_and_caches_the_value() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x64]);
    let sensor = connected_sensor(&radio, &manager).await;

    let mut cache = sensor.battery_level.subscribe();
    assert_eq!(sensor.battery_level.cached(), None);
    assert_eq!(sensor.battery_level.read().await, Ok(100));
    assert!(cache.has_changed().unwrap());
    assert_eq!(*cache.borrow_and_update(), Some(100));
}

#[tokio::test]
async fn failed_read_is_a_driver_error_and_keeps_the_cache() {
    let (radio, manager) = engine(EngineConfig::default());
    let sensor = connected_sensor(&radio, &manager).await;

    // Nothing scripted for the battery level.
    let result = sensor.battery_level.read().await;
    assert!(matches!(result, Err(Error::Driver { operation: "read", .. })), "{result:?}");
    assert_eq!(sensor.battery_level.cached(), None);
}

#[tokio::test]
async fn abandoned_read_still_updates_the_cache() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x2a]);
    let sensor = connected_sensor(&radio, &manager).await;

    // Polling once hands the request to the engine; then the caller gives up.
    let read = sensor.battery_level.read();
    assert!(read.now_or_never().is_none());

    wait_until(|| sensor.battery_level.cached() == Some(42)).await;
    assert_eq!(radio.count(&RadioCall::Read(battery(&id))), 1);
}

#[tokio::test]
async fn read_fails_when_the_link_drops_mid_flight() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x64]);
    let sensor = connected_sensor(&radio, &manager).await;
    radio.stall_reads();

    let read = tokio::spawn({
        let battery_level = sensor.battery_level.clone();
        async move { battery_level.read().await }
    });
    radio.wait_for_call(&RadioCall::Read(battery(&id)), 1).await;

    radio.drop_link(&id);
    assert_eq!(read.await.unwrap(), Err(Error::Disconnected));
    assert_eq!(sensor.battery_level.cached(), None);
}

#[tokio::test]
async fn writes_reach_the_radio() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    sensor.measurement.write(0x0102).await.unwrap();
    sensor.measurement.write_without_response(0x0304).unwrap();
    radio
        .wait_for_call(&RadioCall::WriteWithoutResponse(measurement(&id), vec![0x04, 0x03]), 1)
        .await;
    assert_eq!(radio.count(&RadioCall::Write(measurement(&id), vec![0x02, 0x01])), 1);
}

#[tokio::test]
async fn pushed_values_reach_the_cache_and_handlers_in_order() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let _subscription = sensor.measurement.on_change(move |value| {
        sink.lock().unwrap().push(value.copied());
    });

    radio.push_value(&measurement(&id), [0x10, 0x00]);
    radio.push_value(&measurement(&id), [0x20, 0x00]);
    wait_until(|| sensor.measurement.cached() == Some(0x20)).await;
    assert_eq!(*seen.lock().unwrap(), vec![Some(0x10), Some(0x20)]);
}

#[tokio::test]
async fn undecodable_notification_is_reported_and_ignored() {
    let (radio, manager) = engine(EngineConfig::default());
    let mut events = manager.events();
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    radio.push_value(&measurement(&id), [0x10, 0x00]);
    wait_until(|| sensor.measurement.cached() == Some(0x10)).await;

    radio.push_value(&measurement(&id), [0x01]);
    let event = wait_for_event(&mut events, |event| matches!(event, ManagerEvent::DecodeFailed { .. })).await;
    let ManagerEvent::DecodeFailed { target, error } = event else {
        unreachable!()
    };
    assert_eq!(target, measurement(&id));
    assert!(matches!(error, Error::Decoding { len: 1, .. }));
    assert_eq!(sensor.measurement.cached(), Some(0x10));
}

#[tokio::test]
async fn enable_disable_enable_while_in_flight_subscribes_once() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x50]);
    let sensor = connected_sensor(&radio, &manager).await;
    radio.gate_notifications();

    let enable = tokio::spawn({
        let battery_level = sensor.battery_level.clone();
        async move { battery_level.enable_notifications().await }
    });
    radio.wait_for_call(&RadioCall::SetNotify(battery(&id), true), 1).await;

    let mut disable = Box::pin(sensor.battery_level.disable_notifications());
    let mut enable_again = Box::pin(sensor.battery_level.enable_notifications());
    assert!((&mut disable).now_or_never().is_none());
    assert!((&mut enable_again).now_or_never().is_none());
    // Requests are handled in order: once this read lands, both toggles were seen.
    sensor.battery_level.read().await.unwrap();

    radio.release_notifications(1);
    assert_eq!(enable.await.unwrap(), Ok(()));
    assert_eq!(disable.await, Ok(()));
    assert_eq!(enable_again.await, Ok(()));
    assert!(sensor.battery_level.is_notifying());
    assert_eq!(radio.notify_calls(&battery(&id)), vec![true]);
}

#[tokio::test]
async fn disable_while_enable_is_in_flight_reverses_it() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    radio.set_value(&battery(&id), [0x50]);
    let sensor = connected_sensor(&radio, &manager).await;
    radio.gate_notifications();

    let enable = tokio::spawn({
        let battery_level = sensor.battery_level.clone();
        async move { battery_level.enable_notifications().await }
    });
    radio.wait_for_call(&RadioCall::SetNotify(battery(&id), true), 1).await;

    let mut disable = Box::pin(sensor.battery_level.disable_notifications());
    assert!((&mut disable).now_or_never().is_none());
    sensor.battery_level.read().await.unwrap();

    radio.release_notifications(2);
    assert_eq!(disable.await, Ok(()));
    assert_eq!(enable.await.unwrap(), Ok(()));
    assert!(!sensor.battery_level.is_notifying());
    assert_eq!(radio.notify_calls(&battery(&id)), vec![true, false]);
}

#[tokio::test]
async fn cancelled_enable_still_tracks_the_subscription() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;
    radio.gate_notifications();

    // The first poll hands the request to the engine; then the caller gives up.
    assert!(sensor.battery_level.enable_notifications().now_or_never().is_none());
    radio.wait_for_call(&RadioCall::SetNotify(battery(&id), true), 1).await;
    assert!(!sensor.battery_level.is_notifying());

    radio.release_notifications(1);
    wait_until(|| sensor.battery_level.is_notifying()).await;
    assert_eq!(radio.notify_calls(&battery(&id)), vec![true]);
}

#[tokio::test]
async fn repeated_enable_is_a_single_platform_call() {
    let (radio, manager) = engine(EngineConfig::default());
    let id = sensor_id();
    let sensor = connected_sensor(&radio, &manager).await;

    for _ in 0..3 {
        sensor.battery_level.enable_notifications().await.unwrap();
    }
    assert_eq!(radio.notify_calls(&battery(&id)), vec![true]);
    // Subscribed by default at bind time, never again.
    assert_eq!(radio.notify_calls(&measurement(&id)), vec![true]);
}
