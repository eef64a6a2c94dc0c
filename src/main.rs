//! Scans for a device advertising the battery service, connects to the first
//! one found and prints its battery level until interrupted.
//!
//! Usage: `gatt-bridge [config.json]`

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use log::{info, warn};

use gatt_bridge::config::DiscoveryCriteria;
use gatt_bridge::core::bluetooth::{
    BluestDriver, UUID_BATTERY_LEVEL, UUID_BATTERY_SERVICE, UUID_DEVICE_INFORMATION_SERVICE, UUID_MANUFACTURER_NAME,
};
use gatt_bridge::{
    CentralManager, Characteristic, DeviceDeclaration, DeviceDescription, DeviceModel, EngineConfig, ManagerEvent,
    PeripheralAccessor,
};

struct BatteryDevice {
    peripheral: PeripheralAccessor,
    battery_level: Characteristic<u8>,
    manufacturer: Characteristic<String>,
}

impl DeviceModel for BatteryDevice {
    fn declare(device: &mut DeviceDeclaration) -> Self {
        let peripheral = device.peripheral();
        let battery_level = device.service(UUID_BATTERY_SERVICE, |service| {
            service.notifying_characteristic(UUID_BATTERY_LEVEL)
        });
        let manufacturer = device.service(UUID_DEVICE_INFORMATION_SERVICE, |service| {
            service.characteristic(UUID_MANUFACTURER_NAME)
        });
        BatteryDevice {
            peripheral,
            battery_level,
            manufacturer,
        }
    }

    fn configure(&self) {
        self.battery_level
            .on_change(|level| match level {
                Some(level) => info!("Battery level: {}%", level),
                None => info!("Battery level unknown"),
            })
            .detach();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    gatt_bridge::setup_logging(log::Level::Info);

    let mut config = match std::env::args().nth(1) {
        Some(path) => EngineConfig::load_config(&path)
            .await
            .with_context(|| format!("Failed to load config from {}", path))?,
        None => EngineConfig::default(),
    };
    if config.discovery.criteria == DiscoveryCriteria::default() {
        config.discovery.criteria = DiscoveryCriteria::from_description(&DeviceDescription::of::<BatteryDevice>());
    }
    config.discovery.auto_connect = true;

    let driver = Arc::new(BluestDriver::new().await?);
    let manager = CentralManager::<BatteryDevice>::new(driver, config)?;
    let mut events = manager.events();
    manager.start_scanning().await?;
    info!("Scanning; waiting for a single battery-powered device");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(ManagerEvent::StateChanged { peripheral, state }) => {
                    info!("{} is {}", peripheral, state);
                    if state == gatt_bridge::PeripheralState::Connected {
                        let manager = manager.clone();
                        tokio::spawn(async move { report(&manager, &peripheral).await });
                    }
                }
                Ok(ManagerEvent::AutoConnectFailed { peripheral, error }) => {
                    warn!("Could not connect to {}: {}", peripheral, error);
                }
                Ok(ManagerEvent::DecodeFailed { target, error }) => warn!("{}: {}", target, error),
                Ok(_) => {}
                Err(e) => warn!("Missed engine events: {}", e),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    manager.shutdown().await;
    Ok(())
}

async fn report(manager: &CentralManager<BatteryDevice>, peripheral: &gatt_bridge::PeripheralId) {
    // Binding finishes shortly after the link comes up.
    let device = match manager.connect(peripheral).await {
        Ok(device) => device,
        Err(e) => {
            warn!("{} could not be bound: {}", peripheral, e);
            return;
        }
    };
    match device.manufacturer.read().await {
        Ok(name) => info!("{} is made by {}", peripheral, name),
        Err(e) => info!("Manufacturer of {} unknown: {}", peripheral, e),
    }
    match device.battery_level.read().await {
        Ok(level) => info!("{} reports {}% battery", peripheral, level),
        Err(e) => warn!("Reading battery level of {} failed: {}", peripheral, e),
    }
    tokio::time::sleep(Duration::from_secs(30)).await;
    if let Err(e) = device.peripheral.disconnect().await {
        warn!("Disconnecting {} failed: {}", peripheral, e);
    }
}
