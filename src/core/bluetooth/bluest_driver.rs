//! [`RadioDriver`] backed by the `bluest` crate.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use bluest::{Adapter, AdvertisingDevice, ConnectionEvent, Device};
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::core::bluetooth::driver::{DriverEvent, RadioDriver};
use crate::core::bluetooth::types::{
    AdvertisementRecord, CharacteristicTarget, DiscoveredService, ManufacturerData, PeripheralId,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Bluetooth adapter of the host, driven through bluest.
pub struct BluestDriver {
    adapter: Adapter,
    devices: Arc<Mutex<HashMap<PeripheralId, Device>>>,
    characteristics: Mutex<HashMap<CharacteristicTarget, bluest::Characteristic>>,
    events: mpsc::UnboundedSender<DriverEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
    scan: Mutex<Option<CancellationToken>>,
    /// Connection and service-change watchers, one per connected peripheral.
    links: Mutex<HashMap<PeripheralId, CancellationToken>>,
    /// One notification pump per subscribed characteristic.
    notifications: Mutex<HashMap<CharacteristicTarget, CancellationToken>>,
}

impl BluestDriver {
    /// Opens the default adapter and waits until it is powered on.
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        let (events, event_rx) = mpsc::unbounded_channel();
        Ok(Self {
            adapter,
            devices: Arc::new(Mutex::new(HashMap::new())),
            characteristics: Mutex::new(HashMap::new()),
            events,
            event_rx: Mutex::new(Some(event_rx)),
            scan: Mutex::new(None),
            links: Mutex::new(HashMap::new()),
            notifications: Mutex::new(HashMap::new()),
        })
    }

    fn device(&self, peripheral: &PeripheralId) -> Result<Device> {
        lock(&self.devices)
            .get(peripheral)
            .cloned()
            .ok_or_else(|| anyhow!("Device not found with ID: {}", peripheral))
    }

    fn characteristic(&self, target: &CharacteristicTarget) -> Result<bluest::Characteristic> {
        lock(&self.characteristics)
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow!("Characteristic {} has not been discovered", target))
    }

    fn record(advertising: &AdvertisingDevice) -> AdvertisementRecord {
        let data = &advertising.adv_data;
        let mut record = AdvertisementRecord::new(PeripheralId::new(advertising.device.id().to_string()));
        record.name = data
            .local_name
            .clone()
            .or_else(|| advertising.device.name().ok());
        record.rssi = advertising.rssi;
        record.services = data.services.iter().copied().collect();
        record.service_data = data
            .service_data
            .iter()
            .map(|(uuid, bytes)| (*uuid, bytes.to_vec()))
            .collect();
        record.manufacturer_data = data.manufacturer_data.as_ref().map(|m| ManufacturerData {
            company_id: m.company_id,
            data: m.data.to_vec(),
        });
        record
    }

    async fn scan_task(
        adapter: Adapter,
        services: Vec<Uuid>,
        devices: Arc<Mutex<HashMap<PeripheralId, Device>>>,
        events: mpsc::UnboundedSender<DriverEvent>,
        cancel_token: CancellationToken,
        started: oneshot::Sender<Result<()>>,
    ) {
        let mut scan_stream = match adapter.scan(&services).await {
            Ok(stream) => {
                let _ = started.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = started.send(Err(e.into()));
                return;
            }
        };

        loop {
            tokio::select! {
                result = scan_stream.next() => {
                    let Some(advertising) = result else {
                        info!("Bluetooth scan stream has ended.");
                        break;
                    };
                    let record = Self::record(&advertising);
                    debug!("Advertisement from {} (RSSI: {:?})", record.id, record.rssi);
                    lock(&devices).insert(record.id.clone(), advertising.device);
                    if events.send(DriverEvent::Advertisement(record)).is_err() {
                        break;
                    }
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    /// Reports link loss and GATT table changes until cancelled.
    async fn link_task(
        adapter: Adapter,
        device: Device,
        peripheral: PeripheralId,
        events: mpsc::UnboundedSender<DriverEvent>,
        cancel_token: CancellationToken,
    ) {
        let mut connection_events = match adapter.device_connection_events(&device).await {
            Ok(stream) => stream.boxed(),
            Err(e) => {
                warn!("Cannot watch the connection of {}: {}", peripheral, e);
                stream::pending().boxed()
            }
        };
        let mut service_changes = match device.service_changed_indications().await {
            Ok(stream) => stream.boxed(),
            Err(e) => {
                debug!("Service change indications unavailable for {}: {}", peripheral, e);
                stream::pending().boxed()
            }
        };

        loop {
            tokio::select! {
                event = connection_events.next() => match event {
                    Some(ConnectionEvent::Disconnected) | None => {
                        let _ = events.send(DriverEvent::Disconnected {
                            peripheral: peripheral.clone(),
                            reason: Some("connection closed by the device".into()),
                        });
                        break;
                    }
                    Some(ConnectionEvent::Connected) => {}
                },
                Some(_) = service_changes.next() => {
                    let _ = events.send(DriverEvent::ServicesChanged { peripheral: peripheral.clone() });
                }
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    async fn notify_task(
        characteristic: bluest::Characteristic,
        target: CharacteristicTarget,
        events: mpsc::UnboundedSender<DriverEvent>,
        cancel_token: CancellationToken,
        started: oneshot::Sender<Result<()>>,
    ) {
        let mut values = match characteristic.notify().await {
            Ok(stream) => {
                let _ = started.send(Ok(()));
                stream
            }
            Err(e) => {
                let _ = started.send(Err(e.into()));
                return;
            }
        };

        loop {
            tokio::select! {
                value = values.next() => match value {
                    Some(Ok(value)) => {
                        let _ = events.send(DriverEvent::ValueUpdated { target: target.clone(), value });
                    }
                    Some(Err(e)) => warn!("Notification error on {}: {}", target, e),
                    None => {
                        debug!("Notification stream of {} ended", target);
                        break;
                    }
                },
                _ = cancel_token.cancelled() => break,
            }
        }
    }

    fn stop_link_tasks(&self, peripheral: &PeripheralId) {
        if let Some(token) = lock(&self.links).remove(peripheral) {
            token.cancel();
        }
        lock(&self.notifications).retain(|target, token| {
            if &target.peripheral == peripheral {
                token.cancel();
                false
            } else {
                true
            }
        });
        lock(&self.characteristics).retain(|target, _| &target.peripheral != peripheral);
    }
}

#[async_trait::async_trait]
impl RadioDriver for BluestDriver {
    fn events(&self) -> BoxStream<'static, DriverEvent> {
        match lock(&self.event_rx).take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed(),
            None => {
                error!("Driver events were already taken");
                stream::empty().boxed()
            }
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.stop_scan().await?;
        let cancel_token = CancellationToken::new();
        *lock(&self.scan) = Some(cancel_token.clone());

        let (started, ready) = oneshot::channel();
        tokio::spawn(Self::scan_task(
            self.adapter.clone(),
            services.to_vec(),
            self.devices.clone(),
            self.events.clone(),
            cancel_token,
            started,
        ));
        ready.await.map_err(|_| anyhow!("Scan task ended before starting"))??;
        info!("Device scan task started.");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if let Some(token) = lock(&self.scan).take() {
            info!("Stopping Bluetooth scan.");
            token.cancel();
        }
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        let device = self.device(peripheral)?;
        if !device.is_connected().await {
            info!("Initiating connection to {}...", peripheral);
            self.adapter.connect_device(&device).await?;
        }

        let cancel_token = CancellationToken::new();
        if let Some(previous) = lock(&self.links).insert(peripheral.clone(), cancel_token.clone()) {
            previous.cancel();
        }
        tokio::spawn(Self::link_task(
            self.adapter.clone(),
            device,
            peripheral.clone(),
            self.events.clone(),
            cancel_token,
        ));
        Ok(())
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.stop_link_tasks(peripheral);
        let device = self.device(peripheral)?;
        if device.is_connected().await {
            info!("Disconnecting from device {}", peripheral);
            self.adapter.disconnect_device(&device).await?;
        } else {
            info!("Device {} not connected", peripheral);
        }
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>> {
        let device = self.device(peripheral)?;
        let mut discovered = Vec::new();
        let mut handles = Vec::new();
        for service in device.discover_services().await? {
            let mut characteristics = Vec::new();
            for characteristic in service.discover_characteristics().await? {
                let target = CharacteristicTarget::new(peripheral.clone(), service.uuid(), characteristic.uuid());
                characteristics.push(characteristic.uuid());
                handles.push((target, characteristic));
            }
            debug!("{} exposes service {} ({} characteristics)", peripheral, service.uuid(), characteristics.len());
            discovered.push(DiscoveredService::new(service.uuid(), characteristics));
        }

        let mut cache = lock(&self.characteristics);
        cache.retain(|target, _| &target.peripheral != peripheral);
        cache.extend(handles);
        Ok(discovered)
    }

    async fn read(&self, target: &CharacteristicTarget) -> Result<Vec<u8>> {
        Ok(self.characteristic(target)?.read().await?)
    }

    async fn write(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()> {
        Ok(self.characteristic(target)?.write(value).await?)
    }

    async fn write_without_response(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()> {
        Ok(self.characteristic(target)?.write_without_response(value).await?)
    }

    async fn set_notify(&self, target: &CharacteristicTarget, enabled: bool) -> Result<()> {
        if let Some(token) = lock(&self.notifications).remove(target) {
            token.cancel();
        }
        if !enabled {
            return Ok(());
        }

        let characteristic = self.characteristic(target)?;
        let cancel_token = CancellationToken::new();
        let (started, ready) = oneshot::channel();
        tokio::spawn(Self::notify_task(
            characteristic,
            target.clone(),
            self.events.clone(),
            cancel_token.clone(),
            started,
        ));
        ready.await.map_err(|_| anyhow!("Notification task for {} ended early", target))??;
        lock(&self.notifications).insert(target.clone(), cancel_token);
        Ok(())
    }
}
