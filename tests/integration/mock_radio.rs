//! Scriptable radio driver for integration tests.
//!
//! Records every call the engine makes so tests can assert on the full
//! history, and lets tests inject driver events (advertisements, pushed
//! values, link loss) without a Bluetooth adapter.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Result, anyhow};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use tokio::sync::{Notify, Semaphore, mpsc};
use uuid::Uuid;

use gatt_bridge::core::bluetooth::{AdvertisementRecord, CharacteristicTarget, DiscoveredService};
use gatt_bridge::{DriverEvent, PeripheralId, RadioDriver};

// ── Call record ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum RadioCall {
    StartScan(Vec<Uuid>),
    StopScan,
    Connect(PeripheralId),
    Disconnect(PeripheralId),
    DiscoverServices(PeripheralId),
    Read(CharacteristicTarget),
    Write(CharacteristicTarget, Vec<u8>),
    WriteWithoutResponse(CharacteristicTarget, Vec<u8>),
    SetNotify(CharacteristicTarget, bool),
}

type Responder = Box<dyn Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync>;

#[derive(Default)]
struct Script {
    services: HashMap<PeripheralId, Vec<DiscoveredService>>,
    values: HashMap<CharacteristicTarget, Vec<u8>>,
    responders: HashMap<CharacteristicTarget, Responder>,
    connect_error: Option<String>,
}

// ── MockRadio ─────────────────────────────────────────────────

pub struct MockRadio {
    events: mpsc::UnboundedSender<DriverEvent>,
    event_rx: Mutex<Option<mpsc::UnboundedReceiver<DriverEvent>>>,
    script: Mutex<Script>,
    calls: Mutex<Vec<RadioCall>>,
    recorded: Notify,
    notify_gate: Mutex<Option<Arc<Semaphore>>>,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[allow(dead_code)]
impl MockRadio {
    pub fn new() -> Arc<Self> {
        let (events, event_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            events,
            event_rx: Mutex::new(Some(event_rx)),
            script: Mutex::new(Script::default()),
            calls: Mutex::new(Vec::new()),
            recorded: Notify::new(),
            notify_gate: Mutex::new(None),
            read_gate: Mutex::new(None),
        })
    }

    // ── scripting ──

    pub fn set_services(&self, peripheral: &PeripheralId, services: Vec<DiscoveredService>) {
        lock(&self.script).services.insert(peripheral.clone(), services);
    }

    pub fn set_value(&self, target: &CharacteristicTarget, value: impl Into<Vec<u8>>) {
        lock(&self.script).values.insert(target.clone(), value.into());
    }

    /// Every write to `target` is answered with the notifications `respond` returns.
    pub fn respond_to_writes<F>(&self, target: &CharacteristicTarget, respond: F)
    where
        F: Fn(&[u8]) -> Vec<Vec<u8>> + Send + Sync + 'static,
    {
        lock(&self.script).responders.insert(target.clone(), Box::new(respond));
    }

    pub fn fail_connect(&self, reason: &str) {
        lock(&self.script).connect_error = Some(reason.to_string());
    }

    /// Holds every subsequent `set_notify` call until released.
    pub fn gate_notifications(&self) {
        *lock(&self.notify_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_notifications(&self, calls: usize) {
        if let Some(gate) = lock(&self.notify_gate).as_ref() {
            gate.add_permits(calls);
        }
    }

    /// Holds every subsequent `read` call; nothing releases it.
    pub fn stall_reads(&self) {
        *lock(&self.read_gate) = Some(Arc::new(Semaphore::new(0)));
    }

    // ── injected events ──

    pub fn emit(&self, event: DriverEvent) {
        let _ = self.events.send(event);
    }

    pub fn advertise(&self, record: AdvertisementRecord) {
        self.emit(DriverEvent::Advertisement(record));
    }

    pub fn push_value(&self, target: &CharacteristicTarget, value: impl Into<Vec<u8>>) {
        self.emit(DriverEvent::ValueUpdated {
            target: target.clone(),
            value: value.into(),
        });
    }

    pub fn drop_link(&self, peripheral: &PeripheralId) {
        self.emit(DriverEvent::Disconnected {
            peripheral: peripheral.clone(),
            reason: Some("supervision timeout".into()),
        });
    }

    pub fn change_services(&self, peripheral: &PeripheralId, services: Vec<DiscoveredService>) {
        self.set_services(peripheral, services);
        self.emit(DriverEvent::ServicesChanged {
            peripheral: peripheral.clone(),
        });
    }

    // ── inspection ──

    pub fn calls(&self) -> Vec<RadioCall> {
        lock(&self.calls).clone()
    }

    pub fn count(&self, call: &RadioCall) -> usize {
        lock(&self.calls).iter().filter(|c| *c == call).count()
    }

    pub fn notify_calls(&self, target: &CharacteristicTarget) -> Vec<bool> {
        lock(&self.calls)
            .iter()
            .filter_map(|c| match c {
                RadioCall::SetNotify(t, enabled) if t == target => Some(*enabled),
                _ => None,
            })
            .collect()
    }

    /// Waits until `call` has been made `times` times in total.
    pub async fn wait_for_call(&self, call: &RadioCall, times: usize) {
        let wait = async {
            loop {
                let recorded = self.recorded.notified();
                if self.count(call) >= times {
                    return;
                }
                recorded.await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .unwrap_or_else(|_| panic!("{call:?} was not made {times} time(s); calls: {:?}", self.calls()));
    }

    fn record(&self, call: RadioCall) {
        lock(&self.calls).push(call);
        self.recorded.notify_waiters();
    }
}

#[async_trait::async_trait]
impl RadioDriver for MockRadio {
    fn events(&self) -> BoxStream<'static, DriverEvent> {
        match lock(&self.event_rx).take() {
            Some(rx) => stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|event| (event, rx)) }).boxed(),
            None => stream::empty().boxed(),
        }
    }

    async fn start_scan(&self, services: &[Uuid]) -> Result<()> {
        self.record(RadioCall::StartScan(services.to_vec()));
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        self.record(RadioCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(RadioCall::Connect(peripheral.clone()));
        match lock(&self.script).connect_error.clone() {
            Some(reason) => Err(anyhow!(reason)),
            None => Ok(()),
        }
    }

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.record(RadioCall::Disconnect(peripheral.clone()));
        Ok(())
    }

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>> {
        self.record(RadioCall::DiscoverServices(peripheral.clone()));
        Ok(lock(&self.script)
            .services
            .get(peripheral)
            .cloned()
            .unwrap_or_default())
    }

    async fn read(&self, target: &CharacteristicTarget) -> Result<Vec<u8>> {
        self.record(RadioCall::Read(target.clone()));
        let gate = lock(&self.read_gate).clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        lock(&self.script)
            .values
            .get(target)
            .cloned()
            .ok_or_else(|| anyhow!("nothing scripted for {}", target))
    }

    async fn write(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()> {
        self.record(RadioCall::Write(target.clone(), value.to_vec()));
        let responses = lock(&self.script)
            .responders
            .get(target)
            .map(|respond| respond(value))
            .unwrap_or_default();
        for response in responses {
            self.push_value(target, response);
        }
        Ok(())
    }

    async fn write_without_response(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()> {
        self.record(RadioCall::WriteWithoutResponse(target.clone(), value.to_vec()));
        Ok(())
    }

    async fn set_notify(&self, target: &CharacteristicTarget, enabled: bool) -> Result<()> {
        self.record(RadioCall::SetNotify(target.clone(), enabled));
        let gate = lock(&self.notify_gate).clone();
        if let Some(gate) = gate {
            gate.acquire().await?.forget();
        }
        Ok(())
    }
}
