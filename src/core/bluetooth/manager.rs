//! Central manager: the engine task and the handle applications talk to.
//!
//! One spawned task owns every piece of mutable engine state: the nearby set,
//! connection state machines, bound device sessions and notification
//! bookkeeping. Application calls, accessor requests, driver events, driver
//! completions and stale timers are all delivered to it over channels and
//! processed one at a time. Driver calls are spawned onto their own tasks and
//! report back as [`Completion`]s, so a slow radio never stalls the engine.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::config::discovery_config::DiscoveryConfig;
use crate::core::bluetooth::commands::{Completion, LinkRequest, ManagerCommand, Reply};
use crate::core::bluetooth::connection::{ConnectionEvent, ConnectionStateMachine};
use crate::core::bluetooth::constants::EVENT_CHANNEL_CAPACITY;
use crate::core::bluetooth::discovery::{NearbySet, Observation};
use crate::core::bluetooth::driver::{DriverEvent, RadioDriver};
use crate::core::bluetooth::notification::NotificationState;
use crate::core::bluetooth::types::{
    is_reachable, AdvertisementRecord, CharacteristicTarget, DiscoveredService, NearbyPeripheral, PeripheralId,
    PeripheralState,
};
use crate::core::gatt::binding::{BindingVisitor, UnbindVisitor};
use crate::core::gatt::characteristic::CharacteristicBinding;
use crate::core::gatt::device::{DeclaredDevice, DeviceDeclaration, DeviceDescription, DeviceModel};
use crate::error::{Error, Result};

/// Observability channel. Nothing here requires a reaction; events with a
/// waiting caller are reported to that caller instead.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    PeripheralDiscovered(NearbyPeripheral),
    /// Went stale, or scanning stopped.
    PeripheralLost(PeripheralId),
    StateChanged {
        peripheral: PeripheralId,
        state: PeripheralState,
    },
    /// A pushed value could not be decoded; the cache kept its previous value.
    DecodeFailed {
        target: CharacteristicTarget,
        error: Error,
    },
    AutoConnectFailed {
        peripheral: PeripheralId,
        error: Error,
    },
}

/// Clonable handle to one engine instance, generic over the device model
/// bound to every connected peripheral.
///
/// The engine stops when [`shutdown`](Self::shutdown) is called or the last
/// handle is dropped.
pub struct CentralManager<D: DeviceModel> {
    commands: mpsc::UnboundedSender<ManagerCommand<D>>,
    nearby: watch::Receiver<Vec<NearbyPeripheral>>,
    events: broadcast::Sender<ManagerEvent>,
    description: Arc<DeviceDescription>,
}

impl<D: DeviceModel> Clone for CentralManager<D> {
    fn clone(&self) -> Self {
        Self {
            commands: self.commands.clone(),
            nearby: self.nearby.clone(),
            events: self.events.clone(),
            description: self.description.clone(),
        }
    }
}

impl<D: DeviceModel> CentralManager<D> {
    /// Validates `config` and spawns the engine task on the current tokio runtime.
    pub fn new(driver: Arc<dyn RadioDriver>, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let description = Arc::new(DeviceDescription::of::<D>());
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (nearby_tx, nearby) = watch::channel(Vec::new());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let engine = Engine::new(driver, config.discovery, command_rx, nearby_tx, events.clone());
        tokio::spawn(engine.run());
        info!(
            "Bluetooth engine started for a device with {} service(s)",
            description.services.len()
        );

        Ok(Self {
            commands,
            nearby,
            events,
            description,
        })
    }

    /// Shape of the device model, shared by every peripheral.
    pub fn description(&self) -> &DeviceDescription {
        &self.description
    }

    pub async fn start_scanning(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::StartScan { reply }).await
    }

    /// Stops scanning and empties the nearby set. Connections are kept.
    pub async fn stop_scanning(&self) -> Result<()> {
        self.request(|reply| ManagerCommand::StopScan { reply }).await
    }

    pub fn set_auto_connect(&self, enabled: bool) -> Result<()> {
        self.send(ManagerCommand::SetAutoConnect { enabled })
    }

    /// Connects and binds a fresh device model instance to the peripheral.
    ///
    /// Resolves once every declared characteristic is bound and the model's
    /// `configure` hook has run. Failures are reported, never retried.
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<Arc<D>> {
        let peripheral = peripheral.clone();
        self.request(|reply| ManagerCommand::Connect { peripheral, reply })
            .await
    }

    pub async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        let peripheral = peripheral.clone();
        self.request(|reply| ManagerCommand::Disconnect { peripheral, reply })
            .await
    }

    /// The device bound to a connected peripheral.
    pub async fn device(&self, peripheral: &PeripheralId) -> Option<Arc<D>> {
        let (reply, response) = oneshot::channel();
        self.send(ManagerCommand::Device {
            peripheral: peripheral.clone(),
            reply,
        })
        .ok()?;
        response.await.ok().flatten()
    }

    pub async fn state(&self, peripheral: &PeripheralId) -> Option<PeripheralState> {
        let (reply, response) = oneshot::channel();
        self.send(ManagerCommand::State {
            peripheral: peripheral.clone(),
            reply,
        })
        .ok()?;
        response.await.ok().flatten()
    }

    /// Snapshot of the nearby set, ordered by id.
    pub fn nearby(&self) -> Vec<NearbyPeripheral> {
        self.nearby.borrow().clone()
    }

    pub fn subscribe_nearby(&self) -> watch::Receiver<Vec<NearbyPeripheral>> {
        self.nearby.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.events.subscribe()
    }

    /// Disconnects every peripheral, stops scanning and ends the engine task.
    pub async fn shutdown(&self) {
        let (reply, response) = oneshot::channel();
        if self.send(ManagerCommand::Shutdown { reply }).is_ok() {
            let _ = response.await;
        }
    }

    fn send(&self, command: ManagerCommand<D>) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::EngineStopped)
    }

    async fn request<T>(&self, command: impl FnOnce(Reply<T>) -> ManagerCommand<D>) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(command(reply))?;
        response.await.map_err(|_| Error::EngineStopped)?
    }
}

enum PendingReply {
    Read(Reply<Vec<u8>>),
    Write(Option<Reply<()>>),
}

/// A read or write dispatched to the driver and not yet completed.
struct PendingOp {
    peripheral: PeripheralId,
    reply: PendingReply,
}

impl PendingOp {
    fn fail(self, error: Error) {
        match self.reply {
            PendingReply::Read(reply) => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Write(Some(reply)) => {
                let _ = reply.send(Err(error));
            }
            PendingReply::Write(None) => {}
        }
    }
}

/// Engine-side state of one declared characteristic on one connection.
/// Several accessors may share it when a model declares the same
/// characteristic twice.
struct ContextEntry {
    target: CharacteristicTarget,
    bindings: Vec<Arc<dyn CharacteristicBinding>>,
    available: bool,
    notify_by_default: bool,
    notifications: NotificationState,
}

impl ContextEntry {
    fn publish_notify_state(&self) {
        let notifying = self.notifications.actual();
        for binding in &self.bindings {
            binding.handle_notify_state(notifying);
        }
    }
}

type ContextKey = (Uuid, Uuid);

/// A device model instance bound to a live connection.
struct Session<D> {
    device: Arc<D>,
    declared: DeclaredDevice,
    contexts: HashMap<ContextKey, ContextEntry>,
}

struct PeripheralEntry<D> {
    machine: ConnectionStateMachine,
    state: watch::Sender<PeripheralState>,
    connect_waiters: Vec<Reply<Arc<D>>>,
    disconnect_waiters: Vec<Reply<()>>,
    session: Option<Session<D>>,
    /// The running attempt was started by the auto-connect policy.
    auto_connecting: bool,
}

impl<D> PeripheralEntry<D> {
    fn new(peripheral: PeripheralId, state: PeripheralState) -> Self {
        let (state_tx, _) = watch::channel(state);
        Self {
            machine: ConnectionStateMachine::new(peripheral, state),
            state: state_tx,
            connect_waiters: Vec::new(),
            disconnect_waiters: Vec::new(),
            session: None,
            auto_connecting: false,
        }
    }
}

/// Finds the context a request targets on the current connection.
fn context_mut<'a, D>(
    peripherals: &'a mut HashMap<PeripheralId, PeripheralEntry<D>>,
    target: &CharacteristicTarget,
) -> Result<(u64, &'a mut ContextEntry)> {
    let entry = peripherals.get_mut(&target.peripheral).ok_or(Error::Disconnected)?;
    if entry.machine.state() != PeripheralState::Connected {
        return Err(Error::Disconnected);
    }
    let epoch = entry.machine.epoch();
    let session = entry.session.as_mut().ok_or(Error::Disconnected)?;
    let unavailable = Error::Unavailable {
        service: target.service,
        characteristic: target.characteristic,
    };
    let context = session
        .contexts
        .get_mut(&(target.service, target.characteristic))
        .ok_or_else(|| unavailable.clone())?;
    if !context.available {
        return Err(unavailable);
    }
    Ok((epoch, context))
}

enum Next<D> {
    Command(Option<ManagerCommand<D>>),
    Link(LinkRequest),
    Completion(Completion),
    Driver(Option<DriverEvent>),
    Expired(PeripheralId),
}

struct Engine<D: DeviceModel> {
    driver: Arc<dyn RadioDriver>,
    config: DiscoveryConfig,
    scanning: bool,
    auto_connect: bool,
    nearby: NearbySet,
    peripherals: HashMap<PeripheralId, PeripheralEntry<D>>,
    pending: HashMap<u64, PendingOp>,
    next_op: u64,

    commands: mpsc::UnboundedReceiver<ManagerCommand<D>>,
    links: mpsc::UnboundedReceiver<LinkRequest>,
    /// Kept so accessors can be handed weak senders.
    link_tx: mpsc::UnboundedSender<LinkRequest>,
    completions: mpsc::UnboundedReceiver<Completion>,
    completion_tx: mpsc::UnboundedSender<Completion>,
    driver_events: BoxStream<'static, DriverEvent>,
    driver_open: bool,

    nearby_tx: watch::Sender<Vec<NearbyPeripheral>>,
    events: broadcast::Sender<ManagerEvent>,
}

impl<D: DeviceModel> Engine<D> {
    fn new(
        driver: Arc<dyn RadioDriver>,
        config: DiscoveryConfig,
        commands: mpsc::UnboundedReceiver<ManagerCommand<D>>,
        nearby_tx: watch::Sender<Vec<NearbyPeripheral>>,
        events: broadcast::Sender<ManagerEvent>,
    ) -> Self {
        let (link_tx, links) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let driver_events = driver.events();
        Self {
            driver,
            scanning: false,
            auto_connect: config.auto_connect,
            nearby: NearbySet::new(config.stale_timeout()),
            config,
            peripherals: HashMap::new(),
            pending: HashMap::new(),
            next_op: 0,
            commands,
            links,
            link_tx,
            completions,
            completion_tx,
            driver_events,
            driver_open: true,
            nearby_tx,
            events,
        }
    }

    async fn run(mut self) {
        loop {
            let next = tokio::select! {
                command = self.commands.recv() => Next::Command(command),
                Some(request) = self.links.recv() => Next::Link(request),
                Some(completion) = self.completions.recv() => Next::Completion(completion),
                event = self.driver_events.next(), if self.driver_open => Next::Driver(event),
                Some(expired) = self.nearby.next_expired(), if self.nearby.has_pending_timers() => {
                    Next::Expired(expired)
                }
            };

            match next {
                Next::Command(Some(ManagerCommand::Shutdown { reply })) => {
                    self.shutdown().await;
                    let _ = reply.send(());
                    return;
                }
                Next::Command(Some(command)) => self.handle_command(command),
                Next::Command(None) => {
                    debug!("Every manager handle dropped");
                    self.shutdown().await;
                    return;
                }
                Next::Link(request) => self.handle_link_request(request),
                Next::Completion(completion) => self.handle_completion(completion),
                Next::Driver(Some(event)) => self.handle_driver_event(event),
                Next::Driver(None) => {
                    warn!("Radio driver event stream ended");
                    self.driver_open = false;
                }
                Next::Expired(peripheral) => self.handle_stale(peripheral),
            }
        }
    }

    fn dispatch(&self, call: impl Future<Output = Completion> + Send + 'static) {
        let completions = self.completion_tx.clone();
        tokio::spawn(async move {
            let _ = completions.send(call.await);
        });
    }

    fn emit(&self, event: ManagerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    fn state_of(&self, peripheral: &PeripheralId) -> PeripheralState {
        self.peripherals
            .get(peripheral)
            .map(|entry| entry.machine.state())
            .unwrap_or(PeripheralState::Discovered)
    }

    fn nearby_view(&self, record: &AdvertisementRecord) -> NearbyPeripheral {
        NearbyPeripheral {
            id: record.id.clone(),
            name: record.name.clone(),
            rssi: record.rssi,
            state: self.state_of(&record.id),
            last_seen: record.last_seen,
        }
    }

    fn publish_nearby(&self) {
        let mut snapshot: Vec<NearbyPeripheral> = self.nearby.records().map(|r| self.nearby_view(r)).collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        self.nearby_tx.send_replace(snapshot);
    }

    fn transition(&mut self, peripheral: &PeripheralId, event: ConnectionEvent) -> Result<PeripheralState> {
        let entry = self
            .peripherals
            .get_mut(peripheral)
            .ok_or_else(|| Error::UnknownPeripheral(peripheral.clone()))?;
        let state = entry.machine.apply(event)?;
        entry.state.send_replace(state);
        info!("Peripheral {} is now {}", peripheral, state);
        self.emit(ManagerEvent::StateChanged {
            peripheral: peripheral.clone(),
            state,
        });
        if self.nearby.contains(peripheral) {
            self.publish_nearby();
        }
        Ok(state)
    }

    // ---- application commands ----

    fn handle_command(&mut self, command: ManagerCommand<D>) {
        match command {
            ManagerCommand::StartScan { reply } => self.start_scan(reply),
            ManagerCommand::StopScan { reply } => self.stop_scan(reply),
            ManagerCommand::SetAutoConnect { enabled } => {
                if self.auto_connect != enabled {
                    info!("Auto-connect {}", if enabled { "enabled" } else { "disabled" });
                }
                self.auto_connect = enabled;
                self.evaluate_auto_connect();
            }
            ManagerCommand::Connect { peripheral, reply } => self.connect(peripheral, Some(reply), false),
            ManagerCommand::Disconnect { peripheral, reply } => self.disconnect(peripheral, reply),
            ManagerCommand::Device { peripheral, reply } => {
                let device = self
                    .peripherals
                    .get(&peripheral)
                    .and_then(|entry| entry.session.as_ref())
                    .map(|session| session.device.clone());
                let _ = reply.send(device);
            }
            ManagerCommand::State { peripheral, reply } => {
                let state = match self.peripherals.get(&peripheral) {
                    Some(entry) => Some(entry.machine.state()),
                    None if self.nearby.contains(&peripheral) => Some(PeripheralState::Discovered),
                    None => None,
                };
                let _ = reply.send(state);
            }
            // Handled by the run loop.
            ManagerCommand::Shutdown { .. } => {}
        }
    }

    fn start_scan(&mut self, reply: Reply<()>) {
        if self.scanning {
            let _ = reply.send(Ok(()));
            return;
        }
        self.scanning = true;
        let services = self.config.criteria.services.clone();
        info!("Starting scan (service filter: {:?})", services);
        let driver = self.driver.clone();
        self.dispatch(async move {
            let result = driver.start_scan(&services).await;
            Completion::ScanToggled {
                scanning: true,
                result,
                reply,
            }
        });
    }

    fn stop_scan(&mut self, reply: Reply<()>) {
        self.scanning = false;
        for peripheral in self.nearby.clear() {
            self.emit(ManagerEvent::PeripheralLost(peripheral));
        }
        self.publish_nearby();
        info!("Stopping scan");
        let driver = self.driver.clone();
        self.dispatch(async move {
            let result = driver.stop_scan().await;
            Completion::ScanToggled {
                scanning: false,
                result,
                reply,
            }
        });
    }

    fn connect(&mut self, peripheral: PeripheralId, reply: Option<Reply<Arc<D>>>, auto: bool) {
        let known = self.nearby.contains(&peripheral);
        let entry = self.peripherals.entry(peripheral.clone()).or_insert_with(|| {
            let state = if known {
                PeripheralState::Discovered
            } else {
                PeripheralState::Disconnected
            };
            PeripheralEntry::new(peripheral.clone(), state)
        });

        match entry.machine.state() {
            PeripheralState::Connected => {
                match (&entry.session, reply) {
                    (Some(session), Some(reply)) => {
                        let _ = reply.send(Ok(session.device.clone()));
                    }
                    // Still discovering services.
                    (None, Some(reply)) => entry.connect_waiters.push(reply),
                    (_, None) => {}
                }
                return;
            }
            PeripheralState::Connecting => {
                entry.connect_waiters.extend(reply);
                return;
            }
            _ => {}
        }

        if let Err(e) = self.transition(&peripheral, ConnectionEvent::ConnectRequested) {
            if let Some(reply) = reply {
                let _ = reply.send(Err(e));
            }
            return;
        }
        let Some(entry) = self.peripherals.get_mut(&peripheral) else {
            return;
        };
        entry.connect_waiters.extend(reply);
        entry.auto_connecting = auto;
        let epoch = entry.machine.epoch();
        self.nearby.suspend_timer(&peripheral);

        info!("Connecting to {} (attempt {})", peripheral, epoch);
        let driver = self.driver.clone();
        self.dispatch(async move {
            let result = driver.connect(&peripheral).await;
            Completion::ConnectFinished {
                peripheral,
                epoch,
                result,
            }
        });
    }

    fn disconnect(&mut self, peripheral: PeripheralId, reply: Reply<()>) {
        let Some(entry) = self.peripherals.get_mut(&peripheral) else {
            // Never connected: nothing to tear down.
            let result = if self.nearby.contains(&peripheral) {
                Ok(())
            } else {
                Err(Error::UnknownPeripheral(peripheral))
            };
            let _ = reply.send(result);
            return;
        };

        match entry.machine.state() {
            PeripheralState::Discovered | PeripheralState::Disconnected => {
                let _ = reply.send(Ok(()));
                return;
            }
            PeripheralState::Disconnecting => {
                entry.disconnect_waiters.push(reply);
                return;
            }
            PeripheralState::Connecting | PeripheralState::Connected => {}
        }

        match self.transition(&peripheral, ConnectionEvent::DisconnectRequested) {
            Ok(_) => {
                if let Some(entry) = self.peripherals.get_mut(&peripheral) {
                    entry.disconnect_waiters.push(reply);
                }
                self.dispatch_disconnect(peripheral);
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn dispatch_disconnect(&self, peripheral: PeripheralId) {
        let Some(entry) = self.peripherals.get(&peripheral) else {
            return;
        };
        let epoch = entry.machine.epoch();
        info!("Disconnecting from {}", peripheral);
        let driver = self.driver.clone();
        self.dispatch(async move {
            let result = driver.disconnect(&peripheral).await;
            Completion::DisconnectFinished {
                peripheral,
                epoch,
                result,
            }
        });
    }

    /// Connects on its own when exactly one candidate is nearby and nothing
    /// else is connected or connecting.
    fn evaluate_auto_connect(&mut self) {
        if !self.auto_connect || !self.scanning {
            return;
        }
        if self.peripherals.values().any(|entry| entry.machine.state().is_active()) {
            return;
        }
        let candidates: Vec<PeripheralId> = self
            .nearby
            .ids()
            .filter(|id| {
                matches!(
                    self.state_of(id),
                    PeripheralState::Discovered | PeripheralState::Disconnected
                )
            })
            .take(2)
            .cloned()
            .collect();
        let Ok([candidate]) = <[PeripheralId; 1]>::try_from(candidates) else {
            return;
        };
        info!("Auto-connecting to {}", candidate);
        self.connect(candidate, None, true);
    }

    // ---- accessor requests ----

    fn handle_link_request(&mut self, request: LinkRequest) {
        match request {
            LinkRequest::Read { target, reply } => {
                let epoch = match context_mut(&mut self.peripherals, &target) {
                    Ok((epoch, _)) => epoch,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let op = self.track(&target.peripheral, PendingReply::Read(reply));
                debug!("Reading {}", target);
                let driver = self.driver.clone();
                self.dispatch(async move {
                    let result = driver.read(&target).await;
                    Completion::ReadFinished {
                        op,
                        target,
                        epoch,
                        result,
                    }
                });
            }
            LinkRequest::Write { target, value, reply } => {
                if let Err(e) = context_mut(&mut self.peripherals, &target) {
                    match reply {
                        Some(reply) => {
                            let _ = reply.send(Err(e));
                        }
                        None => warn!("Dropping write without response to {}: {}", target, e),
                    }
                    return;
                }
                let with_response = reply.is_some();
                let op = self.track(&target.peripheral, PendingReply::Write(reply));
                debug!("Writing {} byte(s) to {}", value.len(), target);
                let driver = self.driver.clone();
                self.dispatch(async move {
                    let result = if with_response {
                        driver.write(&target, &value).await
                    } else {
                        driver.write_without_response(&target, &value).await
                    };
                    Completion::WriteFinished { op, result }
                });
            }
            LinkRequest::SetNotify { target, enabled, reply } => {
                let action = match context_mut(&mut self.peripherals, &target) {
                    Ok((epoch, context)) => context
                        .notifications
                        .request(enabled, Some(reply))
                        .map(|enabled| (epoch, enabled)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        None
                    }
                };
                if let Some((epoch, enabled)) = action {
                    self.dispatch_notify(target, epoch, enabled);
                }
            }
            LinkRequest::Disconnect { peripheral, reply } => self.disconnect(peripheral, reply),
        }
    }

    fn track(&mut self, peripheral: &PeripheralId, reply: PendingReply) -> u64 {
        self.next_op += 1;
        self.pending.insert(
            self.next_op,
            PendingOp {
                peripheral: peripheral.clone(),
                reply,
            },
        );
        self.next_op
    }

    fn dispatch_notify(&self, target: CharacteristicTarget, epoch: u64, enabled: bool) {
        debug!("Setting notifications of {} to {}", target, enabled);
        let driver = self.driver.clone();
        self.dispatch(async move {
            let result = driver.set_notify(&target, enabled).await;
            Completion::NotifyFinished {
                target,
                epoch,
                enabled,
                result,
            }
        });
    }

    // ---- driver completions ----

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::ScanToggled {
                scanning,
                result,
                reply,
            } => {
                let result = result.map_err(|e| {
                    let operation = if scanning { "start scan" } else { "stop scan" };
                    error!("Failed to {}: {:#}", operation, e);
                    if scanning {
                        self.scanning = false;
                    }
                    Error::driver(operation, &e)
                });
                if result.is_ok() && scanning {
                    self.evaluate_auto_connect();
                }
                let _ = reply.send(result);
            }
            Completion::ConnectFinished {
                peripheral,
                epoch,
                result,
            } => self.finish_connect(peripheral, epoch, result),
            Completion::ServicesDiscovered {
                peripheral,
                epoch,
                refresh,
                result,
            } => {
                if !self.is_current(&peripheral, epoch, PeripheralState::Connected) {
                    debug!("Discarding service discovery result for an old connection to {}", peripheral);
                    return;
                }
                match (refresh, result) {
                    (false, Ok(services)) => self.bind_device(&peripheral, services),
                    (false, Err(e)) => {
                        error!("Service discovery on {} failed: {:#}", peripheral, e);
                        self.abandon_connect(&peripheral, Error::connection(&e));
                    }
                    (true, Ok(services)) => self.refresh_services(&peripheral, services),
                    (true, Err(e)) => warn!("Rediscovering services of {} failed: {:#}", peripheral, e),
                }
            }
            Completion::DisconnectFinished {
                peripheral,
                epoch,
                result,
            } => {
                if !self.is_current(&peripheral, epoch, PeripheralState::Disconnecting) {
                    return;
                }
                match result {
                    Ok(()) => self.finish_disconnect(&peripheral),
                    Err(e) => {
                        error!("Disconnecting from {} failed: {:#}", peripheral, e);
                        let _ = self.transition(&peripheral, ConnectionEvent::DisconnectFailed);
                        let error = Error::driver("disconnect", &e);
                        let unbound = match self.peripherals.get_mut(&peripheral) {
                            Some(entry) => {
                                for waiter in entry.disconnect_waiters.drain(..) {
                                    let _ = waiter.send(Err(error.clone()));
                                }
                                entry.session.is_none()
                            }
                            None => false,
                        };
                        // A link without a bound device is of no use to anyone.
                        if unbound {
                            self.lose_link(&peripheral, Error::connection(&e));
                        }
                    }
                }
            }
            Completion::ReadFinished {
                op,
                target,
                epoch,
                result,
            } => self.finish_read(op, target, epoch, result),
            Completion::WriteFinished { op, result } => {
                let Some(pending) = self.pending.remove(&op) else {
                    return;
                };
                match (pending.reply, result) {
                    (PendingReply::Write(Some(reply)), result) => {
                        let _ = reply.send(result.map_err(|e| Error::driver("write", &e)));
                    }
                    (PendingReply::Write(None), Err(e)) => {
                        warn!("Write without response to {} failed: {:#}", pending.peripheral, e);
                    }
                    _ => {}
                }
            }
            Completion::NotifyFinished {
                target,
                epoch,
                enabled,
                result,
            } => {
                if let Err(e) = &result {
                    error!("Setting notifications of {} to {} failed: {:#}", target, enabled, e);
                }
                let next = match context_mut(&mut self.peripherals, &target) {
                    Ok((current, context)) if current == epoch => {
                        let next = context
                            .notifications
                            .complete(result.map_err(|e| Error::driver("set notify", &e)));
                        context.publish_notify_state();
                        next
                    }
                    _ => {
                        debug!("Discarding notification acknowledgement for {}", target);
                        None
                    }
                };
                if let Some(enabled) = next {
                    self.dispatch_notify(target, epoch, enabled);
                }
            }
        }
    }

    fn is_current(&self, peripheral: &PeripheralId, epoch: u64, state: PeripheralState) -> bool {
        self.peripherals
            .get(peripheral)
            .is_some_and(|entry| entry.machine.epoch() == epoch && entry.machine.state() == state)
    }

    fn finish_connect(&mut self, peripheral: PeripheralId, epoch: u64, result: anyhow::Result<()>) {
        if !self.is_current(&peripheral, epoch, PeripheralState::Connecting) {
            debug!("Discarding connect result for an old attempt on {}", peripheral);
            return;
        }
        match result {
            Ok(()) => {
                if self.transition(&peripheral, ConnectionEvent::ConnectSucceeded).is_err() {
                    return;
                }
                let driver = self.driver.clone();
                self.dispatch(async move {
                    let result = driver.discover_services(&peripheral).await;
                    Completion::ServicesDiscovered {
                        peripheral,
                        epoch,
                        refresh: false,
                        result,
                    }
                });
            }
            Err(e) => {
                error!("Connecting to {} failed: {:#}", peripheral, e);
                let _ = self.transition(&peripheral, ConnectionEvent::ConnectFailed);
                self.fail_connect_waiters(&peripheral, Error::connection(&e));
                self.nearby.rearm_timer(&peripheral);
            }
        }
    }

    fn fail_connect_waiters(&mut self, peripheral: &PeripheralId, error: Error) {
        let Some(entry) = self.peripherals.get_mut(peripheral) else {
            return;
        };
        for waiter in entry.connect_waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
        if std::mem::take(&mut entry.auto_connecting) {
            self.emit(ManagerEvent::AutoConnectFailed {
                peripheral: peripheral.clone(),
                error,
            });
        }
    }

    /// Connected, but the device could not be bound: report and hang up.
    fn abandon_connect(&mut self, peripheral: &PeripheralId, error: Error) {
        self.fail_connect_waiters(peripheral, error);
        if self.transition(peripheral, ConnectionEvent::DisconnectRequested).is_ok() {
            self.dispatch_disconnect(peripheral.clone());
        }
    }

    /// Walks a fresh device model instance and binds every declared field.
    fn bind_device(&mut self, peripheral: &PeripheralId, services: Vec<DiscoveredService>) {
        let Some(entry) = self.peripherals.get_mut(peripheral) else {
            return;
        };
        let epoch = entry.machine.epoch();

        let mut declaration = DeviceDeclaration::new();
        let device = Arc::new(D::declare(&mut declaration));
        let declared = declaration.finish();

        let mut visitor = BindingVisitor::new(
            peripheral.clone(),
            &services,
            self.link_tx.downgrade(),
            entry.state.subscribe(),
        );
        declared.accept(&mut visitor);

        let mut contexts: HashMap<ContextKey, ContextEntry> = HashMap::new();
        for bound in visitor.into_bound() {
            let key = (bound.target.service, bound.target.characteristic);
            let notify_by_default = bound.notify_by_default();
            let context = contexts.entry(key).or_insert_with(|| ContextEntry {
                target: bound.target.clone(),
                bindings: Vec::new(),
                available: bound.available,
                notify_by_default: false,
                notifications: NotificationState::default(),
            });
            context.notify_by_default |= notify_by_default;
            context.bindings.push(bound.binding);
        }

        let mut subscribe = Vec::new();
        for context in contexts.values_mut() {
            if context.available && context.notify_by_default {
                if let Some(enabled) = context.notifications.request(true, None) {
                    subscribe.push((context.target.clone(), enabled));
                }
            }
        }

        device.configure();
        info!(
            "Bound device to {} ({} characteristic(s), {} unavailable)",
            peripheral,
            contexts.len(),
            contexts.values().filter(|c| !c.available).count()
        );

        entry.auto_connecting = false;
        for waiter in entry.connect_waiters.drain(..) {
            let _ = waiter.send(Ok(device.clone()));
        }
        entry.session = Some(Session {
            device,
            declared,
            contexts,
        });

        for (target, enabled) in subscribe {
            self.dispatch_notify(target, epoch, enabled);
        }
    }

    /// Recomputes availability after the peripheral's GATT table changed.
    fn refresh_services(&mut self, peripheral: &PeripheralId, services: Vec<DiscoveredService>) {
        let Some(entry) = self.peripherals.get_mut(peripheral) else {
            return;
        };
        let epoch = entry.machine.epoch();
        let Some(session) = entry.session.as_mut() else {
            return;
        };

        let mut resubscribe = Vec::new();
        for (&(service, characteristic), context) in session.contexts.iter_mut() {
            let available = is_reachable(&services, service, characteristic);
            if available == context.available {
                continue;
            }
            info!(
                "{} is {}",
                context.target,
                if available { "available again" } else { "no longer available" }
            );
            context.available = available;
            for binding in &context.bindings {
                binding.handle_services_change(available);
            }
            if available {
                if let Some(enabled) = context.notifications.resume() {
                    resubscribe.push((context.target.clone(), enabled));
                }
            } else {
                context.notifications.suspend(Error::Unavailable {
                    service,
                    characteristic,
                });
            }
        }

        for (target, enabled) in resubscribe {
            self.dispatch_notify(target, epoch, enabled);
        }
    }

    fn finish_read(
        &mut self,
        op: u64,
        target: CharacteristicTarget,
        epoch: u64,
        result: anyhow::Result<Vec<u8>>,
    ) {
        let reply = match self.pending.remove(&op) {
            Some(PendingOp {
                reply: PendingReply::Read(reply),
                ..
            }) => Some(reply),
            _ => None,
        };
        let result = match result {
            Ok(bytes) => {
                let failures: Vec<Error> = match context_mut(&mut self.peripherals, &target) {
                    // The cache follows the radio even if the caller stopped waiting.
                    Ok((current, context)) if current == epoch => context
                        .bindings
                        .iter()
                        .filter_map(|binding| binding.handle_value(&bytes).err())
                        .collect(),
                    _ => Vec::new(),
                };
                let caller_waiting = reply.as_ref().is_some_and(|reply| !reply.is_closed());
                if !caller_waiting {
                    for error in failures {
                        warn!("Read of {} could not be decoded: {}", target, error);
                        self.emit(ManagerEvent::DecodeFailed {
                            target: target.clone(),
                            error,
                        });
                    }
                }
                Ok(bytes)
            }
            Err(e) => {
                error!("Reading {} failed: {:#}", target, e);
                Err(Error::driver("read", &e))
            }
        };
        if let Some(reply) = reply {
            let _ = reply.send(result);
        }
    }

    // ---- driver events ----

    fn handle_driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Advertisement(record) => self.observe(record),
            DriverEvent::ValueUpdated { target, value } => {
                let failures: Vec<Error> = match context_mut(&mut self.peripherals, &target) {
                    Ok((_, context)) => {
                        debug!("{} byte(s) pushed by {}", value.len(), target);
                        context
                            .bindings
                            .iter()
                            .filter_map(|binding| binding.handle_value(&value).err())
                            .collect()
                    }
                    Err(e) => {
                        debug!("Ignoring value pushed by {}: {}", target, e);
                        Vec::new()
                    }
                };
                for error in failures {
                    warn!("Value pushed by {} could not be decoded: {}", target, error);
                    self.emit(ManagerEvent::DecodeFailed {
                        target: target.clone(),
                        error,
                    });
                }
            }
            DriverEvent::ServicesChanged { peripheral } => {
                let Some(entry) = self.peripherals.get(&peripheral) else {
                    return;
                };
                if entry.machine.state() != PeripheralState::Connected || entry.session.is_none() {
                    return;
                }
                let epoch = entry.machine.epoch();
                info!("Services of {} changed, rediscovering", peripheral);
                let driver = self.driver.clone();
                self.dispatch(async move {
                    let result = driver.discover_services(&peripheral).await;
                    Completion::ServicesDiscovered {
                        peripheral,
                        epoch,
                        refresh: true,
                        result,
                    }
                });
            }
            DriverEvent::Disconnected { peripheral, reason } => {
                match self.peripherals.get(&peripheral).map(|entry| entry.machine.state()) {
                    Some(PeripheralState::Disconnecting) => self.finish_disconnect(&peripheral),
                    Some(PeripheralState::Connecting | PeripheralState::Connected) => {
                        let reason = reason.unwrap_or_else(|| "link lost".to_string());
                        warn!("Lost connection to {}: {}", peripheral, reason);
                        self.lose_link(&peripheral, Error::Connection(reason));
                    }
                    _ => debug!("Ignoring disconnect of {}", peripheral),
                }
            }
        }
    }

    fn observe(&mut self, record: AdvertisementRecord) {
        if !self.scanning {
            return;
        }
        if !self.config.accepts(&record) {
            return;
        }
        let peripheral = record.id.clone();
        let observation = self.nearby.observe(record);
        if self.state_of(&peripheral).is_active() {
            self.nearby.suspend_timer(&peripheral);
        }
        self.publish_nearby();

        if observation == Observation::Added {
            if let Some(record) = self.nearby.get(&peripheral) {
                let view = self.nearby_view(record);
                info!("Discovered {} ({:?})", peripheral, view.name);
                self.emit(ManagerEvent::PeripheralDiscovered(view));
            }
            self.evaluate_auto_connect();
        }
    }

    fn handle_stale(&mut self, peripheral: PeripheralId) {
        if self.state_of(&peripheral).is_active() {
            return;
        }
        if self.nearby.remove(&peripheral).is_some() {
            info!("{} went stale", peripheral);
            self.emit(ManagerEvent::PeripheralLost(peripheral));
            self.publish_nearby();
            self.evaluate_auto_connect();
        }
    }

    // ---- teardown ----

    fn finish_disconnect(&mut self, peripheral: &PeripheralId) {
        if self.transition(peripheral, ConnectionEvent::DisconnectConfirmed).is_err() {
            return;
        }
        self.close_session(peripheral, Error::Disconnected);
        if let Some(entry) = self.peripherals.get_mut(peripheral) {
            for waiter in entry.disconnect_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    fn lose_link(&mut self, peripheral: &PeripheralId, error: Error) {
        if self.transition(peripheral, ConnectionEvent::LinkLost).is_err() {
            return;
        }
        self.close_session(peripheral, error);
        if let Some(entry) = self.peripherals.get_mut(peripheral) {
            for waiter in entry.disconnect_waiters.drain(..) {
                let _ = waiter.send(Ok(()));
            }
        }
    }

    /// Unbinds the device, fails everything in flight and makes the
    /// peripheral subject to staleness again.
    fn close_session(&mut self, peripheral: &PeripheralId, error: Error) {
        if let Some(entry) = self.peripherals.get_mut(peripheral) {
            if let Some(mut session) = entry.session.take() {
                for context in session.contexts.values_mut() {
                    context.notifications.suspend(Error::Disconnected);
                }
                session.declared.accept_reverse(&mut UnbindVisitor);
                debug!("Unbound device from {}", peripheral);
            }
        }
        self.fail_connect_waiters(peripheral, error);

        let failed: Vec<u64> = self
            .pending
            .iter()
            .filter(|(_, op)| &op.peripheral == peripheral)
            .map(|(op, _)| *op)
            .collect();
        for op in failed {
            if let Some(pending) = self.pending.remove(&op) {
                pending.fail(Error::Disconnected);
            }
        }
        self.nearby.rearm_timer(peripheral);
    }

    async fn shutdown(&mut self) {
        info!("Shutting down bluetooth engine");
        let active: Vec<PeripheralId> = self
            .peripherals
            .iter()
            .filter(|(_, entry)| entry.machine.state().is_active())
            .map(|(id, _)| id.clone())
            .collect();
        for peripheral in active {
            self.lose_link(&peripheral, Error::EngineStopped);
            if let Err(e) = self.driver.disconnect(&peripheral).await {
                warn!("Disconnecting from {} during shutdown failed: {:#}", peripheral, e);
            }
        }
        if self.scanning {
            self.scanning = false;
            if let Err(e) = self.driver.stop_scan().await {
                warn!("Stopping scan during shutdown failed: {:#}", e);
            }
        }
        self.nearby.clear();
        self.publish_nearby();
        for (_, pending) in self.pending.drain() {
            pending.fail(Error::EngineStopped);
        }
    }
}
