//! Messages processed by the engine task.
//! Application calls, requests from bound characteristic contexts and driver
//! completions all end up here, so the engine handles them one at a time.

use std::sync::Arc;

use tokio::sync::oneshot;

use crate::core::bluetooth::types::{
    CharacteristicTarget, DiscoveredService, PeripheralId, PeripheralState,
};
use crate::error::Result;

pub(crate) type Reply<T> = oneshot::Sender<Result<T>>;

/// Commands sent through a [`CentralManager`](super::CentralManager) handle.
pub(crate) enum ManagerCommand<D> {
    StartScan { reply: Reply<()> },
    StopScan { reply: Reply<()> },
    SetAutoConnect { enabled: bool },
    Connect {
        peripheral: PeripheralId,
        reply: Reply<Arc<D>>,
    },
    Disconnect {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
    Device {
        peripheral: PeripheralId,
        reply: oneshot::Sender<Option<Arc<D>>>,
    },
    State {
        peripheral: PeripheralId,
        reply: oneshot::Sender<Option<PeripheralState>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Requests issued by bound accessors.
///
/// Accessors only hold a weak sender for this channel, so a device model
/// never keeps the engine alive.
#[derive(Debug)]
pub(crate) enum LinkRequest {
    Read {
        target: CharacteristicTarget,
        reply: Reply<Vec<u8>>,
    },
    /// `reply` is `None` for writes without response.
    Write {
        target: CharacteristicTarget,
        value: Vec<u8>,
        reply: Option<Reply<()>>,
    },
    SetNotify {
        target: CharacteristicTarget,
        enabled: bool,
        reply: Reply<()>,
    },
    Disconnect {
        peripheral: PeripheralId,
        reply: Reply<()>,
    },
}

/// Results of driver calls the engine dispatched onto their own tasks.
///
/// `epoch` identifies the connection the call was made for; results from an
/// older connection are discarded.
pub(crate) enum Completion {
    ScanToggled {
        scanning: bool,
        result: anyhow::Result<()>,
        reply: Reply<()>,
    },
    ConnectFinished {
        peripheral: PeripheralId,
        epoch: u64,
        result: anyhow::Result<()>,
    },
    ServicesDiscovered {
        peripheral: PeripheralId,
        epoch: u64,
        refresh: bool,
        result: anyhow::Result<Vec<DiscoveredService>>,
    },
    DisconnectFinished {
        peripheral: PeripheralId,
        epoch: u64,
        result: anyhow::Result<()>,
    },
    ReadFinished {
        op: u64,
        target: CharacteristicTarget,
        epoch: u64,
        result: anyhow::Result<Vec<u8>>,
    },
    WriteFinished {
        op: u64,
        result: anyhow::Result<()>,
    },
    NotifyFinished {
        target: CharacteristicTarget,
        epoch: u64,
        enabled: bool,
        result: anyhow::Result<()>,
    },
}
