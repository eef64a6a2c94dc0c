//! Per-peripheral connection lifecycle.
//! `discovered -> connecting -> connected -> disconnecting -> disconnected -> connecting ...`
//! Nothing here retries; a failed attempt lands in `disconnected` and the
//! caller decides what to do next.

use crate::core::bluetooth::types::{PeripheralId, PeripheralState};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    DisconnectRequested,
    DisconnectConfirmed,
    DisconnectFailed,
    /// The driver reported link loss on its own.
    LinkLost,
}

impl ConnectionEvent {
    fn operation(self) -> &'static str {
        match self {
            ConnectionEvent::ConnectRequested => "connect",
            ConnectionEvent::ConnectSucceeded => "complete connecting",
            ConnectionEvent::ConnectFailed => "fail connecting",
            ConnectionEvent::DisconnectRequested => "disconnect",
            ConnectionEvent::DisconnectConfirmed => "complete disconnecting",
            ConnectionEvent::DisconnectFailed => "fail disconnecting",
            ConnectionEvent::LinkLost => "lose the link of",
        }
    }
}

/// Authoritative connection state of one peripheral.
#[derive(Debug)]
pub(crate) struct ConnectionStateMachine {
    peripheral: PeripheralId,
    state: PeripheralState,
    /// Bumped on every connect attempt.
    epoch: u64,
}

impl ConnectionStateMachine {
    pub fn new(peripheral: PeripheralId, state: PeripheralState) -> Self {
        Self {
            peripheral,
            state,
            epoch: 0,
        }
    }

    pub fn state(&self) -> PeripheralState {
        self.state
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn apply(&mut self, event: ConnectionEvent) -> Result<PeripheralState> {
        use ConnectionEvent::*;
        use PeripheralState::*;

        let next = match (self.state, event) {
            (Discovered | Disconnected, ConnectRequested) => {
                self.epoch += 1;
                Connecting
            }
            (Connecting, ConnectSucceeded) => Connected,
            (Connecting, ConnectFailed) => Disconnected,
            (Connected, DisconnectRequested) => Disconnecting,
            (Disconnecting, DisconnectConfirmed) => Disconnected,
            (Disconnecting, DisconnectFailed) => Connected,
            (Connecting | Connected | Disconnecting, LinkLost) => Disconnected,
            (state, event) => {
                return Err(Error::InvalidState {
                    peripheral: self.peripheral.clone(),
                    state,
                    operation: event.operation(),
                });
            }
        };
        self.state = next;
        Ok(next)
    }
}
