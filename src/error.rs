//! Error taxonomy shared by the engine, the characteristic contexts and the
//! Record Access client.

use thiserror::Error;
use uuid::Uuid;

use crate::core::bluetooth::types::{PeripheralId, PeripheralState};
use crate::core::record_access::{RecordAccessOpCode, RecordAccessResponseCode};

/// Errors surfaced to the caller that issued an operation.
///
/// The type is `Clone` because one driver failure may have to be delivered to
/// every caller waiting on the same connection attempt.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Error {
    /// The connect attempt failed or the peripheral is unreachable. Retry is up to the caller.
    #[error("connection failed: {0}")]
    Connection(String),

    /// The target handle vanished while the operation was in flight.
    #[error("peripheral disconnected")]
    Disconnected,

    /// The peripheral is connected but does not expose the characteristic.
    #[error("characteristic {characteristic} of service {service} is not available")]
    Unavailable { service: Uuid, characteristic: Uuid },

    /// A payload could not be parsed as the expected type.
    #[error("failed to decode {len} byte(s) as {type_name}")]
    Decoding { type_name: &'static str, len: usize },

    /// The device answered with an op code or operand the request does not allow.
    #[error("unexpected record access response: {0}")]
    RecordAccessResponseFormat(String),

    /// The device rejected a Record Access request.
    #[error("record access request {request:?} failed: {code}")]
    RecordAccess {
        request: RecordAccessOpCode,
        code: RecordAccessResponseCode,
    },

    /// Another Record Access exchange is still waiting for its response.
    #[error("a record access request is already in flight on this control point")]
    RecordAccessInFlight,

    #[error("cannot {operation} peripheral {peripheral} while {state}")]
    InvalidState {
        peripheral: PeripheralId,
        state: PeripheralState,
        operation: &'static str,
    },

    #[error("peripheral {0} is not known to the engine")]
    UnknownPeripheral(PeripheralId),

    /// The characteristic accessor was never bound to a connection.
    #[error("characteristic is not bound to a peripheral")]
    Unbound,

    #[error("platform driver failed to {operation}: {message}")]
    Driver {
        operation: &'static str,
        message: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(String),

    /// The engine task is gone; every handle obtained from it is dead.
    #[error("bluetooth engine has stopped")]
    EngineStopped,
}

impl Error {
    /// Flattens an opaque driver error, keeping its whole context chain.
    pub(crate) fn driver(operation: &'static str, error: &anyhow::Error) -> Self {
        Error::Driver {
            operation,
            message: format!("{error:#}"),
        }
    }

    pub(crate) fn connection(error: &anyhow::Error) -> Self {
        Error::Connection(format!("{error:#}"))
    }

    /// Whether the caller may recover by reconnecting and retrying.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Connection(_) | Error::Disconnected | Error::Driver { .. }
        )
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Config(e.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
