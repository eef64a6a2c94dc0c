use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, warn};
use tokio::sync::mpsc;

use crate::core::gatt::characteristic::{Availability, Characteristic};
use crate::core::record_access::{
    RecordAccessMessage, RecordAccessOpCode, RecordAccessOperand, RecordAccessPayload, RecordAccessResponseCode,
    RecordSelection,
};
use crate::error::{Error, Result};

/// Client for one Record Access control point.
///
/// Requests carry no transaction id on the wire, so at most one exchange may
/// be outstanding per control point; a second request fails with
/// [`Error::RecordAccessInFlight`] instead of waiting. Clones share that
/// limit. `abort_operation` is the exception: it exists to interrupt a
/// running exchange and has its own slot.
///
/// An exchange stays outstanding until the device terminates it or the
/// characteristic becomes unreachable. A caller that stops waiting does not
/// free the slot.
#[derive(Clone)]
pub struct RecordAccessControlPoint {
    characteristic: Characteristic<RecordAccessPayload>,
    exchange: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
}

struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::RecordAccessInFlight)?;
        Ok(Self(flag.clone()))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl RecordAccessControlPoint {
    pub fn new(characteristic: Characteristic<RecordAccessPayload>) -> Self {
        Self {
            characteristic,
            exchange: Arc::new(AtomicBool::new(false)),
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn characteristic(&self) -> &Characteristic<RecordAccessPayload> {
        &self.characteristic
    }

    pub fn is_busy(&self) -> bool {
        self.exchange.load(Ordering::Acquire)
    }

    /// Sends a request and waits for the response that terminates it.
    ///
    /// Returns the terminating message: a successful general response, or
    /// the number-of-records response for a count request. A rejection is
    /// surfaced as [`Error::RecordAccess`] with the device's code, a response
    /// that does not parse as [`Error::RecordAccessResponseFormat`].
    pub async fn send_request(&self, request: RecordAccessMessage) -> Result<RecordAccessMessage> {
        if !request.op_code.is_request() {
            return Err(Error::RecordAccessResponseFormat(format!(
                "{:?} cannot be sent as a request",
                request.op_code
            )));
        }
        let slot = if request.op_code == RecordAccessOpCode::AbortOperation {
            &self.abort
        } else {
            &self.exchange
        };
        let in_flight = InFlight::acquire(slot)?;

        let characteristic = self.characteristic.clone();
        let exchange = tokio::spawn(async move {
            let _in_flight = in_flight;
            run_exchange(characteristic, request).await
        });
        exchange.await.map_err(|_| Error::EngineStopped)?
    }

    /// Number of stored records matching `selection`.
    pub async fn report_number_of_stored_records(&self, selection: RecordSelection) -> Result<u16> {
        let response = self
            .send_request(RecordAccessMessage::report_number_of_stored_records(selection))
            .await?;
        match response.operand {
            RecordAccessOperand::NumberOfRecords(count) => Ok(count),
            other => Err(Error::RecordAccessResponseFormat(format!(
                "expected a number of records, got {other:?}"
            ))),
        }
    }

    /// Asks the device to send matching records on their own characteristic.
    /// Completes once the device confirms the transfer is over.
    pub async fn report_stored_records(&self, selection: RecordSelection) -> Result<()> {
        self.send_request(RecordAccessMessage::report_stored_records(selection))
            .await
            .map(|_| ())
    }

    pub async fn delete_stored_records(&self, selection: RecordSelection) -> Result<()> {
        self.send_request(RecordAccessMessage::delete_stored_records(selection))
            .await
            .map(|_| ())
    }

    /// Interrupts the running exchange. The interrupted request then fails
    /// with a procedure-not-completed code.
    pub async fn abort_operation(&self) -> Result<()> {
        self.send_request(RecordAccessMessage::abort_operation())
            .await
            .map(|_| ())
    }
}

async fn run_exchange(
    characteristic: Characteristic<RecordAccessPayload>,
    request: RecordAccessMessage,
) -> Result<RecordAccessMessage> {
    if !characteristic.is_notifying() {
        characteristic.enable_notifications().await?;
    }

    let (responses, mut incoming) = mpsc::unbounded_channel();
    let _subscription = characteristic.on_change(move |payload| {
        if let Some(payload) = payload {
            let _ = responses.send(payload.clone());
        }
    });
    let mut availability = characteristic.watch_availability();

    debug!("Record access request: {:?}", request);
    characteristic.write(RecordAccessPayload::from(request)).await?;

    loop {
        tokio::select! {
            payload = incoming.recv() => {
                // Handlers are dropped when the connection ends.
                let Some(payload) = payload else {
                    return Err(Error::Disconnected);
                };
                let outcome = match payload.message() {
                    Ok(message) => settle(request.op_code, message),
                    Err(error) => reject_malformed(request.op_code, error),
                };
                if let Some(outcome) = outcome {
                    return outcome;
                }
            }
            changed = availability.changed() => {
                if changed.is_err() {
                    return Err(Error::Disconnected);
                }
                if *availability.borrow_and_update() != Availability::Available {
                    characteristic.ensure_available()?;
                }
            }
        }
    }
}

/// A payload that does not parse ends a running exchange. An abort keeps
/// waiting, since the payload may belong to the exchange it interrupts.
fn reject_malformed(request: RecordAccessOpCode, error: Error) -> Option<Result<RecordAccessMessage>> {
    warn!("Malformed record access response while waiting for {:?}: {}", request, error);
    (request != RecordAccessOpCode::AbortOperation).then_some(Err(error))
}

/// Decides whether `message` ends the exchange for `request`.
fn settle(request: RecordAccessOpCode, message: RecordAccessMessage) -> Option<Result<RecordAccessMessage>> {
    let unexpected = |message: &RecordAccessMessage| -> Option<Result<RecordAccessMessage>> {
        Some(Err(Error::RecordAccessResponseFormat(format!(
            "{message:?} does not answer {request:?}"
        ))))
    };

    if let Some(response) = message.as_general_response() {
        if response.request == request {
            return match response.code {
                RecordAccessResponseCode::Success if request == RecordAccessOpCode::ReportNumberOfStoredRecords => {
                    unexpected(&message)
                }
                RecordAccessResponseCode::Success => Some(Ok(message)),
                code => Some(Err(Error::RecordAccess { request, code })),
            };
        }
        if response.request == RecordAccessOpCode::AbortOperation {
            // A failed abort leaves the running exchange untouched.
            return response.code.is_success().then_some(Err(Error::RecordAccess {
                request,
                code: RecordAccessResponseCode::ProcedureNotCompleted,
            }));
        }
        if request == RecordAccessOpCode::AbortOperation {
            return None;
        }
        return unexpected(&message);
    }

    match message.op_code {
        RecordAccessOpCode::NumberOfStoredRecordsResponse
            if request == RecordAccessOpCode::ReportNumberOfStoredRecords =>
        {
            Some(Ok(message))
        }
        // Traffic belonging to the exchange an abort interrupts.
        _ if request == RecordAccessOpCode::AbortOperation => None,
        _ => {
            warn!("Unexpected record access message while waiting for {:?}: {:?}", request, message);
            unexpected(&message)
        }
    }
}
