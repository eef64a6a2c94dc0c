//! Notification subscription bookkeeping for one characteristic.
//!
//! The desired flag is updated as soon as a caller asks; the platform call is
//! dispatched only when nothing is in flight. When a call completes and the
//! desired flag moved in the meantime, the opposite call is dispatched right
//! away, so the last request always wins and at most one platform call per
//! characteristic is ever outstanding.

use log::debug;

use crate::core::bluetooth::commands::Reply;
use crate::error::{Error, Result};

#[derive(Default)]
pub(crate) struct NotificationState {
    desired: bool,
    actual: bool,
    in_flight: Option<bool>,
    waiters: Vec<Reply<()>>,
}

impl NotificationState {
    pub fn actual(&self) -> bool {
        self.actual
    }

    /// Records a caller's intent. Returns the value to send to the platform, if any.
    pub fn request(&mut self, enabled: bool, waiter: Option<Reply<()>>) -> Option<bool> {
        self.desired = enabled;
        if let Some(waiter) = waiter {
            self.waiters.push(waiter);
        }
        self.next_action()
    }

    /// Applies the platform's answer to the in-flight call.
    pub fn complete(&mut self, result: Result<()>) -> Option<bool> {
        let requested = match self.in_flight.take() {
            Some(requested) => requested,
            None => {
                debug!("Ignoring notification acknowledgement with nothing in flight");
                return None;
            }
        };

        match result {
            Ok(()) => {
                self.actual = requested;
                if self.actual != self.desired {
                    debug!("Notification intent changed to {} while in flight, reversing", self.desired);
                }
                self.next_action()
            }
            Err(e) => {
                // The subscription did not change, so neither does the intent.
                self.desired = self.actual;
                for waiter in self.waiters.drain(..) {
                    let _ = waiter.send(Err(e.clone()));
                }
                None
            }
        }
    }

    /// The characteristic went away. The intent survives so the subscription
    /// can be restored when it returns.
    pub fn suspend(&mut self, error: Error) {
        self.actual = false;
        self.in_flight = None;
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    /// The characteristic is reachable again.
    pub fn resume(&mut self) -> Option<bool> {
        self.next_action()
    }

    fn next_action(&mut self) -> Option<bool> {
        if self.in_flight.is_some() {
            return None;
        }
        if self.actual != self.desired {
            self.in_flight = Some(self.desired);
            return Some(self.desired);
        }
        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Ok(()));
        }
        None
    }
}
