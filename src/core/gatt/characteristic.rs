//! Per-characteristic synchronization context and its typed accessor.
//!
//! The engine owns the context (it routes values and availability changes
//! into it); a device model holds a [`Characteristic`] accessor onto it. Reads
//! of the cache always see a consistent snapshot, and the cache is cleared the
//! moment the characteristic becomes unreachable.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::debug;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::core::bluetooth::commands::LinkRequest;
use crate::core::bluetooth::types::CharacteristicTarget;
use crate::core::gatt::codec::CharacteristicValue;
use crate::error::{Error, Result};

/// Whether an accessor can currently reach its characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Availability {
    /// Never bound to a connection.
    Unbound,
    Available,
    /// Connected, but the peripheral does not implement it.
    Missing,
    /// The connection it was bound to is gone.
    Disconnected,
}

/// Engine-side route into a bound context.
#[derive(Debug, Clone)]
pub(crate) struct ContextLink {
    pub target: CharacteristicTarget,
    pub requests: mpsc::WeakUnboundedSender<LinkRequest>,
}

/// Type-erased view of a context, as the engine sees it.
pub(crate) trait CharacteristicBinding: Send + Sync {
    fn notify_by_default(&self) -> bool;

    fn value_type(&self) -> &'static str;

    fn bind(&self, link: ContextLink, available: bool);

    /// Decodes a pushed or read value and replaces the cache. On failure the
    /// cache is left untouched.
    fn handle_value(&self, value: &[u8]) -> Result<()>;

    /// The characteristic appeared or vanished while the link stayed up.
    fn handle_services_change(&self, available: bool);

    fn handle_notify_state(&self, notifying: bool);

    /// Connection is gone: clear the cache and drop every change handler.
    fn unbind(&self);
}

type ChangeHandler<V> = Arc<dyn Fn(Option<&V>) + Send + Sync>;

struct Context<V> {
    characteristic: Uuid,
    notify_by_default: bool,
    link: Mutex<Option<ContextLink>>,
    cache: watch::Sender<Option<V>>,
    availability: watch::Sender<Availability>,
    notifying: AtomicBool,
    handlers: Mutex<Vec<(u64, ChangeHandler<V>)>>,
    next_handler: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<V: CharacteristicValue> Context<V> {
    fn replace_cache(&self, value: Option<V>) {
        self.cache.send_replace(value.clone());
        let handlers: Vec<ChangeHandler<V>> = lock(&self.handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            handler(value.as_ref());
        }
    }
}

impl<V: CharacteristicValue> CharacteristicBinding for Context<V> {
    fn notify_by_default(&self) -> bool {
        self.notify_by_default
    }

    fn value_type(&self) -> &'static str {
        std::any::type_name::<V>()
    }

    fn bind(&self, link: ContextLink, available: bool) {
        debug!("Binding {} (available: {})", link.target, available);
        *lock(&self.link) = Some(link);
        self.availability.send_replace(if available {
            Availability::Available
        } else {
            Availability::Missing
        });
    }

    fn handle_value(&self, value: &[u8]) -> Result<()> {
        let decoded = V::from_bytes(value)?;
        self.replace_cache(Some(decoded));
        Ok(())
    }

    fn handle_services_change(&self, available: bool) {
        if available {
            self.availability.send_replace(Availability::Available);
        } else {
            self.availability.send_replace(Availability::Missing);
            self.notifying.store(false, Ordering::SeqCst);
            self.replace_cache(None);
        }
    }

    fn handle_notify_state(&self, notifying: bool) {
        self.notifying.store(notifying, Ordering::SeqCst);
    }

    fn unbind(&self) {
        self.availability.send_replace(Availability::Disconnected);
        self.notifying.store(false, Ordering::SeqCst);
        self.cache.send_replace(None);
        lock(&self.handlers).clear();
        lock(&self.link).take();
    }
}

/// Typed accessor for one declared characteristic.
///
/// Cloning is cheap; all clones share the same context.
pub struct Characteristic<V: CharacteristicValue> {
    context: Arc<Context<V>>,
}

impl<V: CharacteristicValue> Clone for Characteristic<V> {
    fn clone(&self) -> Self {
        Self {
            context: self.context.clone(),
        }
    }
}

impl<V: CharacteristicValue> fmt::Debug for Characteristic<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Characteristic")
            .field("uuid", &self.context.characteristic)
            .field("availability", &*self.context.availability.borrow())
            .field("cached", &*self.context.cache.borrow())
            .finish()
    }
}

impl<V: CharacteristicValue> Characteristic<V> {
    pub(crate) fn new(characteristic: Uuid, notify_by_default: bool) -> Self {
        let (cache, _) = watch::channel(None);
        let (availability, _) = watch::channel(Availability::Unbound);
        Self {
            context: Arc::new(Context {
                characteristic,
                notify_by_default,
                link: Mutex::new(None),
                cache,
                availability,
                notifying: AtomicBool::new(false),
                handlers: Mutex::new(Vec::new()),
                next_handler: AtomicU64::new(0),
            }),
        }
    }

    pub(crate) fn binding(&self) -> Arc<dyn CharacteristicBinding> {
        self.context.clone()
    }

    pub fn uuid(&self) -> Uuid {
        self.context.characteristic
    }

    /// Last known value; `None` when unknown or no longer reachable.
    pub fn cached(&self) -> Option<V> {
        self.context.cache.borrow().clone()
    }

    /// Watch the cache. Every replacement is signalled, even with an equal value.
    pub fn subscribe(&self) -> watch::Receiver<Option<V>> {
        self.context.cache.subscribe()
    }

    pub fn availability(&self) -> Availability {
        *self.context.availability.borrow()
    }

    pub fn watch_availability(&self) -> watch::Receiver<Availability> {
        self.context.availability.subscribe()
    }

    pub fn is_available(&self) -> bool {
        self.availability() == Availability::Available
    }

    pub fn is_notifying(&self) -> bool {
        self.context.notifying.load(Ordering::SeqCst)
    }

    /// Registers a closure called on every cache replacement, in delivery
    /// order. It runs on the engine task and must not block.
    ///
    /// The closure stays registered until the returned subscription is dropped
    /// or the connection ends.
    pub fn on_change<F>(&self, handler: F) -> ChangeSubscription
    where
        F: Fn(Option<&V>) + Send + Sync + 'static,
    {
        let id = self.context.next_handler.fetch_add(1, Ordering::Relaxed);
        lock(&self.context.handlers).push((id, Arc::new(handler)));

        let context: Weak<Context<V>> = Arc::downgrade(&self.context);
        ChangeSubscription {
            cancel: Some(Box::new(move || {
                if let Some(context) = context.upgrade() {
                    lock(&context.handlers).retain(|(handler_id, _)| *handler_id != id);
                }
            })),
        }
    }

    /// Reads the value from the peripheral.
    ///
    /// Dropping the future early does not cancel the radio operation; when it
    /// completes the cache is still updated.
    pub async fn read(&self) -> Result<V> {
        let target = self.target()?;
        let bytes = self.send(|reply| LinkRequest::Read { target, reply }).await?;
        V::from_bytes(&bytes)
    }

    /// Writes the value and waits for the peripheral's acknowledgement.
    pub async fn write(&self, value: V) -> Result<()> {
        let target = self.target()?;
        let value = value.to_bytes();
        self.send(|reply| LinkRequest::Write {
            target,
            value,
            reply: Some(reply),
        })
        .await
    }

    /// Hands the write to the engine and returns. Failures in flight are only logged.
    pub fn write_without_response(&self, value: V) -> Result<()> {
        let target = self.target()?;
        let requests = self.requests()?;
        requests
            .send(LinkRequest::Write {
                target,
                value: value.to_bytes(),
                reply: None,
            })
            .map_err(|_| Error::EngineStopped)
    }

    pub async fn enable_notifications(&self) -> Result<()> {
        self.set_notifications(true).await
    }

    pub async fn disable_notifications(&self) -> Result<()> {
        self.set_notifications(false).await
    }

    async fn set_notifications(&self, enabled: bool) -> Result<()> {
        let target = self.target()?;
        self.send(|reply| LinkRequest::SetNotify { target, enabled, reply })
            .await
    }

    /// Fails with the error an operation would get right now, if any.
    pub(crate) fn ensure_available(&self) -> Result<()> {
        self.target().map(|_| ())
    }

    fn target(&self) -> Result<CharacteristicTarget> {
        match self.availability() {
            Availability::Available => {}
            Availability::Unbound => return Err(Error::Unbound),
            Availability::Disconnected => return Err(Error::Disconnected),
            Availability::Missing => {
                let link = lock(&self.context.link);
                return Err(match link.as_ref() {
                    Some(link) => Error::Unavailable {
                        service: link.target.service,
                        characteristic: link.target.characteristic,
                    },
                    None => Error::Unbound,
                });
            }
        }
        lock(&self.context.link)
            .as_ref()
            .map(|link| link.target.clone())
            .ok_or(Error::Disconnected)
    }

    fn requests(&self) -> Result<mpsc::UnboundedSender<LinkRequest>> {
        lock(&self.context.link)
            .as_ref()
            .ok_or(Error::Disconnected)?
            .requests
            .upgrade()
            .ok_or(Error::EngineStopped)
    }

    async fn send<T>(&self, request: impl FnOnce(oneshot::Sender<Result<T>>) -> LinkRequest) -> Result<T> {
        let requests = self.requests()?;
        let (reply, response) = oneshot::channel();
        requests.send(request(reply)).map_err(|_| Error::EngineStopped)?;
        // The engine drops pending replies when it shuts down.
        response.await.map_err(|_| Error::EngineStopped)?
    }
}

/// Keeps a change handler registered; dropping it unregisters the handler.
pub struct ChangeSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ChangeSubscription {
    /// Keeps the handler registered for as long as the context lives.
    pub fn detach(mut self) {
        self.cancel = None;
    }
}

impl fmt::Debug for ChangeSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeSubscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for ChangeSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}
