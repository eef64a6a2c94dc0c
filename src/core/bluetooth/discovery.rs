//! Bookkeeping of which advertising peripherals are still nearby.
//!
//! Every accepted advertisement (re)arms a per-peripheral stale timer. All
//! timers live in one `DelayQueue` owned by the engine task, so expiry is
//! processed in the same isolation context as every other mutation.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::future::poll_fn;
use tokio_util::time::{DelayQueue, delay_queue};

use crate::core::bluetooth::types::{AdvertisementRecord, PeripheralId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Observation {
    /// First sighting, or first since the peripheral went stale.
    Added,
    Refreshed,
}

struct NearbyEntry {
    record: AdvertisementRecord,
    /// `None` while the timer is suspended or after it fired.
    timer: Option<delay_queue::Key>,
}

pub(crate) struct NearbySet {
    stale_timeout: Duration,
    entries: HashMap<PeripheralId, NearbyEntry>,
    timers: DelayQueue<PeripheralId>,
}

impl NearbySet {
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            stale_timeout,
            entries: HashMap::new(),
            timers: DelayQueue::new(),
        }
    }

    /// Records an advertisement and restarts the peripheral's stale timer.
    pub fn observe(&mut self, record: AdvertisementRecord) -> Observation {
        let id = record.id.clone();
        match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.record = merge(&entry.record, record);
                match &entry.timer {
                    Some(key) => self.timers.reset(key, self.stale_timeout),
                    None => entry.timer = Some(self.timers.insert(id, self.stale_timeout)),
                }
                Observation::Refreshed
            }
            None => {
                let timer = Some(self.timers.insert(id.clone(), self.stale_timeout));
                self.entries.insert(id, NearbyEntry { record, timer });
                Observation::Added
            }
        }
    }

    /// Stops the stale timer; connected peripherals never go stale.
    pub fn suspend_timer(&mut self, id: &PeripheralId) {
        if let Some(key) = self.entries.get_mut(id).and_then(|entry| entry.timer.take()) {
            self.timers.remove(&key);
        }
    }

    /// Starts a fresh stale timer for a peripheral that is visible again.
    pub fn rearm_timer(&mut self, id: &PeripheralId) {
        if let Some(entry) = self.entries.get_mut(id) {
            match &entry.timer {
                Some(key) => self.timers.reset(key, self.stale_timeout),
                None => entry.timer = Some(self.timers.insert(id.clone(), self.stale_timeout)),
            }
        }
    }

    pub fn remove(&mut self, id: &PeripheralId) -> Option<AdvertisementRecord> {
        let entry = self.entries.remove(id)?;
        if let Some(key) = entry.timer {
            self.timers.remove(&key);
        }
        Some(entry.record)
    }

    pub fn clear(&mut self) -> Vec<PeripheralId> {
        self.timers.clear();
        self.entries.drain().map(|(id, _)| id).collect()
    }

    pub fn get(&self, id: &PeripheralId) -> Option<&AdvertisementRecord> {
        self.entries.get(id).map(|entry| &entry.record)
    }

    pub fn contains(&self, id: &PeripheralId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &PeripheralId> {
        self.entries.keys()
    }

    pub fn records(&self) -> impl Iterator<Item = &AdvertisementRecord> {
        self.entries.values().map(|entry| &entry.record)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn has_pending_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Resolves with the next peripheral whose timer fired. Cancel safe.
    ///
    /// The record stays in the set; the caller decides whether it goes.
    pub async fn next_expired(&mut self) -> Option<PeripheralId> {
        let expired = poll_fn(|cx| self.timers.poll_expired(cx)).await?;
        let id = expired.into_inner();
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.timer = None;
        }
        Some(id)
    }
}

/// Re-advertisements often omit fields the first one carried.
fn merge(previous: &AdvertisementRecord, mut next: AdvertisementRecord) -> AdvertisementRecord {
    if next.name.is_none() {
        next.name = previous.name.clone();
    }
    if next.services.is_empty() {
        next.services = previous.services.clone();
    }
    if next.manufacturer_data.is_none() {
        next.manufacturer_data = previous.manufacturer_data.clone();
    }
    if next.service_data.is_empty() {
        next.service_data = previous.service_data.clone();
    }
    next
}
