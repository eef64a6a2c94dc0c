//! Seam between the engine and the platform radio.
//!
//! The engine never polls the radio. Unsolicited happenings (advertisements,
//! link loss, pushed values, GATT table changes) arrive on the stream returned
//! by [`RadioDriver::events`]; every operation the engine starts is an async
//! call whose completion is fed back into the engine's isolation context.

use anyhow::Result;
use futures_util::stream::BoxStream;
use uuid::Uuid;

use crate::core::bluetooth::types::{
    AdvertisementRecord, CharacteristicTarget, DiscoveredService, PeripheralId,
};

/// Unsolicited event delivered by the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// A peripheral advertised (first sighting or re-advertisement).
    Advertisement(AdvertisementRecord),
    /// The link to a peripheral dropped without the engine asking for it,
    /// or the driver confirmed a requested disconnect late.
    Disconnected {
        peripheral: PeripheralId,
        reason: Option<String>,
    },
    /// Notification or indication carrying a new characteristic value.
    ValueUpdated {
        target: CharacteristicTarget,
        value: Vec<u8>,
    },
    /// The peripheral's GATT table changed; services must be rediscovered.
    ServicesChanged { peripheral: PeripheralId },
}

/// Platform radio driver used by the engine.
///
/// Calls may suspend for as long as the radio needs; the engine never waits
/// on them inline, so a slow driver only delays the caller that asked.
#[async_trait::async_trait]
pub trait RadioDriver: Send + Sync + 'static {
    /// Event stream. Called once, when the engine starts.
    fn events(&self) -> BoxStream<'static, DriverEvent>;

    /// Start reporting advertisements; an empty filter reports every peripheral.
    async fn start_scan(&self, services: &[Uuid]) -> Result<()>;

    async fn stop_scan(&self) -> Result<()>;

    async fn connect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()>;

    async fn discover_services(&self, peripheral: &PeripheralId) -> Result<Vec<DiscoveredService>>;

    async fn read(&self, target: &CharacteristicTarget) -> Result<Vec<u8>>;

    /// Write and wait for the peripheral's acknowledgement.
    async fn write(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()>;

    /// Hand the write to the radio; resolves once the driver accepted it.
    async fn write_without_response(&self, target: &CharacteristicTarget, value: &[u8]) -> Result<()>;

    /// Subscribe to or unsubscribe from notifications of `target`.
    async fn set_notify(&self, target: &CharacteristicTarget, enabled: bool) -> Result<()>;
}
