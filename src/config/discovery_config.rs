use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::bluetooth::constants::{DEFAULT_STALE_TIMEOUT, MIN_STALE_TIMEOUT};
use crate::core::bluetooth::types::AdvertisementRecord;
use crate::core::gatt::DeviceDescription;
use crate::error::{Error, Result};

/// Manufacturer data an advertisement must carry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerDataMatch {
    pub company_id: u16,
    /// Leading bytes the manufacturer payload must start with
    #[serde(default)]
    pub data_prefix: Vec<u8>,
}

/// Which advertisements count as a device of interest.
///
/// Every configured criterion must match; an empty set of criteria matches
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryCriteria {
    /// At least one of these services must be advertised
    #[serde(default)]
    pub services: Vec<Uuid>,
    /// Substring of the advertised local name
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub manufacturer: Option<ManufacturerDataMatch>,
}

impl DiscoveryCriteria {
    /// Criteria advertising any of the services a device model declares.
    pub fn from_description(description: &DeviceDescription) -> Self {
        Self {
            services: description.services.iter().map(|s| s.uuid).collect(),
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &AdvertisementRecord) -> bool {
        if !self.services.is_empty() && !record.services.iter().any(|s| self.services.contains(s)) {
            return false;
        }

        if let Some(needle) = &self.name_contains {
            let name_matches = record
                .name
                .as_ref()
                .map(|name| name.contains(needle.as_str()))
                .unwrap_or(false);
            if !name_matches {
                return false;
            }
        }

        if let Some(expected) = &self.manufacturer {
            let data_matches = record
                .manufacturer_data
                .as_ref()
                .map(|m| m.company_id == expected.company_id && m.data.starts_with(&expected.data_prefix))
                .unwrap_or(false);
            if !data_matches {
                return false;
            }
        }

        true
    }
}

/// Discovery, staleness and auto-connect settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    #[serde(default)]
    pub criteria: DiscoveryCriteria,
    /// Advertisements weaker than this are ignored
    #[serde(default)]
    pub min_rssi: Option<i16>,
    /// Seconds without a re-advertisement before a peripheral is no longer nearby
    pub stale_timeout_secs: f64,
    /// Connect on its own when exactly one candidate is nearby
    #[serde(default)]
    pub auto_connect: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        DiscoveryConfig {
            criteria: DiscoveryCriteria::default(),
            min_rssi: None,
            stale_timeout_secs: DEFAULT_STALE_TIMEOUT.as_secs_f64(),
            auto_connect: false,
        }
    }
}

impl DiscoveryConfig {
    pub fn validate(&self) -> Result<()> {
        if !self.stale_timeout_secs.is_finite() || self.stale_timeout_secs < MIN_STALE_TIMEOUT.as_secs_f64() {
            return Err(Error::Config(format!(
                "stale timeout must be at least {}s, got {}",
                MIN_STALE_TIMEOUT.as_secs(),
                self.stale_timeout_secs
            )));
        }
        Ok(())
    }

    pub fn stale_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.stale_timeout_secs)
    }

    /// Criteria and RSSI floor together.
    pub fn accepts(&self, record: &AdvertisementRecord) -> bool {
        if let (Some(floor), Some(rssi)) = (self.min_rssi, record.rssi) {
            if rssi < floor {
                return false;
            }
        }
        self.criteria.matches(record)
    }
}
