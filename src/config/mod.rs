pub mod discovery_config;

use std::path::Path;

use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::discovery_config::DiscoveryConfig;
use crate::error::Result;
use crate::utils::ensure_directory_exists;

pub use discovery_config::{DiscoveryCriteria, ManufacturerDataMatch};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub discovery: DiscoveryConfig,
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.discovery.validate()
    }

    /// Loads the config from a configuration file.
    pub async fn load_config(path: impl AsRef<Path>) -> Result<Self> {
        let file_path = path.as_ref();
        let file_path_str = file_path.to_string_lossy().into_owned();

        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path_str);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path).await?;
        let config: Self = serde_json::from_str(&config_json)?;
        config.validate()?;

        info!("Config loaded from {:?}", file_path_str);
        Ok(config)
    }

    /// Saves the current config to a configuration file.
    pub async fn save_config(&self, path: impl AsRef<Path>) -> Result<()> {
        let file_path = path.as_ref();
        if let Some(config_dir) = file_path.parent() {
            ensure_directory_exists(config_dir).await?;
        }
        let file_path_str = file_path.to_string_lossy().into_owned();

        let config_json = match serde_json::to_string_pretty(&self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize engine config to JSON: {}", e);
                return Err(e.into());
            }
        };

        fs::write(file_path, config_json).await?;
        info!("Engine config saved to {:?}", file_path_str);
        Ok(())
    }
}
