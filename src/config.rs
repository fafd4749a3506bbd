//! Configuration
//!
//! Loads configuration from TOML file at `~/.config/vmdisplay/config.toml`.
//! Auto-generates default config file on first run if missing.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub capture: CaptureConfig,
}

/// Capture session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    /// Console to attach to (QEMU numbers heads from 0)
    pub console: u32,
    /// Frame sampling rate in frames per second
    pub fps: u32,
    /// Resolution hint sent to the guest after connecting, both must be
    /// set for the hint to be sent
    pub preferred_width: Option<u32>,
    pub preferred_height: Option<u32>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            console: 0,
            fps: 30,
            preferred_width: None,
            preferred_height: None,
        }
    }
}

impl Config {
    /// Load configuration from file, or use defaults if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            // Auto-generate default config file
            if let Err(e) = Self::save_default(&config_path) {
                warn!("Failed to create default config file: {}", e);
            }
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = toml::from_str(&content).context("Failed to parse config file")?;

        info!("Configuration loaded from {:?}", config_path);
        debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Get the path to the config file
    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("vmdisplay");

        Ok(config_dir.join("config.toml"))
    }

    /// Save default configuration to file
    fn save_default(path: &PathBuf) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let default_config = Self::default();
        let toml_string =
            toml::to_string_pretty(&default_config).context("Failed to serialize default config")?;

        fs::write(path, toml_string).context("Failed to write default config file")?;

        info!("Created default config file at {:?}", path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_roundtrips_through_toml() {
        let toml = toml::to_string_pretty(&Config::default()).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.capture.console, 0);
        assert_eq!(parsed.capture.fps, 30);
        assert!(parsed.capture.preferred_width.is_none());
    }

    #[test]
    fn test_section_typo_rejected_not_defaulted() {
        // The [capture] section is required so typos surface instead of
        // silently falling back to defaults
        assert!(toml::from_str::<Config>("[captur]\nconsole = 1").is_err());
    }
}
