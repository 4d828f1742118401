// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::bluetooth::DEFAULT_BUFFER_SIZE;

const APP_DIR: &str = "spp-query";

/// Application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote device selection.
    pub device: DeviceConfig,

    /// Link settings.
    pub link: LinkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Name of the paired device to connect to.
    pub name: String,

    /// Explicit address. Skips the paired-device lookup when set.
    pub address: Option<String>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: "raspberrypi".to_string(),
            address: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// RFCOMM channel the SPP service listens on.
    pub rfcomm_channel: u8,

    /// Upper bound on the connect handshake, in seconds.
    pub connect_timeout_secs: u64,

    /// Receive buffer size in bytes.
    pub read_buffer_size: usize,

    /// Power the adapter on if it is off.
    pub power_on_adapter: bool,

    /// Whether this client may open connections at all.
    pub connect_allowed: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            rfcomm_channel: 1,
            connect_timeout_secs: 15,
            read_buffer_size: DEFAULT_BUFFER_SIZE,
            power_on_adapter: true,
            connect_allowed: true,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from the default file or create it.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            return Ok(toml::from_str(&content)?);
        }

        let config = Self::default();
        config.save_to(path)?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert!(path.exists());
        assert_eq!(config.device.name, "raspberrypi");
        assert_eq!(config.link.rfcomm_channel, 1);
        assert_eq!(config.link.read_buffer_size, 1024);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[device]\naddress = \"00:11:22:33:44:55\"\n\n[link]\nrfcomm_channel = 3\n",
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.device.name, "raspberrypi");
        assert_eq!(config.device.address.as_deref(), Some("00:11:22:33:44:55"));
        assert_eq!(config.link.rfcomm_channel, 3);
        assert_eq!(config.link.connect_timeout_secs, 15);
        assert!(config.link.connect_allowed);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.device.name = "bench-meter".to_string();
        config.link.power_on_adapter = false;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.device.name, "bench-meter");
        assert!(!loaded.link.power_on_adapter);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "link = 5").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
