//! Relay configuration management

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    pub relay: RelaySettings,
    /// Device-side proxy backend and its parameters
    pub device_proxy: ProxySelection,
    /// Host-side proxy backend and its parameters
    pub host_proxy: ProxySelection,
    /// Packet filters, applied in listed order
    #[serde(default)]
    pub filters: Vec<PluginSelection>,
    /// Packet injectors
    #[serde(default)]
    pub injectors: Vec<PluginSelection>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub log_level: String,
}

/// Which proxy backend to instantiate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySelection {
    /// Registered backend kind, e.g. "libusb" or "gadgetfs"
    pub kind: String,
    /// Backend-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

/// One filter or injector entry
///
/// # Example Configuration
/// ```toml
/// [[filters]]
/// kind = "log"
///
/// [[filters]]
/// kind = "rot13"
/// params = { endpoint = 0x81 }
///
/// [[injectors]]
/// kind = "periodic"
/// params = { endpoint = 0x81, interval_ms = 1000, payload = [0x00] }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginSelection {
    /// Registered plugin kind
    pub kind: String,
    /// Plugin-specific parameters
    #[serde(default)]
    pub params: toml::Table,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            relay: RelaySettings {
                log_level: "info".to_string(),
            },
            device_proxy: ProxySelection {
                kind: "libusb".to_string(),
                params: toml::Table::new(),
            },
            host_proxy: ProxySelection {
                kind: "gadgetfs".to_string(),
                params: toml::Table::new(),
            },
            filters: Vec::new(),
            injectors: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Default configuration file location
    pub fn default_path() -> PathBuf {
        if let Some(config_dir) = dirs::config_dir() {
            config_dir.join("usb-mitm").join("relay.toml")
        } else {
            PathBuf::from(".config/usb-mitm/relay.toml")
        }
    }

    /// Load from an explicit path, or from the default location
    pub fn load(path: Option<PathBuf>) -> Result<Self> {
        let path = path.unwrap_or_else(Self::default_path);
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    /// Load from the default location, falling back to built-in defaults
    pub fn load_or_default() -> Self {
        let path = Self::default_path();
        if path.exists() {
            match Self::load(Some(path)) {
                Ok(config) => return config,
                Err(err) => {
                    eprintln!("Warning: {err:#}; using defaults");
                }
            }
        }
        Self::default()
    }

    /// Write the configuration to `path`, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let contents = toml::to_string_pretty(self).context("failed to serialize config")?;
        fs::write(path, contents)
            .with_context(|| format!("failed to write config file {}", path.display()))
    }
}
