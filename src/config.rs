//! Bridge configuration, loaded from a JSON file at startup.
//!
//! Default path is `/etc/ble-mqtt-bridge.json`, overridable through the
//! `BLE_MQTT_BRIDGE_CONFIG` environment variable. A missing file yields the
//! defaults (local broker, no devices).

use std::path::Path;

use serde::Deserialize;

use crate::error::{BridgeError, Result};

pub const CONFIG_ENV_VAR: &str = "BLE_MQTT_BRIDGE_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ble-mqtt-bridge.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: Option<String>,
    pub mqtt_password: Option<String>,
    /// Root of every topic this bridge publishes.
    pub base_topic: String,
    /// Prefix for Home Assistant discovery object ids, to avoid clashing
    /// with other bridges exposing the same hardware.
    pub mqtt_config_prefix: String,
    pub log_level: String,
    /// Host BLE interface handed to the transport and to adapter restarts.
    pub hci_adapter: String,
    /// Seconds between broker reconnection attempts.
    pub reconnection_interval: u64,
    pub devices: Vec<DeviceEntry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_user: None,
            mqtt_password: None,
            base_topic: "blemqtt".to_string(),
            mqtt_config_prefix: "bmb_".to_string(),
            log_level: "info".to_string(),
            hci_adapter: "hci0".to_string(),
            reconnection_interval: 10,
            devices: Vec::new(),
        }
    }
}

/// One configured peripheral.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceEntry {
    /// Device type key, e.g. `redmond200` or `am43`.
    #[serde(rename = "type")]
    pub device_type: String,
    /// MAC address, colon-separated hex.
    pub address: String,
    pub friendly_name: Option<String>,
    /// Pairing key for types that authenticate (16 hex characters).
    pub key: Option<String>,
    /// Force passive/active operation for types supporting both.
    pub passive: Option<bool>,
    /// Presence threshold in seconds.
    pub threshold: Option<u64>,
    /// Override for the missing-device restart threshold.
    pub connection_failures_limit: Option<u32>,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|err| BridgeError::Config(format!("cannot read {}: {err}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|err| BridgeError::Config(format!("cannot parse {}: {err}", path.display())))
    }

    pub fn config_path() -> std::path::PathBuf {
        std::env::var(CONFIG_ENV_VAR)
            .unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string())
            .into()
    }
}
