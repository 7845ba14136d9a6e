pub mod bluetooth_config;

use std::path::Path;

use anyhow::{Context, Result};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::bluetooth_config::BluetoothConfig;

/// Default pause between two sweeps, in seconds
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Verbose logging
    pub debug: bool,
    /// Pause between two sweeps, in seconds
    pub sweep_interval_secs: u64,
    pub bluetooth: BluetoothConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            debug: false,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            bluetooth: BluetoothConfig::default(),
        }
    }
}

impl AppConfig {
    /// Loads the config from a JSON file; fields missing from the file keep their defaults.
    pub async fn load_config(file_path: &Path) -> Result<Self> {
        if !file_path.exists() {
            warn!("Config file not found at {:?}, using default.", file_path);
            return Ok(Self::default());
        }

        let config_json = fs::read_to_string(file_path)
            .await
            .with_context(|| format!("failed to read config file {:?}", file_path))?;
        let config = Self::from_json(&config_json)
            .with_context(|| format!("invalid config file {:?}", file_path))?;

        info!("Config loaded from {:?}", file_path);
        Ok(config)
    }

    pub fn from_json(config_json: &str) -> Result<Self> {
        Ok(serde_json::from_str(config_json)?)
    }

    /// Age after which a peer missing `sweeps` readings in a row counts as stale
    pub fn stale_after(&self, sweeps: u64) -> chrono::Duration {
        i64::try_from(self.sweep_interval_secs.saturating_mul(sweeps))
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::bluetooth::types::DeviceAddress;

    #[test]
    fn test_partial_config_keeps_defaults() {
        let config = AppConfig::from_json(
            r#"{
                "debug": true,
                "bluetooth": {
                    "devices": ["A5:C2:37:2D:D9:E4", "a5:c2:37:2d:c6:18"],
                    "wait_timeout_ms": 20000
                }
            }"#,
        )
        .unwrap();

        assert!(config.debug);
        assert_eq!(config.sweep_interval_secs, DEFAULT_SWEEP_INTERVAL_SECS);
        assert!(config.bluetooth.enabled);
        assert_eq!(
            config.bluetooth.devices,
            vec![
                DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]),
                DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xC6, 0x18]),
            ]
        );
        assert_eq!(config.bluetooth.wait_timeout(), Duration::from_secs(20));
        assert_eq!(config.bluetooth.timings().notify_settle, Duration::from_millis(500));
        assert_eq!(config.bluetooth.scan_params().duration, Duration::from_secs(5));
    }

    #[test]
    fn test_invalid_address_is_rejected() {
        let result = AppConfig::from_json(r#"{ "bluetooth": { "devices": ["not-an-address"] } }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_stale_after_saturates() {
        let config = AppConfig::default();
        assert_eq!(config.stale_after(5), chrono::Duration::minutes(5));

        let config = AppConfig {
            sweep_interval_secs: u64::MAX,
            ..AppConfig::default()
        };
        assert_eq!(config.stale_after(5), chrono::Duration::MAX);
    }

    #[tokio::test]
    async fn test_missing_file_uses_default() {
        let config = AppConfig::load_config(Path::new("/nonexistent/bms-bridge.json"))
            .await
            .unwrap();
        assert!(config.bluetooth.devices.is_empty());
        assert_eq!(config.bluetooth.wait_timeout_ms, 15_000);
    }
}
