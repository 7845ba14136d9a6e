use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    COMMAND_GAP_MS, DEFAULT_CHECK_INTERVAL_MS, DEFAULT_SCAN_DURATION_MS,
    DEFAULT_SCAN_INTERVAL_MS, DEFAULT_SCAN_WINDOW_MS, DEFAULT_WAIT_TIMEOUT_MS,
    DISCONNECT_SETTLE_MS, NOTIFY_SETTLE_MS,
};
use crate::core::bluetooth::radio::ScanParams;
use crate::core::bluetooth::types::DeviceAddress;

/// Fixed delays the radio needs between commands, plus the poll cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTimings {
    /// After a disconnect, before the next command
    pub disconnect_settle: Duration,
    /// After writing the CCCD
    pub notify_settle: Duration,
    /// Between the two request frames
    pub command_gap: Duration,
    /// How often a wait samples the state
    pub check_interval: Duration,
}

impl Default for SessionTimings {
    fn default() -> Self {
        BluetoothConfig::default().timings()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// Whether sweeps talk to the BMS at all
    pub enabled: bool,

    /// Addresses of interest; scan results for anything else are ignored
    pub devices: Vec<DeviceAddress>,

    /// Length of a scan in ms
    pub scan_duration_ms: u64,

    /// Radio scan interval and window in ms
    pub scan_interval_ms: u64,
    pub scan_window_ms: u64,

    /// Request scan responses
    pub active_scan: bool,

    /// Hard timeout of every wait on the session state, in ms
    pub wait_timeout_ms: u64,

    /// Poll cadence of those waits, in ms
    pub check_interval_ms: u64,

    pub disconnect_settle_ms: u64,
    pub notify_settle_ms: u64,
    pub command_gap_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        BluetoothConfig {
            enabled: true,
            devices: Vec::new(),
            scan_duration_ms: DEFAULT_SCAN_DURATION_MS,
            scan_interval_ms: DEFAULT_SCAN_INTERVAL_MS,
            scan_window_ms: DEFAULT_SCAN_WINDOW_MS,
            active_scan: true,
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            check_interval_ms: DEFAULT_CHECK_INTERVAL_MS,
            disconnect_settle_ms: DISCONNECT_SETTLE_MS,
            notify_settle_ms: NOTIFY_SETTLE_MS,
            command_gap_ms: COMMAND_GAP_MS,
        }
    }
}

impl BluetoothConfig {
    pub fn scan_params(&self) -> ScanParams {
        ScanParams {
            duration: Duration::from_millis(self.scan_duration_ms),
            interval: Duration::from_millis(self.scan_interval_ms),
            window: Duration::from_millis(self.scan_window_ms),
            active: self.active_scan,
        }
    }

    pub fn timings(&self) -> SessionTimings {
        SessionTimings {
            disconnect_settle: Duration::from_millis(self.disconnect_settle_ms),
            notify_settle: Duration::from_millis(self.notify_settle_ms),
            command_gap: Duration::from_millis(self.command_gap_ms),
            check_interval: Duration::from_millis(self.check_interval_ms),
        }
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
