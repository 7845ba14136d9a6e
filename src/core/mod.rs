//! Core functionality for the BMS bridge
//! This module contains the radio-facing state machine and the BMS decoder

pub mod battery;
pub mod bluetooth;

// Re-export commonly used types
pub use battery::{CellVoltageReport, DataParser, DeviceStatusReport};
pub use bluetooth::BluetoothManager;
