//! Bluetooth functionality for the BMS bridge
//! This module handles all bluetooth operations including scanning,
//! connecting, discovery and receiving data from BMS peers.

#[cfg(feature = "bluest")]
mod bluest_radio;
pub mod commands;
pub mod connection;
pub mod constants;
pub mod device;
mod manager;
pub mod notification;
pub mod radio;
pub mod scanner;
pub mod types;

// Re-export types that should be publicly accessible
#[cfg(feature = "bluest")]
pub use bluest_radio::BluestRadio;
pub use commands::{BmsCommand, cccd_value};
pub use device::BluetoothDevice;
pub use manager::BluetoothManager;
pub use notification::NotificationHandler;
pub use radio::{EventReceiver, EventSender, RadioAdapter, RadioEvent, ScanParams, event_channel};
pub use scanner::BluetoothScanner;
pub use types::{AttrHandle, ConnHandle, ConnectionState, DeviceAddress, HandleRange};
