//! BMS BLE bridge library
//! Reads battery management systems over Bluetooth Low Energy and hands the
//! decoded readings to a backend sink.

// Module declarations
pub mod config;
pub mod core;
pub mod delivery;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod test_utils;
pub mod utils;

pub use error::{BmsError, Result};
pub use logging::setup_logging;
