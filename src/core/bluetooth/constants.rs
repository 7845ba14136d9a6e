//! Constants used throughout the Bluetooth module
//! This module contains the GATT layout the BMS exposes, the frame markers of
//! its wire protocol and the default timings of a session.

use uuid::Uuid;

/// Standard Bluetooth Service UUIDs
pub const UUID_GENERIC_ACCESS_SERVICE: Uuid = Uuid::from_u128(0x00001800_0000_1000_8000_00805f9b34fb);

/// The UUID of the BMS vendor service (16-bit alias 0xFF00)
pub const UUID_BMS_SERVICE: Uuid = Uuid::from_u128(0x0000ff00_0000_1000_8000_00805f9b34fb);

/// The UUID of the BMS notification characteristic (0xFF01)
pub const UUID_BMS_NOTIFY_CHAR: Uuid = Uuid::from_u128(0x0000ff01_0000_1000_8000_00805f9b34fb);

/// The UUID of the BMS write characteristic (0xFF02)
pub const UUID_BMS_WRITE_CHAR: Uuid = Uuid::from_u128(0x0000ff02_0000_1000_8000_00805f9b34fb);

/// Client Characteristic Configuration Descriptor (0x2902)
pub const UUID_CCCD: Uuid = Uuid::from_u128(0x00002902_0000_1000_8000_00805f9b34fb);

/// Characteristic User Description descriptor (0x2901)
pub const UUID_USER_DESCRIPTION: Uuid = Uuid::from_u128(0x00002901_0000_1000_8000_00805f9b34fb);

/// First byte of every BMS frame
pub const FRAME_START: u8 = 0xDD;

/// Second byte of a request frame (read)
pub const FRAME_READ: u8 = 0xA5;

/// Marker opening a multi-chunk status frame
pub const STATUS_FRAME_MARKER: [u8; 2] = [FRAME_START, 0x03];

/// Marker of a self-contained cell voltage frame
pub const CELL_VOLTAGE_FRAME_MARKER: [u8; 2] = [FRAME_START, 0x04];

/// Last byte of every BMS frame; alone in a chunk it closes a status frame
pub const FRAME_END: u8 = 0x77;

/// Temperatures are reported in tenths of a Kelvin
pub const KELVIN_OFFSET_DECI: i32 = 2731;

/// Scan duration in milliseconds
pub const DEFAULT_SCAN_DURATION_MS: u64 = 5000;

/// Radio scan interval and window in milliseconds
pub const DEFAULT_SCAN_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_SCAN_WINDOW_MS: u64 = 3000;

/// Hard timeout for each wait on the session state, in milliseconds
pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 15_000;

/// How often a wait samples the session state, in milliseconds
pub const DEFAULT_CHECK_INTERVAL_MS: u64 = 100;

/// Delay after a disconnect before the radio accepts the next command
pub const DISCONNECT_SETTLE_MS: u64 = 1000;

/// Delay after writing the CCCD
pub const NOTIFY_SETTLE_MS: u64 = 500;

/// Delay between the cell voltage request and the status request
pub const COMMAND_GAP_MS: u64 = 1000;
