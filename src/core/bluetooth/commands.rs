//! BMS request frames
//! This module builds the read requests written to the BMS write characteristic.

use crate::core::bluetooth::constants::{FRAME_END, FRAME_READ, FRAME_START};

/// BMS read commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BmsCommand {
    /// Aggregate status: voltage, current, capacity, temperatures (register 0x03)
    BasicInfo,
    /// Per-cell voltages (register 0x04)
    CellVoltages,
}

impl BmsCommand {
    /// Register read by this command
    pub fn register(&self) -> u8 {
        match self {
            Self::BasicInfo => 0x03,
            Self::CellVoltages => 0x04,
        }
    }

    /// Convert the command to its byte representation
    ///
    /// `DD A5 <register> 00 <checksum hi> <checksum lo> 77`
    pub fn to_bytes(&self) -> Vec<u8> {
        let body = [self.register(), 0x00];
        let [hi, lo] = checksum(&body).to_be_bytes();
        vec![FRAME_START, FRAME_READ, body[0], body[1], hi, lo, FRAME_END]
    }
}

/// Frame checksum: two's complement of the byte sum of register, length and data
pub fn checksum(body: &[u8]) -> u16 {
    let sum = body
        .iter()
        .fold(0u16, |acc, &byte| acc.wrapping_add(u16::from(byte)));
    0u16.wrapping_sub(sum)
}

/// Value written to the CCCD to turn notifications on or off
pub fn cccd_value(enable: bool) -> [u8; 2] {
    if enable { [0x01, 0x00] } else { [0x00, 0x00] }
}
