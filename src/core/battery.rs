//! BMS response decoding
//! This module reassembles notification chunks into BMS frames and decodes
//! the cell voltage and status responses.

use chrono::NaiveDate;
use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::core::bluetooth::constants::{
    CELL_VOLTAGE_FRAME_MARKER, FRAME_END, KELVIN_OFFSET_DECI, STATUS_FRAME_MARKER,
};
use crate::error::ProtocolViolation;

/// Offset of the first field in a response frame
const PAYLOAD_OFFSET: usize = 4;

/// Shortest status frame that still carries the first temperature probe
pub const MIN_STATUS_FRAME_LEN: usize = 29;

/// Per-cell voltages, in cell order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellVoltageReport {
    /// Number of cells announced by the frame
    pub cell_count: usize,
    /// Cell voltages in mV
    pub voltages: Vec<u16>,
}

/// Aggregate electrical and thermal readings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatusReport {
    /// Pack voltage in V/100, passed through unscaled
    pub voltage: u16,
    /// Pack current in A/100, negative while discharging
    pub current: i16,
    /// Remaining capacity in Ah/100
    pub ahrem: u16,
    /// Nominal capacity in Ah/100
    pub ahmax: u16,
    /// Lifetime charge cycles
    pub cycles: u16,
    /// Manufacturing date, if the BMS reports a valid one
    pub production_date: Option<NaiveDate>,
    /// Protection flags bitmask
    pub protection_status: u16,
    /// Software version byte
    pub version: u8,
    /// State of charge in %
    pub soc: u8,
    /// MOSFET control bits
    pub fet: u8,
    /// Number of cells the BMS reports
    pub cells: u8,
    /// Number of temperature probes
    pub temperature_sensors: u8,
    /// First temperature probe in °C
    pub temperature: f64,
    /// Derived power, voltage × current / 10000
    pub watts: f64,
}

/// One decoded BMS response
#[derive(Debug, Clone, PartialEq)]
pub enum BmsResponse {
    CellVoltages(CellVoltageReport),
    Status(DeviceStatusReport),
}

fn be_u16(frame: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([frame[offset], frame[offset + 1]])
}

/// Decodes the packed production date: bits 15..9 year since 2000, 8..5 month, 4..0 day.
pub fn decode_production_date(raw: u16) -> Option<NaiveDate> {
    let year = 2000 + i32::from(raw >> 9);
    let month = u32::from((raw >> 5) & 0x0F);
    let day = u32::from(raw & 0x1F);
    NaiveDate::from_ymd_opt(year, month, day)
}

impl CellVoltageReport {
    /// Decodes a self-contained cell voltage frame.
    ///
    /// Byte 3 holds twice the cell count; the voltages follow as big-endian u16.
    /// Returns `None` when the frame is shorter than it announces.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        let cell_count = usize::from(*frame.get(3)?) / 2;
        let end = PAYLOAD_OFFSET + cell_count * 2;
        if frame.len() < end {
            return None;
        }

        let voltages = frame[PAYLOAD_OFFSET..end]
            .chunks_exact(2)
            .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]))
            .collect();

        Some(Self {
            cell_count,
            voltages,
        })
    }
}

impl DeviceStatusReport {
    /// Decodes a reassembled status frame.
    ///
    /// Returns `None` when the frame is too short to hold every field.
    pub fn decode(frame: &[u8]) -> Option<Self> {
        if frame.len() < MIN_STATUS_FRAME_LEN {
            return None;
        }

        let voltage = be_u16(frame, 4);
        // two's complement on the wire
        let current = be_u16(frame, 6) as i16;
        let temperature = f64::from(i32::from(be_u16(frame, 27)) - KELVIN_OFFSET_DECI) / 10.0;

        Some(Self {
            voltage,
            current,
            ahrem: be_u16(frame, 8),
            ahmax: be_u16(frame, 10),
            cycles: be_u16(frame, 12),
            production_date: decode_production_date(be_u16(frame, 14)),
            protection_status: be_u16(frame, 20),
            version: frame[22],
            soc: frame[23],
            fet: frame[24],
            cells: frame[25],
            temperature_sensors: frame[26],
            temperature,
            watts: f64::from(voltage) * f64::from(current) / 10000.0,
        })
    }
}

/// Reassembles BMS frames from notification chunks.
///
/// Only one status frame is open at a time: a new frame marker drops whatever
/// was buffered before. Lost notifications are expected, so a dropped partial
/// frame is not an error.
#[derive(Debug, Default)]
pub struct DataParser {
    partial_payload: Option<Vec<u8>>,
}

impl DataParser {
    /// Creates a new parser with no open frame
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while a status frame is being reassembled
    pub fn has_open_frame(&self) -> bool {
        self.partial_payload.is_some()
    }

    /// Feeds one notification payload.
    ///
    /// Returns a response once a frame completes, `None` while a frame is still
    /// open or when the chunk is discarded.
    pub fn parse_response(
        &mut self,
        data: &[u8],
    ) -> Result<Option<BmsResponse>, ProtocolViolation> {
        if data.starts_with(&CELL_VOLTAGE_FRAME_MARKER) {
            return match CellVoltageReport::decode(data) {
                Some(report) => Ok(Some(BmsResponse::CellVoltages(report))),
                None => {
                    warn!("Dropping truncated cell voltage frame: {}", hex::encode(data));
                    Ok(None)
                }
            };
        }

        if data == [FRAME_END] {
            let frame = self
                .partial_payload
                .take()
                .ok_or(ProtocolViolation::UnexpectedTerminator)?;

            return match DeviceStatusReport::decode(&frame) {
                Some(report) => Ok(Some(BmsResponse::Status(report))),
                None => {
                    warn!(
                        "Dropping status frame of {} bytes: {}",
                        frame.len(),
                        hex::encode(&frame)
                    );
                    Ok(None)
                }
            };
        }

        if data.starts_with(&STATUS_FRAME_MARKER) {
            if let Some(dropped) = self.partial_payload.replace(data.to_vec()) {
                debug!("Discarding unterminated status frame of {} bytes", dropped.len());
            }
            return Ok(None);
        }

        match self.partial_payload.as_mut() {
            Some(buffer) if !buffer.is_empty() => buffer.extend_from_slice(data),
            _ => trace!("Ignoring chunk outside of a frame: {}", hex::encode(data)),
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // DD 03 00 1B, 27 payload bytes, checksum
    const STATUS_FRAME: &str = concat!(
        "dd03001b",
        "0a28", // voltage 26.00 V
        "fffe", // current -0.02 A
        "2710", // remaining 100.00 Ah
        "2ee0", // nominal 120.00 Ah
        "0005", // cycles
        "2a8f", // 2021-04-15
        "00000000", // balance
        "0000", // protection
        "10530308", // version, soc, fet, cells
        "02", // probes
        "0bbd", // 27.4 °C
        "0bb7",
        "fc4e",
    );

    fn status_frame() -> Vec<u8> {
        hex::decode(STATUS_FRAME).unwrap()
    }

    fn feed(parser: &mut DataParser, chunks: &[&[u8]]) -> Option<BmsResponse> {
        let mut last = None;
        for chunk in chunks {
            last = parser.parse_response(chunk).unwrap();
        }
        last
    }

    #[test]
    fn test_cell_voltage_frame() {
        let mut parser = DataParser::new();
        let frame = hex::decode("dd0400040fa00fa10fa277").unwrap();

        let response = parser.parse_response(&frame).unwrap();
        assert_eq!(
            response,
            Some(BmsResponse::CellVoltages(CellVoltageReport {
                cell_count: 2,
                voltages: vec![4000, 4001],
            }))
        );
        assert!(!parser.has_open_frame());
    }

    #[test]
    fn test_cell_voltage_frame_leaves_open_status_frame_alone() {
        let mut parser = DataParser::new();
        let frame = status_frame();
        parser.parse_response(&frame[..20]).unwrap();
        parser
            .parse_response(&hex::decode("dd0400020fa0").unwrap())
            .unwrap();
        parser.parse_response(&frame[20..]).unwrap();

        let response = parser.parse_response(&[FRAME_END]).unwrap();
        assert!(matches!(response, Some(BmsResponse::Status(_))));
    }

    #[test]
    fn test_truncated_cell_voltage_frame_is_dropped() {
        let mut parser = DataParser::new();
        let frame = hex::decode("dd0400080fa00fa1").unwrap();
        assert_eq!(parser.parse_response(&frame).unwrap(), None);
    }

    #[test]
    fn test_status_frame_fields() {
        let mut parser = DataParser::new();
        let frame = status_frame();
        let Some(BmsResponse::Status(report)) = feed(&mut parser, &[&frame, &[FRAME_END]]) else {
            panic!("expected a status report");
        };

        assert_eq!(report.voltage, 2600);
        assert_eq!(report.current, -2);
        assert_eq!(report.ahrem, 10000);
        assert_eq!(report.ahmax, 12000);
        assert_eq!(report.cycles, 5);
        assert_eq!(report.production_date, NaiveDate::from_ymd_opt(2021, 4, 15));
        assert_eq!(report.protection_status, 0);
        assert_eq!(report.version, 0x10);
        assert_eq!(report.soc, 83);
        assert_eq!(report.fet, 3);
        assert_eq!(report.cells, 8);
        assert_eq!(report.temperature_sensors, 2);
        assert!((report.temperature - 27.4).abs() < 1e-9);
        assert!((report.watts - (-0.52)).abs() < 1e-9);
        assert!(!parser.has_open_frame());
    }

    #[test]
    fn test_positive_current_is_not_reinterpreted() {
        let mut frame = status_frame();
        frame[6..8].copy_from_slice(&[0x7F, 0xFF]);
        let report = DeviceStatusReport::decode(&frame).unwrap();
        assert_eq!(report.current, 0x7FFF);

        frame[6..8].copy_from_slice(&[0x80, 0x00]);
        let report = DeviceStatusReport::decode(&frame).unwrap();
        assert_eq!(report.current, -0x8000);
    }

    #[test]
    fn test_status_decode_ignores_chunk_boundaries() {
        let frame = status_frame();
        let expected = DeviceStatusReport::decode(&frame).unwrap();

        for first in 2..frame.len() {
            for second in first..=frame.len() {
                let mut parser = DataParser::new();
                let chunks: [&[u8]; 4] = [
                    &frame[..first],
                    &frame[first..second],
                    &frame[second..],
                    &[FRAME_END],
                ];
                let response = feed(&mut parser, &chunks);
                assert_eq!(
                    response,
                    Some(BmsResponse::Status(expected.clone())),
                    "split at {first}/{second}"
                );
            }
        }
    }

    #[test]
    fn test_terminator_without_open_frame_is_a_violation() {
        let mut parser = DataParser::new();
        assert_eq!(
            parser.parse_response(&[FRAME_END]),
            Err(ProtocolViolation::UnexpectedTerminator)
        );
    }

    #[test]
    fn test_new_frame_replaces_unterminated_frame() {
        let mut parser = DataParser::new();
        let frame = status_frame();

        parser.parse_response(&hex::decode("dd03001b0000").unwrap()).unwrap();
        parser.parse_response(&[0x11; 8]).unwrap();
        let response = feed(&mut parser, &[&frame[..10], &frame[10..], &[FRAME_END]]);

        assert_eq!(
            response,
            Some(BmsResponse::Status(DeviceStatusReport::decode(&frame).unwrap()))
        );
    }

    #[test]
    fn test_chunk_without_open_frame_is_ignored() {
        let mut parser = DataParser::new();
        assert_eq!(parser.parse_response(&[0x01, 0x02, 0x03]).unwrap(), None);
        assert!(!parser.has_open_frame());
    }

    #[test]
    fn test_short_status_frame_is_dropped() {
        let mut parser = DataParser::new();
        let frame = status_frame();
        let response = feed(&mut parser, &[&frame[..20], &[FRAME_END]]);
        assert_eq!(response, None);
        assert!(!parser.has_open_frame());
    }

    #[test]
    fn test_invalid_production_date() {
        assert_eq!(decode_production_date(0), None);
        assert_eq!(
            decode_production_date((24 << 9) | (2 << 5) | 29),
            NaiveDate::from_ymd_opt(2024, 2, 29)
        );
    }
}
