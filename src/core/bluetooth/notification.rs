//! Notification handling for the BMS
//! This module feeds notification payloads to the decoder and keeps the
//! latest reports per peer until they are delivered.

use std::collections::HashMap;

use log::{debug, info};

use crate::core::battery::{BmsResponse, CellVoltageReport, DataParser, DeviceStatusReport};
use crate::core::bluetooth::types::DeviceAddress;
use crate::delivery::BatteryReading;
use crate::error::ProtocolViolation;

/// Notification handler for BMS responses
#[derive(Debug, Default)]
pub struct NotificationHandler {
    /// Frame reassembly and decoding
    data_parser: DataParser,
    /// Latest cell voltages per peer
    cell_voltages: HashMap<DeviceAddress, CellVoltageReport>,
    /// Latest status report per peer
    device_data: HashMap<DeviceAddress, DeviceStatusReport>,
}

impl NotificationHandler {
    /// Create a new NotificationHandler
    pub fn new() -> Self {
        Self::default()
    }

    /// Processes one notification payload from `address`.
    ///
    /// Returns the status report when the payload completed one.
    pub fn handle_notification(
        &mut self,
        address: DeviceAddress,
        data: &[u8],
    ) -> Result<Option<DeviceStatusReport>, ProtocolViolation> {
        debug!("Notification from {}: {}", address, hex::encode(data));

        match self.data_parser.parse_response(data)? {
            Some(BmsResponse::CellVoltages(report)) => {
                info!("Cell voltages for {}: {:?}", address, report.voltages);
                self.cell_voltages.insert(address, report);
                Ok(None)
            }
            Some(BmsResponse::Status(report)) => {
                info!("Status for {}: {:?}", address, report);
                self.device_data.insert(address, report.clone());
                Ok(Some(report))
            }
            None => Ok(None),
        }
    }

    pub fn cell_voltages(&self, address: &DeviceAddress) -> Option<&CellVoltageReport> {
        self.cell_voltages.get(address)
    }

    pub fn device_data(&self, address: &DeviceAddress) -> Option<&DeviceStatusReport> {
        self.device_data.get(address)
    }

    /// Builds the reading for `address`, if a status report is stored
    pub fn reading(&self, address: &DeviceAddress) -> Option<BatteryReading> {
        let status = self.device_data.get(address)?;
        Some(BatteryReading::new(
            *address,
            status.clone(),
            self.cell_voltages.get(address),
        ))
    }

    /// Drops the stored reports for `address`
    pub fn clear_reading(&mut self, address: &DeviceAddress) {
        self.device_data.remove(address);
        self.cell_voltages.remove(address);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDRESS: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]);

    fn status_chunks() -> Vec<Vec<u8>> {
        let frame =
            hex::decode("dd03001b0a28fffe27102ee000052a8f00000000000010530308020bbd0bb7fc4e")
                .unwrap();
        vec![frame[..20].to_vec(), frame[20..].to_vec(), vec![0x77]]
    }

    #[test]
    fn test_reports_are_kept_per_address() {
        let mut handler = NotificationHandler::new();

        let cells = hex::decode("dd0400040ce40ce377").unwrap();
        assert_eq!(handler.handle_notification(ADDRESS, &cells).unwrap(), None);
        assert_eq!(handler.cell_voltages(&ADDRESS).unwrap().voltages, vec![3300, 3299]);
        assert!(handler.reading(&ADDRESS).is_none());

        let mut report = None;
        for chunk in status_chunks() {
            report = handler.handle_notification(ADDRESS, &chunk).unwrap();
        }
        let report = report.expect("status report");
        assert_eq!(handler.device_data(&ADDRESS), Some(&report));

        let reading = handler.reading(&ADDRESS).unwrap();
        assert_eq!(reading.cell_voltages, Some(vec![3300, 3299]));
        assert_eq!(reading.status, report);

        handler.clear_reading(&ADDRESS);
        assert!(handler.reading(&ADDRESS).is_none());
        assert!(handler.cell_voltages(&ADDRESS).is_none());
    }

    #[test]
    fn test_stray_terminator_is_reported() {
        let mut handler = NotificationHandler::new();
        assert_eq!(
            handler.handle_notification(ADDRESS, &[0x77]),
            Err(ProtocolViolation::UnexpectedTerminator)
        );
    }
}
