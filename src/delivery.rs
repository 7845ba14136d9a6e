//! Hand-off of decoded readings to the backend
//!
//! The transport itself lives outside this crate; it plugs in through
//! [`ReadingSink`].

use anyhow::Result;
use async_trait::async_trait;
use log::info;
use serde::Serialize;

use crate::core::battery::{CellVoltageReport, DeviceStatusReport};
use crate::core::bluetooth::types::DeviceAddress;

/// Payload delivered for one peer after a successful exchange
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatteryReading {
    #[serde(flatten)]
    pub status: DeviceStatusReport,
    /// Cell voltages in mV, when the cell frame arrived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_voltages: Option<Vec<u16>>,
    pub address: DeviceAddress,
}

impl BatteryReading {
    pub fn new(
        address: DeviceAddress,
        status: DeviceStatusReport,
        cells: Option<&CellVoltageReport>,
    ) -> Self {
        Self {
            status,
            cell_voltages: cells.map(|report| report.voltages.clone()),
            address,
        }
    }
}

/// Receives readings once the peer has been disconnected
#[async_trait]
pub trait ReadingSink: Send + Sync {
    /// Returns false while the backend cannot be reached
    fn is_online(&self) -> bool {
        true
    }

    /// Deliver one reading
    async fn deliver(&self, reading: &BatteryReading) -> Result<()>;
}

/// Sink that writes readings to the log as JSON
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl ReadingSink for LogSink {
    async fn deliver(&self, reading: &BatteryReading) -> Result<()> {
        let json = serde_json::to_string(reading)?;
        info!("Battery reading for {}: {}", reading.address, json);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn status() -> DeviceStatusReport {
        DeviceStatusReport {
            voltage: 2600,
            current: -2,
            ahrem: 10000,
            ahmax: 12000,
            cycles: 5,
            production_date: chrono::NaiveDate::from_ymd_opt(2021, 4, 15),
            protection_status: 0,
            version: 0x10,
            soc: 83,
            fet: 3,
            cells: 8,
            temperature_sensors: 2,
            temperature: 27.4,
            watts: -0.52,
        }
    }

    #[test]
    fn test_reading_payload_shape() {
        let address: DeviceAddress = "A5:C2:37:2D:D9:E4".parse().unwrap();
        let cells = CellVoltageReport {
            cell_count: 2,
            voltages: vec![3301, 3299],
        };
        let reading = BatteryReading::new(address, status(), Some(&cells));

        let json = serde_json::to_value(&reading).unwrap();
        assert_eq!(json["address"], "A5:C2:37:2D:D9:E4");
        assert_eq!(json["voltage"], 2600);
        assert_eq!(json["current"], -2);
        assert_eq!(json["soc"], 83);
        assert_eq!(json["production_date"], "2021-04-15");
        assert_eq!(json["cell_voltages"], serde_json::json!([3301, 3299]));
    }

    #[test]
    fn test_reading_without_cells_omits_field() {
        let address = DeviceAddress::new([1, 2, 3, 4, 5, 6]);
        let reading = BatteryReading::new(address, status(), None);
        let json = serde_json::to_value(&reading).unwrap();
        assert!(json.get("cell_voltages").is_none());
    }

    #[tokio::test]
    async fn test_log_sink_accepts_reading() {
        let reading = BatteryReading::new(DeviceAddress::new([0; 6]), status(), None);
        assert!(LogSink.is_online());
        LogSink.deliver(&reading).await.unwrap();
    }
}
