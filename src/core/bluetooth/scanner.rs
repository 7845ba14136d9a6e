use log::{debug, info};

use crate::core::bluetooth::types::DeviceAddress;

/// Addresses of interest seen during the most recent scan window
#[derive(Debug, Default)]
pub struct BluetoothScanner {
    only_devices: Vec<DeviceAddress>,
    devices: Vec<DeviceAddress>,
}

impl BluetoothScanner {
    pub fn new(only_devices: Vec<DeviceAddress>) -> Self {
        Self {
            only_devices,
            devices: Vec::new(),
        }
    }

    /// Replaces the allow-list; already found devices are kept
    pub fn set_only_devices(&mut self, only_devices: Vec<DeviceAddress>) {
        self.only_devices = only_devices;
    }

    pub fn only_devices(&self) -> &[DeviceAddress] {
        &self.only_devices
    }

    /// Forgets every device found so far
    pub fn clear(&mut self) {
        self.devices.clear();
    }

    /// Records a scan result, returns true if the device is newly found
    pub fn handle_scan_result(&mut self, address: DeviceAddress, rssi: Option<i16>) -> bool {
        if !self.only_devices.contains(&address) {
            debug!("Ignoring device {} (RSSI: {:?})", address, rssi);
            return false;
        }

        if self.devices.contains(&address) {
            return false;
        }

        self.devices.push(address);
        info!("Found device: {} RSSI: {:?}", address, rssi);
        true
    }

    /// Devices found during the current scan, in discovery order
    pub fn devices(&self) -> &[DeviceAddress] {
        &self.devices
    }

    pub fn contains(&self, address: &DeviceAddress) -> bool {
        self.devices.contains(address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WANTED: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]);
    const OTHER: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xC6, 0x6A]);

    #[test]
    fn test_only_allow_listed_devices_are_recorded() {
        let mut scanner = BluetoothScanner::new(vec![WANTED]);

        assert!(!scanner.handle_scan_result(OTHER, Some(-60)));
        assert!(scanner.handle_scan_result(WANTED, Some(-70)));
        assert!(!scanner.handle_scan_result(WANTED, Some(-71)));

        assert_eq!(scanner.devices(), &[WANTED]);
        assert!(!scanner.contains(&OTHER));
    }

    #[test]
    fn test_empty_allow_list_admits_nothing() {
        let mut scanner = BluetoothScanner::new(Vec::new());
        assert!(!scanner.handle_scan_result(WANTED, None));
        assert!(scanner.devices().is_empty());
    }

    #[test]
    fn test_clear_forgets_found_devices() {
        let mut scanner = BluetoothScanner::new(vec![WANTED, OTHER]);
        scanner.handle_scan_result(WANTED, None);
        scanner.clear();
        assert!(scanner.devices().is_empty());
        assert_eq!(scanner.only_devices(), &[WANTED, OTHER]);
    }
}
