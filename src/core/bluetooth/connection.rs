//! Active BMS session
//! This module tracks the link and the GATT handles of the peer being handled.

use log::{debug, info};
use uuid::Uuid;

use crate::core::bluetooth::constants::{
    UUID_BMS_NOTIFY_CHAR, UUID_BMS_SERVICE, UUID_BMS_WRITE_CHAR, UUID_CCCD,
};
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::types::{AttrHandle, ConnHandle, DeviceAddress, HandleRange};

/// The one peer the state machine is currently working with
#[derive(Debug, Clone)]
pub struct ActiveConnection {
    /// Handles discovered so far
    pub device: BluetoothDevice,
    /// Set once the radio reports the link as up
    conn_handle: Option<ConnHandle>,
    /// Handle range of the BMS service, once found
    services_range: Option<HandleRange>,
}

impl ActiveConnection {
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            device: BluetoothDevice::new(address),
            conn_handle: None,
            services_range: None,
        }
    }

    pub fn address(&self) -> DeviceAddress {
        self.device.address
    }

    pub fn conn_handle(&self) -> Option<ConnHandle> {
        self.conn_handle
    }

    pub fn set_conn_handle(&mut self, conn_handle: ConnHandle) {
        self.conn_handle = Some(conn_handle);
    }

    pub fn services_range(&self) -> Option<HandleRange> {
        self.services_range
    }

    /// Returns true if an event for `conn_handle` belongs to this session
    pub fn owns(&self, conn_handle: ConnHandle) -> bool {
        self.conn_handle == Some(conn_handle)
    }

    /// Returns true if a link event for this handle and address concerns this session.
    ///
    /// Before the link is up only the address can be compared.
    pub fn matches_link(&self, conn_handle: ConnHandle, address: DeviceAddress) -> bool {
        match self.conn_handle {
            Some(own) => own == conn_handle,
            None => self.address() == address,
        }
    }

    /// Records a discovered service; returns the range to search when it is the BMS service
    pub fn record_service(&mut self, range: HandleRange, uuid: Uuid) -> Option<HandleRange> {
        debug!("Service {} at {}", uuid, range);
        if uuid != UUID_BMS_SERVICE {
            return None;
        }

        info!("Found BMS service at {}", range);
        self.services_range = Some(range);
        Some(range)
    }

    /// Assigns a discovered characteristic to the matching device handle
    pub fn record_characteristic(&mut self, value_handle: AttrHandle, uuid: Uuid) {
        debug!("Characteristic {} value handle 0x{:04X}", uuid, value_handle);
        if uuid == UUID_BMS_NOTIFY_CHAR {
            self.device.set_notify_handle(value_handle);
        } else if uuid == UUID_BMS_WRITE_CHAR {
            self.device.set_write_handle(value_handle);
        } else if uuid == UUID_CCCD {
            self.device.set_cccd_handle(value_handle);
        }
    }

    /// Picks up a standalone CCCD
    pub fn record_descriptor(&mut self, handle: AttrHandle, uuid: Uuid) {
        debug!("Descriptor {} handle 0x{:04X}", uuid, handle);
        if uuid == UUID_CCCD {
            self.device.set_cccd_handle(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::constants::UUID_GENERIC_ACCESS_SERVICE;

    const ADDRESS: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]);

    #[test]
    fn test_only_bms_service_range_is_kept() {
        let mut connection = ActiveConnection::new(ADDRESS);

        let other = connection.record_service(HandleRange::new(1, 5), UUID_GENERIC_ACCESS_SERVICE);
        assert_eq!(other, None);
        assert_eq!(connection.services_range(), None);

        let range = HandleRange::new(0x10, 0x1F);
        assert_eq!(connection.record_service(range, UUID_BMS_SERVICE), Some(range));
        assert_eq!(connection.services_range(), Some(range));
    }

    #[test]
    fn test_characteristics_fill_handles() {
        let mut connection = ActiveConnection::new(ADDRESS);
        connection.record_characteristic(0x12, UUID_BMS_NOTIFY_CHAR);
        connection.record_characteristic(0x15, UUID_BMS_WRITE_CHAR);
        connection.record_characteristic(0x18, Uuid::from_u128(0x1234));
        assert_eq!(connection.device.notify_handle, Some(0x12));
        assert_eq!(connection.device.write_handle, Some(0x15));
        assert_eq!(connection.device.cccd_handle, None);

        connection.record_descriptor(0x16, UUID_BMS_WRITE_CHAR);
        assert_eq!(connection.device.cccd_handle, None);
        connection.record_descriptor(0x13, UUID_CCCD);
        assert_eq!(connection.device.cccd_handle, Some(0x13));
    }

    #[test]
    fn test_link_matching() {
        let other = DeviceAddress::new([0; 6]);
        let mut connection = ActiveConnection::new(ADDRESS);
        assert!(connection.matches_link(7, ADDRESS));
        assert!(!connection.matches_link(7, other));

        connection.set_conn_handle(3);
        assert!(connection.owns(3));
        assert!(connection.matches_link(3, ADDRESS));
        assert!(!connection.matches_link(7, ADDRESS));
    }
}
