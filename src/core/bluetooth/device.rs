//! Bluetooth device representation and related functionality

use crate::core::bluetooth::types::{AttrHandle, DeviceAddress};
use crate::error::MissingHandle;

/// GATT handles discovered for the peer currently being handled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BluetoothDevice {
    /// The address of the peer
    pub address: DeviceAddress,
    /// Value handle of the write characteristic
    pub write_handle: Option<AttrHandle>,
    /// Value handle of the notify characteristic
    pub notify_handle: Option<AttrHandle>,
    /// Handle of the client characteristic configuration descriptor
    pub cccd_handle: Option<AttrHandle>,
}

impl BluetoothDevice {
    /// Creates a new BluetoothDevice with no handles resolved
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            write_handle: None,
            notify_handle: None,
            cccd_handle: None,
        }
    }

    pub fn set_write_handle(&mut self, handle: AttrHandle) {
        self.write_handle = Some(handle);
    }

    pub fn set_notify_handle(&mut self, handle: AttrHandle) {
        self.notify_handle = Some(handle);
    }

    pub fn set_cccd_handle(&mut self, handle: AttrHandle) {
        self.cccd_handle = Some(handle);
    }

    /// Handles still unresolved, in notify, write, CCCD order
    pub fn missing_handles(&self) -> Vec<MissingHandle> {
        let mut missing = Vec::new();
        if self.notify_handle.is_none() {
            missing.push(MissingHandle::Notify);
        }
        if self.write_handle.is_none() {
            missing.push(MissingHandle::Write);
        }
        if self.cccd_handle.is_none() {
            missing.push(MissingHandle::Cccd);
        }
        missing
    }

    /// Returns true once notify, write and CCCD handles are all known
    pub fn is_usable(&self) -> bool {
        self.missing_handles().is_empty()
    }

    /// Forgets every discovered handle
    pub fn disconnect(&mut self) {
        self.write_handle = None;
        self.notify_handle = None;
        self.cccd_handle = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device() -> BluetoothDevice {
        BluetoothDevice::new(DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]))
    }

    #[test]
    fn test_new_device_misses_every_handle() {
        let device = device();
        assert!(!device.is_usable());
        assert_eq!(
            device.missing_handles(),
            vec![MissingHandle::Notify, MissingHandle::Write, MissingHandle::Cccd]
        );
    }

    #[test]
    fn test_disconnect_clears_handles() {
        let mut device = device();
        device.set_notify_handle(0x12);
        device.set_write_handle(0x15);
        device.set_cccd_handle(0x13);
        assert!(device.is_usable());

        device.disconnect();
        assert_eq!(device, BluetoothDevice::new(device.address));
    }
}
