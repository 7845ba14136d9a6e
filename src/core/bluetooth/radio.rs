//! Radio adapter abstraction
//!
//! The platform BLE stack is driven through [`RadioAdapter`]. Every command
//! returns as soon as it has been handed to the radio; the outcome arrives
//! later as a [`RadioEvent`] on the channel created by [`event_channel`].

use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::core::bluetooth::types::{AttrHandle, ConnHandle, DeviceAddress, HandleRange};
use crate::error::RadioError;

/// Sending half of the radio event channel, held by the adapter
pub type EventSender = mpsc::UnboundedSender<RadioEvent>;

/// Receiving half of the radio event channel, held by the state machine
pub type EventReceiver = mpsc::UnboundedReceiver<RadioEvent>;

/// Creates the channel a radio adapter reports its events on.
pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// Parameters of one scan window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanParams {
    /// How long the scan runs before the scan-done event
    pub duration: Duration,
    /// Radio scan interval
    pub interval: Duration,
    /// Radio scan window within each interval
    pub window: Duration,
    /// Request scan responses from advertisers
    pub active: bool,
}

/// Asynchronous event delivered by the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioEvent {
    /// An advertiser was seen during a scan
    ScanResult {
        address: DeviceAddress,
        rssi: Option<i16>,
    },
    /// The scan window expired
    ScanDone,
    /// A link to the peer is up
    PeripheralConnected {
        conn_handle: ConnHandle,
        address: DeviceAddress,
    },
    /// A link went down, or a connect attempt failed
    PeripheralDisconnected {
        conn_handle: ConnHandle,
        address: DeviceAddress,
    },
    /// A primary service was found
    ServiceResult {
        conn_handle: ConnHandle,
        range: HandleRange,
        uuid: Uuid,
    },
    /// Service discovery finished.
    ///
    /// Sent after the characteristic results of the BMS service when its
    /// characteristics were requested before discovery ended.
    ServiceDone { conn_handle: ConnHandle },
    /// A characteristic was found
    CharacteristicResult {
        conn_handle: ConnHandle,
        value_handle: AttrHandle,
        uuid: Uuid,
    },
    /// Characteristic discovery finished; informational, radios may omit it
    CharacteristicDone { conn_handle: ConnHandle },
    /// A descriptor was found
    DescriptorResult {
        conn_handle: ConnHandle,
        handle: AttrHandle,
        uuid: Uuid,
    },
    /// Descriptor discovery finished
    DescriptorDone { conn_handle: ConnHandle },
    /// A write was handed to the peer
    WriteDone {
        conn_handle: ConnHandle,
        handle: AttrHandle,
    },
    /// The peer pushed a notification
    Notify {
        conn_handle: ConnHandle,
        value_handle: AttrHandle,
        data: Vec<u8>,
    },
}

/// Commands the state machine issues to the platform BLE stack.
///
/// Implementations use interior mutability: the state machine only commands
/// the radio, it never reshapes it.
pub trait RadioAdapter {
    /// Powers the radio up or down
    fn set_active(&self, active: bool) -> Result<(), RadioError>;

    /// Starts a scan; ends with [`RadioEvent::ScanDone`]
    fn scan(&self, params: ScanParams) -> Result<(), RadioError>;

    /// Starts connecting; ends with a connected or disconnected event
    fn connect(&self, address: DeviceAddress) -> Result<(), RadioError>;

    /// Tears the link down
    fn disconnect(&self, conn_handle: ConnHandle) -> Result<(), RadioError>;

    /// Starts primary service discovery
    fn discover_services(&self, conn_handle: ConnHandle) -> Result<(), RadioError>;

    /// Starts characteristic discovery within a service range
    fn discover_characteristics(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError>;

    /// Starts descriptor discovery within a service range
    fn discover_descriptors(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError>;

    /// Writes without response
    fn write(
        &self,
        conn_handle: ConnHandle,
        handle: AttrHandle,
        data: &[u8],
    ) -> Result<(), RadioError>;
}
