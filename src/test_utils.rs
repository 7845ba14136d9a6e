//! Test utilities for the BMS bridge
//!
//! [`MockRadio`] stands in for the platform BLE stack. It records every
//! command and can simulate BMS peers that answer scans, connects, discovery
//! and the two request frames the way the real hardware does, including
//! fragmented status notifications.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Result, anyhow};
use async_trait::async_trait;

use crate::core::bluetooth::commands::{BmsCommand, cccd_value};
use crate::core::bluetooth::constants::{
    FRAME_END, UUID_BMS_NOTIFY_CHAR, UUID_BMS_SERVICE, UUID_BMS_WRITE_CHAR, UUID_CCCD,
    UUID_GENERIC_ACCESS_SERVICE, UUID_USER_DESCRIPTION,
};
use crate::core::bluetooth::radio::{EventSender, RadioAdapter, RadioEvent, ScanParams};
use crate::core::bluetooth::types::{AttrHandle, ConnHandle, DeviceAddress, HandleRange};
use crate::delivery::{BatteryReading, ReadingSink};
use crate::error::RadioError;

/// Status response of a real BMS, without the trailing terminator.
///
/// 26.00 V, -0.02 A, 100.00/120.00 Ah, 5 cycles, made 2021-04-15, 83 %,
/// 8 cells, 2 probes at 27.4 °C and 27.8 °C.
pub const STATUS_FRAME_HEX: &str =
    "dd03001b0a28fffe27102ee000052a8f00000000000010530308020bbd0bb7fc4e";

/// Cell voltage response of a real BMS: two cells at 3300 mV and 3299 mV
pub const CELL_FRAME_HEX: &str = "dd0400040ce40ce3fe1d77";

/// Range of the generic access service every peer exposes
pub const GENERIC_ACCESS_RANGE: HandleRange = HandleRange::new(0x0001, 0x0005);
/// Range of the BMS service on simulated peers
pub const BMS_SERVICE_RANGE: HandleRange = HandleRange::new(0x0010, 0x001F);
pub const NOTIFY_HANDLE: AttrHandle = 0x0012;
pub const CCCD_HANDLE: AttrHandle = 0x0013;
pub const WRITE_HANDLE: AttrHandle = 0x0015;
pub const USER_DESCRIPTION_HANDLE: AttrHandle = 0x0016;

/// Where a simulated peer exposes its CCCD
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CccdLayout {
    /// Reported during characteristic discovery
    Nested,
    /// Only found by descriptor discovery
    Standalone,
    /// Not exposed at all
    Missing,
}

/// A simulated BMS peer
#[derive(Debug, Clone)]
pub struct SimulatedBms {
    pub address: DeviceAddress,
    pub rssi: i16,
    /// Accepts connections
    pub responds: bool,
    /// Exposes the vendor service
    pub has_service: bool,
    /// Exposes the write characteristic
    pub has_write: bool,
    pub cccd: CccdLayout,
    /// Status response without the terminator
    pub status_frame: Vec<u8>,
    pub cell_frame: Vec<u8>,
    /// Notification payload size for the status response
    pub chunk_size: usize,
    /// Answers the status request
    pub answers_status: bool,
    /// Reports the end of characteristic discovery
    pub reports_characteristic_done: bool,
}

impl SimulatedBms {
    /// A well-behaved peer with a nested CCCD
    pub fn new(address: DeviceAddress) -> Self {
        Self {
            address,
            rssi: -67,
            responds: true,
            has_service: true,
            has_write: true,
            cccd: CccdLayout::Nested,
            status_frame: status_frame(),
            cell_frame: cell_frame(),
            chunk_size: 20,
            answers_status: true,
            reports_characteristic_done: true,
        }
    }

    pub fn with_cccd(mut self, cccd: CccdLayout) -> Self {
        self.cccd = cccd;
        self
    }

    pub fn without_write(mut self) -> Self {
        self.has_write = false;
        self
    }

    pub fn without_service(mut self) -> Self {
        self.has_service = false;
        self
    }

    pub fn unresponsive(mut self) -> Self {
        self.responds = false;
        self
    }

    /// Answers cell voltage requests only
    pub fn silent_on_status(mut self) -> Self {
        self.answers_status = false;
        self
    }

    /// Ends characteristic discovery without a characteristic-done event
    pub fn without_characteristic_done(mut self) -> Self {
        self.reports_characteristic_done = false;
        self
    }

    pub fn with_status_frame(mut self, status_frame: Vec<u8>) -> Self {
        self.status_frame = status_frame;
        self
    }

    /// Status response as the peer sends it: MTU-sized chunks, then the terminator
    pub fn status_notifications(&self) -> Vec<Vec<u8>> {
        let mut chunks: Vec<Vec<u8>> = self
            .status_frame
            .chunks(self.chunk_size.max(1))
            .map(<[u8]>::to_vec)
            .collect();
        chunks.push(vec![FRAME_END]);
        chunks
    }
}

/// Decoded [`STATUS_FRAME_HEX`]
pub fn status_frame() -> Vec<u8> {
    decode_hex(STATUS_FRAME_HEX)
}

/// Decoded [`CELL_FRAME_HEX`]
pub fn cell_frame() -> Vec<u8> {
    decode_hex(CELL_FRAME_HEX)
}

fn decode_hex(data: &str) -> Vec<u8> {
    hex::decode(data).unwrap_or_default()
}

/// A command the state machine issued to the radio
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RadioCommand {
    SetActive(bool),
    Scan(ScanParams),
    Connect(DeviceAddress),
    Disconnect(ConnHandle),
    DiscoverServices(ConnHandle),
    DiscoverCharacteristics(ConnHandle, HandleRange),
    DiscoverDescriptors(ConnHandle, HandleRange),
    Write {
        conn_handle: ConnHandle,
        handle: AttrHandle,
        data: Vec<u8>,
    },
}

impl RadioCommand {
    /// Returns true for commands that touch a connected peer
    pub fn is_session_command(&self) -> bool {
        matches!(
            self,
            RadioCommand::DiscoverServices(_)
                | RadioCommand::DiscoverCharacteristics(..)
                | RadioCommand::DiscoverDescriptors(..)
                | RadioCommand::Write { .. }
        )
    }
}

#[derive(Debug)]
struct MockRadioState {
    events: EventSender,
    active: bool,
    peers: Vec<SimulatedBms>,
    commands: Vec<RadioCommand>,
    links: HashMap<ConnHandle, DeviceAddress>,
    next_conn_handle: ConnHandle,
    notifying: HashSet<ConnHandle>,
    pending_service_done: HashSet<ConnHandle>,
    scan_error: Option<RadioError>,
    connect_error: Option<RadioError>,
    disconnect_error: Option<RadioError>,
}

impl MockRadioState {
    fn emit(&self, event: RadioEvent) {
        // a closed channel only means the manager is gone
        let _ = self.events.send(event);
    }

    fn peer(&self, conn_handle: ConnHandle) -> Result<SimulatedBms, RadioError> {
        let address = self
            .links
            .get(&conn_handle)
            .ok_or(RadioError::AlreadyDisconnected)?;
        self.peers
            .iter()
            .find(|peer| peer.address == *address)
            .cloned()
            .ok_or(RadioError::UnknownPeer(*address))
    }
}

/// Mock radio for testing the state machine without hardware.
///
/// Clones share their state, so a test can keep one to inspect what the
/// manager did with the other.
#[derive(Debug, Clone)]
pub struct MockRadio {
    state: Arc<Mutex<MockRadioState>>,
}

impl MockRadio {
    pub fn new(events: EventSender) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockRadioState {
                events,
                active: false,
                peers: Vec::new(),
                commands: Vec::new(),
                links: HashMap::new(),
                next_conn_handle: 1,
                notifying: HashSet::new(),
                pending_service_done: HashSet::new(),
                scan_error: None,
                connect_error: None,
                disconnect_error: None,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockRadioState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_peer(&self, peer: SimulatedBms) {
        self.lock().peers.push(peer);
    }

    pub fn is_active(&self) -> bool {
        self.lock().active
    }

    /// Every command issued so far, in order
    pub fn commands(&self) -> Vec<RadioCommand> {
        self.lock().commands.clone()
    }

    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Number of links currently up
    pub fn link_count(&self) -> usize {
        self.lock().links.len()
    }

    /// Connection handle of the link to `address`, if up
    pub fn link_to(&self, address: DeviceAddress) -> Option<ConnHandle> {
        self.lock()
            .links
            .iter()
            .find(|(_, linked)| **linked == address)
            .map(|(conn_handle, _)| *conn_handle)
    }

    /// Makes the next scan commands fail with `error`
    pub fn set_scan_error(&self, error: Option<RadioError>) {
        self.lock().scan_error = error;
    }

    /// Makes the next connect commands fail with `error`
    pub fn set_connect_error(&self, error: Option<RadioError>) {
        self.lock().connect_error = error;
    }

    /// Makes the next disconnect commands fail with `error`
    pub fn set_disconnect_error(&self, error: Option<RadioError>) {
        self.lock().disconnect_error = error;
    }

    /// Simulates the peer dropping the link
    pub fn drop_link(&self, address: DeviceAddress) {
        let mut state = self.lock();
        let conn_handle = state
            .links
            .iter()
            .find(|(_, linked)| **linked == address)
            .map(|(conn_handle, _)| *conn_handle);
        if let Some(conn_handle) = conn_handle {
            state.links.remove(&conn_handle);
            state.notifying.remove(&conn_handle);
            state.emit(RadioEvent::PeripheralDisconnected {
                conn_handle,
                address,
            });
        }
    }

    /// Injects a raw event
    pub fn emit(&self, event: RadioEvent) {
        self.lock().emit(event);
    }
}

impl RadioAdapter for MockRadio {
    fn set_active(&self, active: bool) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::SetActive(active));
        state.active = active;
        Ok(())
    }

    fn scan(&self, params: ScanParams) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::Scan(params));
        if !state.active {
            return Err(RadioError::NotActive);
        }
        if let Some(error) = state.scan_error.clone() {
            return Err(error);
        }

        for peer in &state.peers {
            state.emit(RadioEvent::ScanResult {
                address: peer.address,
                rssi: Some(peer.rssi),
            });
        }
        state.emit(RadioEvent::ScanDone);
        Ok(())
    }

    fn connect(&self, address: DeviceAddress) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::Connect(address));
        if !state.active {
            return Err(RadioError::NotActive);
        }
        if let Some(error) = state.connect_error.clone() {
            return Err(error);
        }

        let responds = state
            .peers
            .iter()
            .any(|peer| peer.address == address && peer.responds);
        if responds {
            let conn_handle = state.next_conn_handle;
            state.next_conn_handle += 1;
            state.links.insert(conn_handle, address);
            state.emit(RadioEvent::PeripheralConnected {
                conn_handle,
                address,
            });
        }
        Ok(())
    }

    fn disconnect(&self, conn_handle: ConnHandle) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::Disconnect(conn_handle));
        if let Some(error) = state.disconnect_error.clone() {
            return Err(error);
        }

        let address = state
            .links
            .remove(&conn_handle)
            .ok_or(RadioError::AlreadyDisconnected)?;
        state.notifying.remove(&conn_handle);
        state.pending_service_done.remove(&conn_handle);
        state.emit(RadioEvent::PeripheralDisconnected {
            conn_handle,
            address,
        });
        Ok(())
    }

    fn discover_services(&self, conn_handle: ConnHandle) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::DiscoverServices(conn_handle));
        let peer = state.peer(conn_handle)?;

        state.emit(RadioEvent::ServiceResult {
            conn_handle,
            range: GENERIC_ACCESS_RANGE,
            uuid: UUID_GENERIC_ACCESS_SERVICE,
        });
        if peer.has_service {
            state.emit(RadioEvent::ServiceResult {
                conn_handle,
                range: BMS_SERVICE_RANGE,
                uuid: UUID_BMS_SERVICE,
            });
            // completes once the characteristics of the BMS service are in
            state.pending_service_done.insert(conn_handle);
        } else {
            state.emit(RadioEvent::ServiceDone { conn_handle });
        }
        Ok(())
    }

    fn discover_characteristics(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        state
            .commands
            .push(RadioCommand::DiscoverCharacteristics(conn_handle, range));
        let peer = state.peer(conn_handle)?;

        let mut found = vec![(NOTIFY_HANDLE, UUID_BMS_NOTIFY_CHAR)];
        if peer.cccd == CccdLayout::Nested {
            found.push((CCCD_HANDLE, UUID_CCCD));
        }
        if peer.has_write {
            found.push((WRITE_HANDLE, UUID_BMS_WRITE_CHAR));
        }
        for (value_handle, uuid) in found {
            if range.contains(value_handle) {
                state.emit(RadioEvent::CharacteristicResult {
                    conn_handle,
                    value_handle,
                    uuid,
                });
            }
        }
        if peer.reports_characteristic_done {
            state.emit(RadioEvent::CharacteristicDone { conn_handle });
        }

        if state.pending_service_done.remove(&conn_handle) {
            state.emit(RadioEvent::ServiceDone { conn_handle });
        }
        Ok(())
    }

    fn discover_descriptors(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        state
            .commands
            .push(RadioCommand::DiscoverDescriptors(conn_handle, range));
        let peer = state.peer(conn_handle)?;

        if peer.cccd == CccdLayout::Standalone && range.contains(CCCD_HANDLE) {
            state.emit(RadioEvent::DescriptorResult {
                conn_handle,
                handle: CCCD_HANDLE,
                uuid: UUID_CCCD,
            });
        }
        if range.contains(USER_DESCRIPTION_HANDLE) {
            state.emit(RadioEvent::DescriptorResult {
                conn_handle,
                handle: USER_DESCRIPTION_HANDLE,
                uuid: UUID_USER_DESCRIPTION,
            });
        }
        state.emit(RadioEvent::DescriptorDone { conn_handle });
        Ok(())
    }

    fn write(
        &self,
        conn_handle: ConnHandle,
        handle: AttrHandle,
        data: &[u8],
    ) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.commands.push(RadioCommand::Write {
            conn_handle,
            handle,
            data: data.to_vec(),
        });
        let peer = state.peer(conn_handle)?;

        match handle {
            CCCD_HANDLE if peer.cccd != CccdLayout::Missing => {
                if data == cccd_value(true) {
                    state.notifying.insert(conn_handle);
                } else {
                    state.notifying.remove(&conn_handle);
                }
                state.emit(RadioEvent::WriteDone {
                    conn_handle,
                    handle,
                });
            }
            WRITE_HANDLE if peer.has_write => {
                state.emit(RadioEvent::WriteDone {
                    conn_handle,
                    handle,
                });
                if !state.notifying.contains(&conn_handle) {
                    return Ok(());
                }

                let replies = if data == BmsCommand::CellVoltages.to_bytes() {
                    vec![peer.cell_frame.clone()]
                } else if data == BmsCommand::BasicInfo.to_bytes() && peer.answers_status {
                    peer.status_notifications()
                } else {
                    Vec::new()
                };
                for data in replies {
                    state.emit(RadioEvent::Notify {
                        conn_handle,
                        value_handle: NOTIFY_HANDLE,
                        data,
                    });
                }
            }
            other => return Err(RadioError::UnknownHandle(other)),
        }
        Ok(())
    }
}

/// Sink that keeps every delivered reading
#[derive(Debug, Clone)]
pub struct RecordingSink {
    readings: Arc<Mutex<Vec<BatteryReading>>>,
    online: bool,
    fail: bool,
}

impl Default for RecordingSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordingSink {
    pub fn new() -> Self {
        Self {
            readings: Arc::new(Mutex::new(Vec::new())),
            online: true,
            fail: false,
        }
    }

    /// A sink whose backend cannot be reached
    pub fn offline() -> Self {
        Self {
            online: false,
            ..Self::new()
        }
    }

    /// A sink that rejects every reading
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    pub fn readings(&self) -> Vec<BatteryReading> {
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl ReadingSink for RecordingSink {
    fn is_online(&self) -> bool {
        self.online
    }

    async fn deliver(&self, reading: &BatteryReading) -> Result<()> {
        if self.fail {
            return Err(anyhow!("backend returned 503"));
        }
        self.readings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(reading.clone());
        Ok(())
    }
}
