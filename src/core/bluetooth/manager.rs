//! Bluetooth manager for the BMS bridge
//! This module drives one BMS peer at a time through connect, discovery and
//! data exchange, and keeps the session state the caller polls.

use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::time::sleep;

use crate::config::bluetooth_config::{BluetoothConfig, SessionTimings};
use crate::core::battery::{CellVoltageReport, DeviceStatusReport};
use crate::core::bluetooth::commands::{BmsCommand, cccd_value};
use crate::core::bluetooth::connection::ActiveConnection;
use crate::core::bluetooth::device::BluetoothDevice;
use crate::core::bluetooth::notification::NotificationHandler;
use crate::core::bluetooth::radio::{EventReceiver, RadioAdapter, RadioEvent, ScanParams};
use crate::core::bluetooth::scanner::BluetoothScanner;
use crate::core::bluetooth::types::{AttrHandle, ConnHandle, ConnectionState, DeviceAddress, HandleRange};
use crate::delivery::ReadingSink;
use crate::error::{BmsError, MissingHandle, ProtocolViolation, RadioError, Result};
use crate::utils::wait_for;

/// Session state machine for BMS peers
pub struct BluetoothManager<R: RadioAdapter> {
    /// Platform BLE stack
    radio: R,
    /// Events reported by the radio
    events: EventReceiver,
    state: ConnectionState,
    is_started: bool,
    /// Devices of interest seen by the last scan
    scanner: BluetoothScanner,
    /// The single peer being handled
    connection: Option<ActiveConnection>,
    /// Decoder and per-peer reports
    notification_handler: NotificationHandler,
    timings: SessionTimings,
    scan_params: ScanParams,
    wait_timeout: Duration,
}

impl<R: RadioAdapter> BluetoothManager<R> {
    /// Creates a manager commanding `radio`; `events` is the channel the radio reports on.
    pub fn new(radio: R, events: EventReceiver, config: &BluetoothConfig) -> Self {
        Self {
            radio,
            events,
            state: ConnectionState::Disconnected,
            is_started: false,
            scanner: BluetoothScanner::new(config.devices.clone()),
            connection: None,
            notification_handler: NotificationHandler::new(),
            timings: config.timings(),
            scan_params: config.scan_params(),
            wait_timeout: config.wait_timeout(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_started(&self) -> bool {
        self.is_started
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn scanner(&self) -> &BluetoothScanner {
        &self.scanner
    }

    /// Replaces the allow-list used by the next scans
    pub fn set_only_devices(&mut self, devices: Vec<DeviceAddress>) {
        self.scanner.set_only_devices(devices);
    }

    /// Devices of interest found by the last scan
    pub fn devices(&self) -> &[DeviceAddress] {
        self.scanner.devices()
    }

    /// Handles of the current peer, if any
    pub fn current_device(&self) -> Option<&BluetoothDevice> {
        self.connection.as_ref().map(|connection| &connection.device)
    }

    pub fn device_data(&self, address: &DeviceAddress) -> Option<&DeviceStatusReport> {
        self.notification_handler.device_data(address)
    }

    pub fn cell_voltages(&self, address: &DeviceAddress) -> Option<&CellVoltageReport> {
        self.notification_handler.cell_voltages(address)
    }

    /// Drops the stored reports of `address` without delivering them
    pub fn discard_data(&mut self, address: &DeviceAddress) {
        self.notification_handler.clear_reading(address);
    }

    /// Powers the radio up
    pub fn start(&mut self) -> Result<()> {
        if !self.is_started {
            self.radio.set_active(true)?;
            self.is_started = true;
            info!("Bluetooth started");
        }
        Ok(())
    }

    /// Powers the radio down and forgets the current peer
    pub fn stop(&mut self) {
        if self.is_started {
            if let Err(e) = self.radio.set_active(false) {
                warn!("Failed to deactivate radio: {}", e);
            }
            self.is_started = false;
            info!("Bluetooth stopped");
        }
        if let Some(mut connection) = self.connection.take() {
            connection.device.disconnect();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Scans with the configured parameters
    pub fn scan(&mut self) {
        self.scan_with(self.scan_params);
    }

    /// Starts a scan window; the scan-done event moves the state to `Idle`.
    pub fn scan_with(&mut self, params: ScanParams) {
        self.scanner.clear();
        self.set_state(ConnectionState::Scanning);
        info!(
            "Scanning for {:?} (interval {:?}, window {:?})",
            params.duration, params.interval, params.window
        );
        if let Err(e) = self.radio.scan(params) {
            error!("Failed to start scan: {}", e);
            self.set_state(ConnectionState::Idle);
        }
    }

    /// Starts connecting to `address`, tearing down the current peer first.
    pub async fn connect(&mut self, address: DeviceAddress) {
        if self.connection.is_some() {
            self.disconnect().await;
        }
        // leftovers of earlier sessions must not reach the new one
        if let Err(e) = self.drain_events() {
            debug!("Discarding stale event outcome: {}", e);
        }

        info!("Connecting to {}", address);
        self.connection = Some(ActiveConnection::new(address));
        self.set_state(ConnectionState::Connecting);
        if let Err(e) = self.radio.connect(address) {
            error!("Failed to connect to {}: {}", address, e);
            self.connection = None;
            self.set_state(ConnectionState::Disconnected);
        }
    }

    /// Tears the current session down and settles in `Disconnected`.
    pub async fn disconnect(&mut self) {
        self.teardown(true).await;
    }

    /// Ends the current session after a protocol violation.
    ///
    /// Only the link is dropped; nothing else is written to the peer.
    pub async fn abort_session(&mut self) {
        self.teardown(false).await;
    }

    async fn teardown(&mut self, disable_notifications: bool) {
        let Some(mut connection) = self.connection.take() else {
            self.set_state(ConnectionState::Disconnected);
            return;
        };

        info!("Disconnecting from {}", connection.address());
        if let Some(conn_handle) = connection.conn_handle() {
            if disable_notifications {
                if let Some(cccd_handle) = connection.device.cccd_handle {
                    self.write_handle(conn_handle, cccd_handle, &cccd_value(false));
                }
            }
            match self.radio.disconnect(conn_handle) {
                Ok(()) => {}
                Err(RadioError::AlreadyDisconnected) => {
                    debug!("{} was already disconnected", connection.address());
                }
                Err(e) => warn!("Failed to disconnect {}: {}", connection.address(), e),
            }
        }
        connection.device.disconnect();

        sleep(self.timings.disconnect_settle).await;
        self.set_state(ConnectionState::Disconnected);
    }

    fn link(&self) -> Option<(ConnHandle, &ActiveConnection)> {
        let connection = self.connection.as_ref()?;
        Some((connection.conn_handle()?, connection))
    }

    /// Starts service discovery on the current link
    pub fn get_services(&mut self) {
        let Some((conn_handle, _)) = self.link() else {
            return;
        };
        self.set_state(ConnectionState::Discovering);
        if let Err(e) = self.radio.discover_services(conn_handle) {
            error!("Service discovery failed: {}", e);
        }
    }

    /// Starts characteristic discovery within `range`
    pub fn get_characteristics(&mut self, range: HandleRange) {
        let Some((conn_handle, _)) = self.link() else {
            return;
        };
        if let Err(e) = self.radio.discover_characteristics(conn_handle, range) {
            error!("Characteristic discovery in {} failed: {}", range, e);
        }
    }

    /// Starts descriptor discovery over the BMS service range
    pub fn get_descriptors(&mut self) {
        let Some((conn_handle, connection)) = self.link() else {
            return;
        };
        let Some(range) = connection.services_range() else {
            warn!("No service range to search for descriptors");
            return;
        };
        if let Err(e) = self.radio.discover_descriptors(conn_handle, range) {
            error!("Descriptor discovery in {} failed: {}", range, e);
        }
    }

    /// Subscribes to the BMS, then requests cell voltages and status.
    ///
    /// The status report moves the state from `Communicating` to `Idle`.
    pub async fn fetch_data(&mut self) {
        let Some((_, connection)) = self.link() else {
            warn!("Cannot fetch data without a connected device");
            return;
        };
        let has_write = connection.device.write_handle.is_some();
        if self.state != ConnectionState::Ready {
            warn!("Fetching data in state {}", self.state);
        }

        self.set_state(ConnectionState::Communicating);
        self.enable_notifications(true).await;

        if has_write {
            self.write_data(&BmsCommand::CellVoltages.to_bytes(), None);
            sleep(self.timings.command_gap).await;
            self.write_data(&BmsCommand::BasicInfo.to_bytes(), None);
        }
    }

    /// Writes the CCCD of the current peer and waits for the peer to apply it
    pub async fn enable_notifications(&mut self, enable: bool) {
        let Some(cccd_handle) = self.current_device().and_then(|device| device.cccd_handle) else {
            warn!("No CCCD handle to write");
            return;
        };
        self.write_data(&cccd_value(enable), Some(cccd_handle));
        sleep(self.timings.notify_settle).await;
    }

    /// Writes `data` to `handle`, or to the write characteristic by default.
    pub fn write_data(&mut self, data: &[u8], handle: Option<AttrHandle>) {
        let Some((conn_handle, connection)) = self.link() else {
            return;
        };
        let Some(handle) = handle.or(connection.device.write_handle) else {
            return;
        };
        self.write_handle(conn_handle, handle, data);
    }

    fn write_handle(&self, conn_handle: ConnHandle, handle: AttrHandle, data: &[u8]) {
        debug!("Writing {} to 0x{:04X}", hex::encode(data), handle);
        if let Err(e) = self.radio.write(conn_handle, handle, data) {
            warn!("Write to 0x{:04X} failed: {}", handle, e);
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state != state {
            debug!("State {} -> {}", self.state, state);
        }
        self.state = state;

        if state == ConnectionState::Connected {
            self.on_connected();
        }
    }

    fn on_connected(&mut self) {
        self.get_services();
    }

    /// Dispatches one radio event.
    ///
    /// A protocol violation leaves the session as is; the caller aborts it.
    pub fn handle_event(&mut self, event: RadioEvent) -> std::result::Result<(), ProtocolViolation> {
        match event {
            RadioEvent::ScanResult { address, rssi } => {
                if self.state == ConnectionState::Scanning {
                    self.scanner.handle_scan_result(address, rssi);
                }
            }
            RadioEvent::ScanDone => {
                info!("Scan finished, {} device(s) found", self.scanner.devices().len());
                if self.state == ConnectionState::Scanning {
                    self.set_state(ConnectionState::Idle);
                }
            }
            RadioEvent::PeripheralConnected {
                conn_handle,
                address,
            } => self.on_peripheral_connected(conn_handle, address),
            RadioEvent::PeripheralDisconnected {
                conn_handle,
                address,
            } => self.on_peripheral_disconnected(conn_handle, address),
            RadioEvent::ServiceResult {
                conn_handle,
                range,
                uuid,
            } => {
                let Some(connection) = self.owned_connection(conn_handle) else {
                    return Ok(());
                };
                if let Some(range) = connection.record_service(range, uuid) {
                    self.get_characteristics(range);
                }
            }
            RadioEvent::ServiceDone { conn_handle } => {
                if self.owned_connection(conn_handle).is_some() {
                    return self.evaluate_services();
                }
            }
            RadioEvent::CharacteristicResult {
                conn_handle,
                value_handle,
                uuid,
            } => {
                if let Some(connection) = self.owned_connection(conn_handle) {
                    connection.record_characteristic(value_handle, uuid);
                }
            }
            RadioEvent::CharacteristicDone { conn_handle } => {
                trace!("Characteristic discovery done on {}", conn_handle);
            }
            RadioEvent::DescriptorResult {
                conn_handle,
                handle,
                uuid,
            } => {
                if let Some(connection) = self.owned_connection(conn_handle) {
                    connection.record_descriptor(handle, uuid);
                }
            }
            RadioEvent::DescriptorDone { conn_handle } => {
                if self.owned_connection(conn_handle).is_some()
                    && self.state == ConnectionState::Discovering
                {
                    return self.finish_discovery();
                }
            }
            RadioEvent::WriteDone {
                conn_handle,
                handle,
            } => {
                trace!("Write to 0x{:04X} done on {}", handle, conn_handle);
            }
            RadioEvent::Notify {
                conn_handle,
                value_handle,
                data,
            } => self.on_notify(conn_handle, value_handle, &data)?,
        }
        Ok(())
    }

    fn owned_connection(&mut self, conn_handle: ConnHandle) -> Option<&mut ActiveConnection> {
        self.connection
            .as_mut()
            .filter(|connection| connection.owns(conn_handle))
    }

    fn on_peripheral_connected(&mut self, conn_handle: ConnHandle, address: DeviceAddress) {
        let connecting = self.state == ConnectionState::Connecting;
        match self.connection.as_mut() {
            Some(connection)
                if connecting
                    && connection.address() == address
                    && connection.conn_handle().is_none() =>
            {
                info!("Connected to {} (handle {})", address, conn_handle);
                connection.set_conn_handle(conn_handle);
                self.set_state(ConnectionState::Connected);
            }
            _ => {
                warn!("Unexpected link to {} (handle {}), dropping it", address, conn_handle);
                if let Err(e) = self.radio.disconnect(conn_handle) {
                    debug!("Dropping unexpected link failed: {}", e);
                }
            }
        }
    }

    fn on_peripheral_disconnected(&mut self, conn_handle: ConnHandle, address: DeviceAddress) {
        let ours = self
            .connection
            .as_ref()
            .is_some_and(|c| c.matches_link(conn_handle, address));
        if !ours {
            debug!("Ignoring disconnect of {} (handle {})", address, conn_handle);
            return;
        }

        info!("{} disconnected", address);
        if let Some(mut connection) = self.connection.take() {
            connection.device.disconnect();
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Decides what follows service discovery
    fn evaluate_services(&mut self) -> std::result::Result<(), ProtocolViolation> {
        if self.state != ConnectionState::Discovering {
            return Ok(());
        }
        let Some(connection) = self.connection.as_ref() else {
            return Ok(());
        };

        // some peers only expose the CCCD as a standalone descriptor
        let needs_descriptors =
            connection.device.cccd_handle.is_none() && connection.services_range().is_some();
        if needs_descriptors {
            debug!("CCCD not found among characteristics, searching descriptors");
            self.get_descriptors();
            return Ok(());
        }
        self.finish_discovery()
    }

    fn finish_discovery(&mut self) -> std::result::Result<(), ProtocolViolation> {
        let Some(connection) = self.connection.as_ref() else {
            return Ok(());
        };

        let missing: Vec<MissingHandle> = connection.device.missing_handles();
        if !missing.is_empty() {
            return Err(ProtocolViolation::MissingHandles {
                address: connection.address(),
                missing,
            });
        }

        info!("{} is ready", connection.address());
        self.set_state(ConnectionState::Ready);
        Ok(())
    }

    fn on_notify(
        &mut self,
        conn_handle: ConnHandle,
        value_handle: AttrHandle,
        data: &[u8],
    ) -> std::result::Result<(), ProtocolViolation> {
        let Some(connection) = self.owned_connection(conn_handle) else {
            debug!("Ignoring notification on handle {}", conn_handle);
            return Ok(());
        };
        if connection.device.notify_handle != Some(value_handle) {
            debug!("Ignoring notification from 0x{:04X}", value_handle);
            return Ok(());
        }

        let address = connection.address();
        let report = self
            .notification_handler
            .handle_notification(address, data)?;
        if report.is_some() && self.state == ConnectionState::Communicating {
            self.set_state(ConnectionState::Idle);
        }
        Ok(())
    }

    /// Dispatches every event the radio has queued, stopping at the first violation.
    fn drain_events(&mut self) -> std::result::Result<(), ProtocolViolation> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event)?;
        }
        Ok(())
    }

    /// Dispatches every queued event; a protocol violation aborts the session.
    pub async fn pump_events(&mut self) -> Result<()> {
        if let Err(violation) = self.drain_events() {
            return Err(self.fail_session(violation).await);
        }
        Ok(())
    }

    async fn fail_session(&mut self, violation: ProtocolViolation) -> BmsError {
        error!("Protocol violation: {}", violation);
        self.abort_session().await;
        violation.into()
    }

    /// Waits until `done` holds for the current state, dispatching events meanwhile.
    ///
    /// Returns `Ok(false)` on timeout. A protocol violation aborts the session
    /// and is returned as an error.
    pub async fn wait_for_state<F>(&mut self, mut done: F, timeout: Duration) -> Result<bool>
    where
        F: FnMut(ConnectionState) -> bool,
    {
        let check_interval = self.timings.check_interval;
        let mut violation = None;

        let reached = wait_for(
            || match self.drain_events() {
                Ok(()) => done(self.state),
                Err(e) => {
                    violation = Some(e);
                    true
                }
            },
            timeout,
            check_interval,
            || warn!("Timed out after {:?}", timeout),
        )
        .await;

        if let Some(violation) = violation {
            return Err(self.fail_session(violation).await);
        }
        Ok(reached)
    }

    /// Waits with the configured timeout until the state is one of `states`.
    pub async fn wait_for_any(&mut self, states: &[ConnectionState]) -> Result<bool> {
        let timeout = self.wait_timeout;
        let reached = self
            .wait_for_state(|state| states.contains(&state), timeout)
            .await?;
        if !reached {
            warn!("Still {} while waiting for {:?}", self.state, states);
        }
        Ok(reached)
    }

    /// Delivers the stored reading for `address`.
    ///
    /// Returns `Ok(false)` when the sink is offline or nothing is stored. The
    /// stored reports are dropped only after a successful delivery.
    pub async fn save_data(&mut self, address: DeviceAddress, sink: &dyn ReadingSink) -> Result<bool> {
        if !sink.is_online() {
            warn!("Sink offline, keeping data of {}", address);
            return Ok(false);
        }
        let Some(reading) = self.notification_handler.reading(&address) else {
            debug!("No data to save for {}", address);
            return Ok(false);
        };

        match sink.deliver(&reading).await {
            Ok(()) => {
                info!("Saved data of {}", address);
                self.notification_handler.clear_reading(&address);
                Ok(true)
            }
            Err(e) => Err(BmsError::Delivery {
                address,
                message: format!("{:#}", e),
            }),
        }
    }
}
