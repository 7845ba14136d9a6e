//! Periodic battery sweep
//!
//! One sweep scans for the configured BMS peers and reads them one after the
//! other: connect, wait for discovery, fetch, wait for the status report,
//! disconnect, deliver. Each peer ends with a [`DeviceOutcome`].

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::{info, warn};

use crate::config::bluetooth_config::BluetoothConfig;
use crate::core::bluetooth::radio::{EventReceiver, RadioAdapter};
use crate::core::bluetooth::types::{ConnectionState, DeviceAddress};
use crate::core::bluetooth::BluetoothManager;
use crate::delivery::ReadingSink;
use crate::error::{BmsError, ProtocolViolation, RadioError, Result};

/// Step of a peer exchange that can time out
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepStage {
    /// Connect and discovery
    Connect,
    /// Fetching the reports
    Exchange,
}

impl fmt::Display for SweepStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepStage::Connect => write!(f, "connect"),
            SweepStage::Exchange => write!(f, "exchange"),
        }
    }
}

/// How reading one peer ended
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceOutcome {
    /// The reading was delivered
    Updated,
    /// The reading was kept back: sink offline or no status report
    NotDelivered,
    /// The last scan did not see the peer
    NotFound,
    /// The peer dropped the link
    Dropped,
    /// A wait ran into its timeout
    TimedOut(SweepStage),
    /// The peer does not speak the expected protocol
    ProtocolViolation(ProtocolViolation),
    /// A radio command failed
    RadioFailed(RadioError),
    /// The sink rejected the reading
    DeliveryFailed(String),
}

impl DeviceOutcome {
    fn from_error(error: BmsError) -> Self {
        match error {
            BmsError::Protocol(violation) => DeviceOutcome::ProtocolViolation(violation),
            BmsError::Radio(e) => DeviceOutcome::RadioFailed(e),
            BmsError::Delivery { message, .. } => DeviceOutcome::DeliveryFailed(message),
        }
    }
}

impl fmt::Display for DeviceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceOutcome::Updated => write!(f, "updated"),
            DeviceOutcome::NotDelivered => write!(f, "not delivered"),
            DeviceOutcome::NotFound => write!(f, "not found"),
            DeviceOutcome::Dropped => write!(f, "dropped the link"),
            DeviceOutcome::TimedOut(stage) => write!(f, "timed out during {}", stage),
            DeviceOutcome::ProtocolViolation(v) => write!(f, "protocol violation: {}", v),
            DeviceOutcome::RadioFailed(e) => write!(f, "radio failure: {}", e),
            DeviceOutcome::DeliveryFailed(message) => write!(f, "delivery failed: {}", message),
        }
    }
}

/// Drives sweeps over the configured peers
pub struct BatteryMonitor<R: RadioAdapter, S: ReadingSink> {
    manager: BluetoothManager<R>,
    sink: S,
    config: BluetoothConfig,
    last_updated: HashMap<DeviceAddress, DateTime<Utc>>,
}

impl<R: RadioAdapter, S: ReadingSink> BatteryMonitor<R, S> {
    pub fn new(radio: R, events: EventReceiver, sink: S, config: BluetoothConfig) -> Self {
        Self {
            manager: BluetoothManager::new(radio, events, &config),
            sink,
            config,
            last_updated: HashMap::new(),
        }
    }

    pub fn manager(&self) -> &BluetoothManager<R> {
        &self.manager
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Runs one sweep over every configured peer.
    ///
    /// Only a failure to power the radio up is returned as an error; everything
    /// else ends up in the per-peer outcomes.
    pub async fn update_bluetooth(&mut self) -> Result<Vec<(DeviceAddress, DeviceOutcome)>> {
        if !self.config.enabled {
            info!("Bluetooth disabled, skipping sweep");
            return Ok(Vec::new());
        }

        self.manager.start()?;
        self.manager.scan();
        let scan_timeout = self.config.scan_params().duration + self.config.wait_timeout();
        let scanned = self
            .manager
            .wait_for_state(|state| state != ConnectionState::Scanning, scan_timeout)
            .await?;
        if !scanned {
            warn!("Scan did not finish, using {} device(s) seen so far", self.manager.devices().len());
        }

        let mut outcomes = Vec::with_capacity(self.config.devices.len());
        for address in self.config.devices.clone() {
            let outcome = self.update_device(address).await;
            match &outcome {
                DeviceOutcome::Updated => info!("{}: {}", address, outcome),
                _ => warn!("{}: {}", address, outcome),
            }
            outcomes.push((address, outcome));
        }
        Ok(outcomes)
    }

    async fn update_device(&mut self, address: DeviceAddress) -> DeviceOutcome {
        if !self.manager.scanner().contains(&address) {
            return DeviceOutcome::NotFound;
        }

        self.manager.connect(address).await;
        match self
            .manager
            .wait_for_any(&[ConnectionState::Ready, ConnectionState::Disconnected])
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                self.manager.disconnect().await;
                return DeviceOutcome::TimedOut(SweepStage::Connect);
            }
            Err(e) => return DeviceOutcome::from_error(e),
        }
        if self.manager.state() == ConnectionState::Disconnected {
            return DeviceOutcome::Dropped;
        }

        self.manager.fetch_data().await;
        let failed = match self
            .manager
            .wait_for_any(&[ConnectionState::Idle, ConnectionState::Disconnected])
            .await
        {
            Ok(true) if self.manager.state() == ConnectionState::Disconnected => {
                Some(DeviceOutcome::Dropped)
            }
            Ok(true) => None,
            Ok(false) => Some(DeviceOutcome::TimedOut(SweepStage::Exchange)),
            Err(e) => Some(DeviceOutcome::from_error(e)),
        };
        self.manager.disconnect().await;

        if let Some(outcome) = failed {
            // reports of a broken exchange must not end up in a later reading
            self.manager.discard_data(&address);
            return outcome;
        }

        match self.manager.save_data(address, &self.sink).await {
            Ok(true) => {
                self.last_updated.insert(address, Utc::now());
                DeviceOutcome::Updated
            }
            Ok(false) => DeviceOutcome::NotDelivered,
            Err(e) => DeviceOutcome::from_error(e),
        }
    }

    /// Time of the last delivered reading for `address`
    pub fn last_updated(&self, address: &DeviceAddress) -> Option<DateTime<Utc>> {
        self.last_updated.get(address).copied()
    }

    /// Configured peers without a delivered reading in the last `max_age`
    pub fn stale_devices(&self, max_age: ChronoDuration) -> Vec<DeviceAddress> {
        self.stale_devices_at(Utc::now(), max_age)
    }

    fn stale_devices_at(&self, now: DateTime<Utc>, max_age: ChronoDuration) -> Vec<DeviceAddress> {
        self.config
            .devices
            .iter()
            .filter(|address| {
                self.last_updated
                    .get(address)
                    .is_none_or(|updated| now - *updated > max_age)
            })
            .copied()
            .collect()
    }

    /// Leaves the current peer and powers the radio down
    pub async fn shutdown(&mut self) {
        self.manager.disconnect().await;
        self.manager.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::bluetooth::radio::event_channel;
    use crate::test_utils::{MockRadio, RadioCommand, RecordingSink, SimulatedBms};

    const BMS_A: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xD9, 0xE4]);
    const BMS_B: DeviceAddress = DeviceAddress::new([0xA5, 0xC2, 0x37, 0x2D, 0xC6, 0x18]);

    fn monitor(
        config: BluetoothConfig,
        peers: Vec<SimulatedBms>,
    ) -> (BatteryMonitor<MockRadio, RecordingSink>, MockRadio) {
        let (tx, rx) = event_channel();
        let radio = MockRadio::new(tx);
        for peer in peers {
            radio.add_peer(peer);
        }
        let monitor = BatteryMonitor::new(radio.clone(), rx, RecordingSink::new(), config);
        (monitor, radio)
    }

    fn config(devices: Vec<DeviceAddress>) -> BluetoothConfig {
        BluetoothConfig {
            devices,
            ..BluetoothConfig::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_sweep_does_nothing() {
        let config = BluetoothConfig {
            enabled: false,
            ..config(vec![BMS_A])
        };
        let (mut monitor, radio) = monitor(config, vec![SimulatedBms::new(BMS_A)]);

        assert!(monitor.update_bluetooth().await.unwrap().is_empty());
        assert!(radio.commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_updates_device() {
        let (mut monitor, radio) = monitor(config(vec![BMS_A]), vec![SimulatedBms::new(BMS_A)]);

        let outcomes = monitor.update_bluetooth().await.unwrap();
        assert_eq!(outcomes, vec![(BMS_A, DeviceOutcome::Updated)]);
        assert_eq!(monitor.sink().readings().len(), 1);
        assert!(monitor.last_updated(&BMS_A).is_some());
        assert_eq!(monitor.manager().state(), ConnectionState::Disconnected);
        assert_eq!(radio.link_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_peer_is_not_connected() {
        let (mut monitor, radio) = monitor(config(vec![BMS_B]), vec![SimulatedBms::new(BMS_A)]);

        let outcomes = monitor.update_bluetooth().await.unwrap();
        assert_eq!(outcomes, vec![(BMS_B, DeviceOutcome::NotFound)]);
        assert!(
            !radio
                .commands()
                .iter()
                .any(|c| matches!(c, RadioCommand::Connect(_)))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_exchange_timeout_discards_partial_reports() {
        let (mut monitor, _radio) = monitor(
            config(vec![BMS_A]),
            vec![SimulatedBms::new(BMS_A).silent_on_status()],
        );

        let outcomes = monitor.update_bluetooth().await.unwrap();
        assert_eq!(
            outcomes,
            vec![(BMS_A, DeviceOutcome::TimedOut(SweepStage::Exchange))]
        );
        assert!(monitor.manager().cell_voltages(&BMS_A).is_none());
        assert!(monitor.manager().device_data(&BMS_A).is_none());
        assert!(monitor.sink().readings().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stray_terminator_discards_partial_reports() {
        let (mut monitor, radio) = monitor(
            config(vec![BMS_A]),
            vec![SimulatedBms::new(BMS_A).with_status_frame(Vec::new())],
        );

        let outcomes = monitor.update_bluetooth().await.unwrap();
        assert_eq!(
            outcomes,
            vec![(
                BMS_A,
                DeviceOutcome::ProtocolViolation(ProtocolViolation::UnexpectedTerminator)
            )]
        );
        assert!(monitor.manager().cell_voltages(&BMS_A).is_none());
        assert_eq!(radio.link_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_devices() {
        let (mut monitor, _radio) = monitor(config(vec![BMS_A, BMS_B]), vec![]);
        let now = Utc::now();
        monitor.last_updated.insert(BMS_A, now - ChronoDuration::minutes(2));

        assert_eq!(monitor.stale_devices_at(now, ChronoDuration::minutes(5)), vec![BMS_B]);
        assert_eq!(
            monitor.stale_devices_at(now, ChronoDuration::minutes(1)),
            vec![BMS_A, BMS_B]
        );
    }
}
