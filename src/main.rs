use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use log::{error, info, warn};

use bms_ble_bridge_lib::config::AppConfig;
use bms_ble_bridge_lib::core::bluetooth::{BluestRadio, event_channel};
use bms_ble_bridge_lib::delivery::LogSink;
use bms_ble_bridge_lib::monitor::{BatteryMonitor, DeviceOutcome};
use bms_ble_bridge_lib::setup_logging;

const DEFAULT_CONFIG_PATH: &str = "bms-bridge.json";

/// Sweeps without a delivered reading before a peer is reported as stale
const STALE_AFTER_SWEEPS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let config = AppConfig::load_config(&config_path).await?;
    setup_logging(config.debug);
    info!(
        "Watching {} device(s), sweeping every {}s",
        config.bluetooth.devices.len(),
        config.sweep_interval_secs
    );

    let (events_tx, events_rx) = event_channel();
    let radio = BluestRadio::new(events_tx).await?;
    let mut monitor = BatteryMonitor::new(radio, events_rx, LogSink, config.bluetooth.clone());

    let interval = Duration::from_secs(config.sweep_interval_secs);
    let stale_after = config.stale_after(STALE_AFTER_SWEEPS);

    loop {
        match monitor.update_bluetooth().await {
            Ok(outcomes) => {
                let updated = outcomes
                    .iter()
                    .filter(|(_, outcome)| *outcome == DeviceOutcome::Updated)
                    .count();
                info!("Sweep done: {}/{} device(s) updated", updated, outcomes.len());
            }
            Err(e) => error!("Sweep failed: {:#}", e),
        }

        let stale = monitor.stale_devices(stale_after);
        if !stale.is_empty() {
            warn!("No reading for {:?} in the last {} sweeps", stale, STALE_AFTER_SWEEPS);
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    monitor.shutdown().await;
    Ok(())
}
