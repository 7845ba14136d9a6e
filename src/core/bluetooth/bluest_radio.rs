//! Radio adapter on top of the host Bluetooth stack
//!
//! bluest works with service and characteristic objects instead of attribute
//! handles, so this adapter hands out synthetic connection and attribute
//! handles and maps them back to the objects. Each service gets a fixed span
//! of handles; within it every characteristic takes three slots:
//! declaration, value and CCCD.

use std::collections::HashMap;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::{Result, anyhow};
use bluest::{Adapter, Characteristic, Device, Service};
use futures_util::StreamExt;
use log::{debug, error, info, trace, warn};
use regex::Regex;
use tokio::runtime::Handle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

use crate::core::bluetooth::commands::cccd_value;
use crate::core::bluetooth::constants::{UUID_BMS_SERVICE, UUID_CCCD};
use crate::core::bluetooth::radio::{EventSender, RadioAdapter, RadioEvent, ScanParams};
use crate::core::bluetooth::types::{AttrHandle, ConnHandle, DeviceAddress, HandleRange};
use crate::error::RadioError;

/// Handles reserved per service
const SERVICE_SPAN: AttrHandle = 0x40;

/// Handles taken by one characteristic
const CHARACTERISTIC_SLOTS: AttrHandle = 3;

/// Connection handle reported for a connect attempt that never got a link
const NO_CONN_HANDLE: ConnHandle = 0xFFFF;

/// How often a link is checked for a drop by the peer
const LINK_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Clone)]
enum Attribute {
    Characteristic(Characteristic),
    Cccd {
        value_handle: AttrHandle,
        characteristic: Characteristic,
    },
}

struct Link {
    address: DeviceAddress,
    device: Device,
    services: Vec<(HandleRange, Service)>,
    attributes: HashMap<AttrHandle, Attribute>,
    /// Running notification streams by value handle
    notifications: HashMap<AttrHandle, CancellationToken>,
    /// Service discovery ended but waits for the BMS characteristics
    service_done_pending: bool,
    /// Stops the link watcher
    watch: CancellationToken,
}

impl Link {
    fn close(&mut self) {
        self.watch.cancel();
        for (_, token) in self.notifications.drain() {
            token.cancel();
        }
    }

    fn characteristics_in(&self, range: HandleRange) -> Vec<(AttrHandle, Characteristic)> {
        let mut found: Vec<(AttrHandle, Characteristic)> = self
            .attributes
            .iter()
            .filter_map(|(handle, attribute)| match attribute {
                Attribute::Characteristic(c) if range.contains(*handle) => Some((*handle, c.clone())),
                _ => None,
            })
            .collect();
        found.sort_by_key(|(handle, _)| *handle);
        found
    }
}

struct RadioState {
    active: bool,
    discovered: HashMap<DeviceAddress, Device>,
    links: HashMap<ConnHandle, Link>,
    next_conn_handle: ConnHandle,
}

fn lock(state: &Mutex<RadioState>) -> MutexGuard<'_, RadioState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn send(events: &EventSender, event: RadioEvent) {
    if events.send(event).is_err() {
        debug!("Radio event dropped, receiver is gone");
    }
}

/// Pulls the MAC address out of a platform device id
fn extract_mac_address(device_id: &str) -> Option<DeviceAddress> {
    let re = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").ok()?;
    let found = re.find_iter(device_id).last()?;
    found.as_str().replace('-', ":").parse().ok()
}

/// [`RadioAdapter`] backed by the host adapter through bluest
#[derive(Clone)]
pub struct BluestRadio {
    adapter: Adapter,
    events: EventSender,
    state: Arc<Mutex<RadioState>>,
    runtime: Handle,
}

impl BluestRadio {
    /// Opens the default adapter and waits until it is powered.
    ///
    /// Must be called from within a tokio runtime; commands are run on it.
    pub async fn new(events: EventSender) -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| anyhow!("No Bluetooth adapter found"))?;
        adapter.wait_available().await?;
        info!("Bluetooth adapter is available.");

        Ok(Self {
            adapter,
            events,
            state: Arc::new(Mutex::new(RadioState {
                active: false,
                discovered: HashMap::new(),
                links: HashMap::new(),
                next_conn_handle: 0,
            })),
            runtime: Handle::current(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, RadioState> {
        lock(&self.state)
    }

    fn ensure_active(&self) -> Result<(), RadioError> {
        if self.lock().active {
            Ok(())
        } else {
            Err(RadioError::NotActive)
        }
    }

    fn with_link<T>(
        &self,
        conn_handle: ConnHandle,
        f: impl FnOnce(&mut Link) -> Result<T, RadioError>,
    ) -> Result<T, RadioError> {
        let mut state = self.lock();
        let link = state
            .links
            .get_mut(&conn_handle)
            .ok_or(RadioError::AlreadyDisconnected)?;
        f(link)
    }

    fn watch_link(&self, conn_handle: ConnHandle, device: Device, token: CancellationToken) {
        let state = self.state.clone();
        let events = self.events.clone();

        self.runtime.spawn(async move {
            loop {
                tokio::select! {
                    _ = sleep(LINK_POLL_INTERVAL) => {
                        if !device.is_connected().await {
                            break;
                        }
                    }
                    _ = token.cancelled() => return,
                }
            }

            let link = lock(&state).links.remove(&conn_handle);
            if let Some(mut link) = link {
                info!("Link to {} lost", link.address);
                link.close();
                send(
                    &events,
                    RadioEvent::PeripheralDisconnected {
                        conn_handle,
                        address: link.address,
                    },
                );
            }
        });
    }

    fn start_notifications(
        &self,
        conn_handle: ConnHandle,
        value_handle: AttrHandle,
        characteristic: Characteristic,
    ) -> Result<(), RadioError> {
        let token = CancellationToken::new();
        self.with_link(conn_handle, |link| {
            if let Some(previous) = link.notifications.insert(value_handle, token.clone()) {
                previous.cancel();
            }
            Ok(())
        })?;

        let events = self.events.clone();
        self.runtime.spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(e) => {
                    error!("Failed to subscribe to notifications: {}", e);
                    return;
                }
            };
            let mut stream = pin!(stream);
            debug!("Listening for notifications on 0x{:04X}", value_handle);

            loop {
                tokio::select! {
                    item = stream.next() => match item {
                        Some(Ok(data)) => send(
                            &events,
                            RadioEvent::Notify {
                                conn_handle,
                                value_handle,
                                data,
                            },
                        ),
                        Some(Err(e)) => {
                            error!("Error in notification stream: {}", e);
                            break;
                        }
                        None => break,
                    },
                    _ = token.cancelled() => break,
                }
            }
            debug!("Notification stream on 0x{:04X} ended", value_handle);
        });
        Ok(())
    }

    fn stop_notifications(&self, conn_handle: ConnHandle, value_handle: AttrHandle) -> Result<(), RadioError> {
        self.with_link(conn_handle, |link| {
            if let Some(token) = link.notifications.remove(&value_handle) {
                token.cancel();
            }
            Ok(())
        })
    }
}

impl RadioAdapter for BluestRadio {
    fn set_active(&self, active: bool) -> Result<(), RadioError> {
        let mut state = self.lock();
        state.active = active;
        if !active {
            for (_, mut link) in state.links.drain() {
                link.close();
            }
        }
        debug!("Radio {}", if active { "activated" } else { "deactivated" });
        Ok(())
    }

    fn scan(&self, params: ScanParams) -> Result<(), RadioError> {
        self.ensure_active()?;
        // interval, window and scan type are left to the host stack
        debug!(
            "Scan requested with interval {:?}, window {:?}, active {}",
            params.interval, params.window, params.active
        );

        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            match adapter.scan(&[]).await {
                Ok(stream) => {
                    let mut stream = pin!(stream);
                    let collect = async {
                        while let Some(discovered) = stream.next().await {
                            let id = discovered.device.id().to_string();
                            let Some(address) = extract_mac_address(&id) else {
                                trace!("No address in device id {}", id);
                                continue;
                            };
                            lock(&state).discovered.insert(address, discovered.device);
                            send(
                                &events,
                                RadioEvent::ScanResult {
                                    address,
                                    rssi: discovered.rssi,
                                },
                            );
                        }
                    };
                    if timeout(params.duration, collect).await.is_ok() {
                        info!("Bluetooth scan stream has ended.");
                    }
                }
                Err(e) => error!("Failed to start scan: {}", e),
            }
            send(&events, RadioEvent::ScanDone);
        });
        Ok(())
    }

    fn connect(&self, address: DeviceAddress) -> Result<(), RadioError> {
        self.ensure_active()?;
        let device = self
            .lock()
            .discovered
            .get(&address)
            .cloned()
            .ok_or(RadioError::UnknownPeer(address))?;

        let adapter = self.adapter.clone();
        let state = self.state.clone();
        let events = self.events.clone();
        let radio = self.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.connect_device(&device).await {
                warn!("Connection to {} failed: {}", address, e);
                send(
                    &events,
                    RadioEvent::PeripheralDisconnected {
                        conn_handle: NO_CONN_HANDLE,
                        address,
                    },
                );
                return;
            }

            let watch = CancellationToken::new();
            let conn_handle = {
                let mut state = lock(&state);
                let conn_handle = state.next_conn_handle;
                state.next_conn_handle = state.next_conn_handle.wrapping_add(1) % NO_CONN_HANDLE;
                state.links.insert(
                    conn_handle,
                    Link {
                        address,
                        device: device.clone(),
                        services: Vec::new(),
                        attributes: HashMap::new(),
                        notifications: HashMap::new(),
                        service_done_pending: false,
                        watch: watch.clone(),
                    },
                );
                conn_handle
            };
            radio.watch_link(conn_handle, device, watch);
            send(
                &events,
                RadioEvent::PeripheralConnected {
                    conn_handle,
                    address,
                },
            );
        });
        Ok(())
    }

    fn disconnect(&self, conn_handle: ConnHandle) -> Result<(), RadioError> {
        let mut link = self
            .lock()
            .links
            .remove(&conn_handle)
            .ok_or(RadioError::AlreadyDisconnected)?;
        link.close();

        let adapter = self.adapter.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            if let Err(e) = adapter.disconnect_device(&link.device).await {
                warn!("Disconnecting {} failed: {}", link.address, e);
            }
            send(
                &events,
                RadioEvent::PeripheralDisconnected {
                    conn_handle,
                    address: link.address,
                },
            );
        });
        Ok(())
    }

    fn discover_services(&self, conn_handle: ConnHandle) -> Result<(), RadioError> {
        let device = self.with_link(conn_handle, |link| Ok(link.device.clone()))?;

        let state = self.state.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let services = match device.services().await {
                Ok(services) => services,
                Err(e) => {
                    error!("Service discovery failed: {}", e);
                    return;
                }
            };

            let mut found = Vec::with_capacity(services.len());
            for (index, service) in services.into_iter().enumerate() {
                let range = AttrHandle::try_from(index)
                    .ok()
                    .and_then(|index| index.checked_mul(SERVICE_SPAN))
                    .and_then(|offset| {
                        Some(HandleRange::new(offset.checked_add(1)?, offset.checked_add(SERVICE_SPAN)?))
                    });
                let Some(range) = range else {
                    warn!("Too many services, ignoring the rest");
                    break;
                };
                found.push((range, service));
            }

            // the BMS characteristics are requested from the service result,
            // so the end of discovery is held back until they are in
            let has_bms = found.iter().any(|(_, service)| service.uuid() == UUID_BMS_SERVICE);
            {
                let mut state = lock(&state);
                let Some(link) = state.links.get_mut(&conn_handle) else {
                    return;
                };
                link.services = found.clone();
                link.service_done_pending = has_bms;
            }

            for (range, service) in found {
                send(
                    &events,
                    RadioEvent::ServiceResult {
                        conn_handle,
                        range,
                        uuid: service.uuid(),
                    },
                );
            }
            if !has_bms {
                send(&events, RadioEvent::ServiceDone { conn_handle });
            }
        });
        Ok(())
    }

    fn discover_characteristics(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError> {
        let service = self.with_link(conn_handle, |link| {
            link.services
                .iter()
                .find(|(service_range, _)| *service_range == range)
                .map(|(_, service)| service.clone())
                .ok_or(RadioError::UnknownHandle(range.start))
        })?;

        let state = self.state.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let characteristics = match service.characteristics().await {
                Ok(characteristics) => characteristics,
                Err(e) => {
                    error!("Characteristic discovery failed: {}", e);
                    return;
                }
            };

            let mut found = Vec::with_capacity(characteristics.len());
            for (index, characteristic) in characteristics.into_iter().enumerate() {
                let value_handle = AttrHandle::try_from(index)
                    .ok()
                    .and_then(|index| index.checked_mul(CHARACTERISTIC_SLOTS))
                    .and_then(|offset| range.start.checked_add(offset)?.checked_add(2))
                    .filter(|handle| handle.checked_add(1).is_some_and(|cccd| range.contains(cccd)));
                let Some(value_handle) = value_handle else {
                    warn!("Too many characteristics in {}, ignoring the rest", range);
                    break;
                };
                found.push((value_handle, characteristic));
            }

            {
                let mut state = lock(&state);
                let Some(link) = state.links.get_mut(&conn_handle) else {
                    return;
                };
                for (value_handle, characteristic) in &found {
                    link.attributes
                        .insert(*value_handle, Attribute::Characteristic(characteristic.clone()));
                }
            }

            for (value_handle, characteristic) in found {
                send(
                    &events,
                    RadioEvent::CharacteristicResult {
                        conn_handle,
                        value_handle,
                        uuid: characteristic.uuid(),
                    },
                );
            }
            send(&events, RadioEvent::CharacteristicDone { conn_handle });

            let services_done = lock(&state)
                .links
                .get_mut(&conn_handle)
                .is_some_and(|link| std::mem::take(&mut link.service_done_pending));
            if services_done {
                send(&events, RadioEvent::ServiceDone { conn_handle });
            }
        });
        Ok(())
    }

    fn discover_descriptors(
        &self,
        conn_handle: ConnHandle,
        range: HandleRange,
    ) -> Result<(), RadioError> {
        let characteristics = self.with_link(conn_handle, |link| Ok(link.characteristics_in(range)))?;

        let state = self.state.clone();
        let events = self.events.clone();
        self.runtime.spawn(async move {
            let mut found = Vec::new();
            for (value_handle, characteristic) in characteristics {
                let listed = match characteristic.descriptors().await {
                    Ok(descriptors) => descriptors.iter().any(|d| d.uuid() == UUID_CCCD),
                    Err(e) => {
                        debug!("Descriptor discovery on 0x{:04X} failed: {}", value_handle, e);
                        false
                    }
                };
                // some hosts hide the CCCD of notifying characteristics
                let notifies = characteristic
                    .properties()
                    .await
                    .map(|properties| properties.notify || properties.indicate)
                    .unwrap_or(false);
                if listed || notifies {
                    found.push((value_handle, characteristic));
                }
            }

            {
                let mut state = lock(&state);
                let Some(link) = state.links.get_mut(&conn_handle) else {
                    return;
                };
                for (value_handle, characteristic) in &found {
                    link.attributes.insert(
                        *value_handle + 1,
                        Attribute::Cccd {
                            value_handle: *value_handle,
                            characteristic: characteristic.clone(),
                        },
                    );
                }
            }

            for (value_handle, _) in found {
                send(
                    &events,
                    RadioEvent::DescriptorResult {
                        conn_handle,
                        handle: value_handle + 1,
                        uuid: UUID_CCCD,
                    },
                );
            }
            send(&events, RadioEvent::DescriptorDone { conn_handle });
        });
        Ok(())
    }

    fn write(
        &self,
        conn_handle: ConnHandle,
        handle: AttrHandle,
        data: &[u8],
    ) -> Result<(), RadioError> {
        let attribute = self.with_link(conn_handle, |link| {
            link.attributes
                .get(&handle)
                .cloned()
                .ok_or(RadioError::UnknownHandle(handle))
        })?;

        match attribute {
            Attribute::Cccd {
                value_handle,
                characteristic,
            } => {
                if data == cccd_value(false) {
                    self.stop_notifications(conn_handle, value_handle)?;
                } else {
                    self.start_notifications(conn_handle, value_handle, characteristic)?;
                }
                send(
                    &self.events,
                    RadioEvent::WriteDone {
                        conn_handle,
                        handle,
                    },
                );
            }
            Attribute::Characteristic(characteristic) => {
                let events = self.events.clone();
                let data = data.to_vec();
                self.runtime.spawn(async move {
                    match characteristic.write_without_response(&data).await {
                        Ok(()) => send(
                            &events,
                            RadioEvent::WriteDone {
                                conn_handle,
                                handle,
                            },
                        ),
                        Err(e) => error!("Write to 0x{:04X} failed: {}", handle, e),
                    }
                });
            }
        }
        Ok(())
    }
}
