//! BLE transport capability.
//!
//! The bridge core is written against [`BleBackend`]/[`BleClient`] only;
//! [`BluestBackend`] is the concrete implementation selected at startup.
//! Connections are made against devices previously discovered by a scan
//! cycle, which is also how the platform BLE stack behaves.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use log::{debug, error, info};
use regex::Regex;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;

use crate::ble::scanner::{Advertisement, SeenDevice};
use crate::error::{BridgeError, Result};
use crate::utils::Event;

const NOTIFICATION_CHANNEL_DEPTH: usize = 64;

/// BLE address type as configured per device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

/// Handle to one live connection. Exclusively owned by the supervisor
/// iteration that created it.
#[async_trait]
pub trait BleClient: Send + Sync {
    async fn is_connected(&self) -> bool;
    async fn disconnect(&self) -> Result<()>;
    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>>;
    async fn write_characteristic(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()>;
    /// Subscribe to notifications on a characteristic; frames arrive on the
    /// returned channel until the subscription ends or the device drops.
    async fn start_notify(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>>;
    async fn stop_notify(&self, uuid: Uuid) -> Result<()>;
    async fn rssi(&self) -> Option<i16>;
    /// Set once the connection is observed gone (notification stream ended
    /// or an explicit disconnect).
    fn disconnected_event(&self) -> Event;
}

/// The host BLE stack: scanning plus connection establishment.
#[async_trait]
pub trait BleBackend: Send + Sync {
    /// Run one bounded scan cycle, returning every sighting of an
    /// advertising device.
    async fn scan_cycle(&self, window: Duration) -> Result<Vec<SeenDevice>>;
    async fn connect(
        &self,
        mac: &str,
        address_type: AddressType,
        timeout: Duration,
    ) -> Result<Arc<dyn BleClient>>;
}

fn transport<E: std::fmt::Display>(err: E) -> BridgeError {
    BridgeError::Transport(err.to_string())
}

/// `bluest`-based implementation of [`BleBackend`].
pub struct BluestBackend {
    adapter: Adapter,
    discovered: Mutex<HashMap<String, Device>>,
    mac_pattern: Regex,
}

impl BluestBackend {
    pub async fn new() -> Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or_else(|| BridgeError::Transport("no Bluetooth adapter found".to_string()))?;
        adapter.wait_available().await.map_err(transport)?;
        info!("Bluetooth adapter is available");
        Ok(Self {
            adapter,
            discovered: Mutex::new(HashMap::new()),
            mac_pattern: Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})")
                .expect("static pattern"),
        })
    }

    /// Platform device ids embed the MAC on most platforms; take the last
    /// match so path-style ids resolve to the device, not the adapter.
    fn extract_mac(&self, device_id: &str) -> Option<String> {
        self.mac_pattern
            .find_iter(device_id)
            .last()
            .map(|m| m.as_str().replace('-', ":").to_uppercase())
    }
}

#[async_trait]
impl BleBackend for BluestBackend {
    async fn scan_cycle(&self, window: Duration) -> Result<Vec<SeenDevice>> {
        let mut seen = Vec::new();
        let mut stream = self.adapter.scan(&[]).await.map_err(transport)?;
        let deadline = tokio::time::sleep(window);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                next = stream.next() => {
                    let Some(discovered) = next else { break };
                    let id = discovered.device.id().to_string();
                    let Some(mac) = self.extract_mac(&id) else {
                        debug!("no mac in device id {id}");
                        continue;
                    };
                    let advertisement = Advertisement {
                        rssi: discovered.rssi,
                        local_name: discovered.adv_data.local_name.clone(),
                        manufacturer_data: discovered
                            .adv_data
                            .manufacturer_data
                            .as_ref()
                            .map(|m| (m.company_id, m.data.to_vec())),
                        service_data: discovered
                            .adv_data
                            .service_data
                            .iter()
                            .map(|(uuid, data)| (*uuid, data.to_vec()))
                            .collect(),
                    };
                    self.discovered
                        .lock()
                        .await
                        .insert(mac.clone(), discovered.device);
                    seen.push(SeenDevice { mac, advertisement });
                }
            }
        }
        Ok(seen)
    }

    async fn connect(
        &self,
        mac: &str,
        _address_type: AddressType,
        timeout: Duration,
    ) -> Result<Arc<dyn BleClient>> {
        // The platform stack resolves the address type from the cached
        // advertisement, so only the discovered handle is needed here.
        let device = self
            .discovered
            .lock()
            .await
            .get(mac)
            .cloned()
            .ok_or_else(|| BridgeError::DeviceNotFound(mac.to_string()))?;

        if !device.is_connected().await {
            debug!("initiating connection to {mac}");
            tokio::time::timeout(timeout, self.adapter.connect_device(&device))
                .await
                .map_err(|_| BridgeError::Timeout(format!("connecting to {mac}")))?
                .map_err(transport)?;
        }

        let mut characteristics = HashMap::new();
        for service in device.services().await.map_err(transport)? {
            for characteristic in service.characteristics().await.map_err(transport)? {
                characteristics
                    .entry(characteristic.uuid())
                    .or_insert(characteristic);
            }
        }
        info!("connected to {mac}");

        Ok(Arc::new(BluestClient {
            adapter: self.adapter.clone(),
            device,
            characteristics,
            subscriptions: Mutex::new(HashMap::new()),
            disconnected: Event::new(),
        }))
    }
}

pub struct BluestClient {
    adapter: Adapter,
    device: Device,
    characteristics: HashMap<Uuid, Characteristic>,
    subscriptions: Mutex<HashMap<Uuid, CancellationToken>>,
    disconnected: Event,
}

impl BluestClient {
    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics
            .get(&uuid)
            .ok_or_else(|| BridgeError::Transport(format!("characteristic {uuid} not found")))
    }
}

#[async_trait]
impl BleClient for BluestClient {
    async fn is_connected(&self) -> bool {
        self.device.is_connected().await
    }

    async fn disconnect(&self) -> Result<()> {
        for (_, token) in self.subscriptions.lock().await.drain() {
            token.cancel();
        }
        let result = if self.device.is_connected().await {
            debug!("disconnecting from {}", self.device.id());
            self.adapter
                .disconnect_device(&self.device)
                .await
                .map_err(transport)
        } else {
            Ok(())
        };
        self.disconnected.set();
        result
    }

    async fn read_characteristic(&self, uuid: Uuid) -> Result<Vec<u8>> {
        let value = self.characteristic(uuid)?.read().await.map_err(transport)?;
        Ok(value.to_vec())
    }

    async fn write_characteristic(
        &self,
        uuid: Uuid,
        data: &[u8],
        with_response: bool,
    ) -> Result<()> {
        let characteristic = self.characteristic(uuid)?;
        if with_response {
            characteristic.write(data).await.map_err(transport)
        } else {
            characteristic
                .write_without_response(data)
                .await
                .map_err(transport)
        }
    }

    async fn start_notify(&self, uuid: Uuid) -> Result<mpsc::Receiver<Vec<u8>>> {
        let characteristic = self.characteristic(uuid)?.clone();
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_DEPTH);
        let stop = CancellationToken::new();
        self.subscriptions.lock().await.insert(uuid, stop.clone());
        let disconnected = self.disconnected.clone();

        tokio::spawn(async move {
            let stream = match characteristic.notify().await {
                Ok(stream) => stream,
                Err(err) => {
                    error!("failed to subscribe to notifications: {err}");
                    disconnected.set();
                    return;
                }
            };
            tokio::pin!(stream);
            loop {
                tokio::select! {
                    _ = stop.cancelled() => return,
                    item = stream.next() => match item {
                        Some(Ok(value)) => {
                            if tx.send(value.to_vec()).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            error!("notification stream error: {err}");
                            break;
                        }
                        None => break,
                    },
                }
            }
            debug!("notification stream ended");
            disconnected.set();
        });

        Ok(rx)
    }

    async fn stop_notify(&self, uuid: Uuid) -> Result<()> {
        if let Some(token) = self.subscriptions.lock().await.remove(&uuid) {
            token.cancel();
        }
        Ok(())
    }

    async fn rssi(&self) -> Option<i16> {
        self.device.rssi().await.ok()
    }

    fn disconnected_event(&self) -> Event {
        self.disconnected.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_extraction_from_platform_ids() {
        let backend_pattern = Regex::new(r"([0-9A-Fa-f]{2}[:-]){5}([0-9A-Fa-f]{2})").unwrap();
        let extract = |id: &str| {
            backend_pattern
                .find_iter(id)
                .last()
                .map(|m| m.as_str().replace('-', ":").to_uppercase())
        };

        assert_eq!(
            extract("/org/bluez/hci0/dev_AA_BB_CC_DD_EE_FF aa:bb:cc:dd:ee:ff"),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(
            extract("aa-bb-cc-dd-ee-ff"),
            Some("AA:BB:CC:DD:EE:FF".to_string())
        );
        assert_eq!(extract("not-a-mac"), None);
    }
}
