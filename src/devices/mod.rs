//! Device model: per-type policy, shared runtime state, the `Device` trait
//! implemented by every supported peripheral, and the factory that builds
//! devices from configuration entries.

pub mod coffee_ecam;
pub mod cover_am43;
pub mod entities;
pub mod kettle_redmond;
pub mod presence;
pub mod sensor_atc;
pub mod wheel_inmotion;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::warn;
use tokio::sync::{Mutex, mpsc};

use crate::ble::backend::{AddressType, BleClient};
use crate::ble::scanner::Advertisement;
use crate::config::DeviceEntry;
use crate::error::{BridgeError, Result};
use crate::mqtt::DevicePublisher;
use crate::utils::{Event, normalize_mac};
use entities::{EntityMap, InboundMessage};

const MESSAGE_QUEUE_DEPTH: usize = 32;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Policy governing whether and how long a device holds an open connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionMode {
    Passive,
    ActivePollWithDisconnect,
    ActiveKeepConnection,
    OnDemand,
}

impl ConnectionMode {
    /// True for modes that keep a connection open; only these publish
    /// `availability=false` on every teardown.
    pub fn holds_connection(&self) -> bool {
        matches!(self, Self::Passive | Self::ActiveKeepConnection)
    }
}

/// Static per-type policy. One value per device type, fixed at compile time
/// apart from the per-device failures limit override.
#[derive(Debug, Clone)]
pub struct DeviceSpec {
    pub device_type: &'static str,
    pub manufacturer: Option<&'static str>,
    pub supports_passive: bool,
    pub supports_active: bool,
    pub active_mode: ConnectionMode,
    /// The device drops the connection itself after data is read; the
    /// supervisor must not treat that as an error and must skip the
    /// disconnect watcher.
    pub drops_connection: bool,
    pub address_type: AddressType,
    pub reconnection_interval: Duration,
    pub active_interval: Duration,
    pub passive_interval: Duration,
    /// Sleep while connected but no state has been decoded yet.
    pub not_ready_interval: Duration,
    pub connection_failures_limit: u32,
}

/// Identity and runtime state shared by every device type. Mutated by the
/// supervisor (connection state), the scanner (advertisements, RSSI) and
/// the message router (inbound queue).
pub struct DeviceCore {
    mac: String,
    address_type: AddressType,
    friendly_name: Option<String>,
    connection_mode: ConnectionMode,
    client: Mutex<Option<Arc<dyn BleClient>>>,
    connected: Event,
    disconnected: Event,
    advertisement_seen: Event,
    rssi: std::sync::Mutex<Option<i16>>,
    last_advertisement: std::sync::Mutex<Option<std::time::Instant>>,
    model: std::sync::Mutex<Option<String>>,
    version: std::sync::Mutex<Option<String>>,
    config_sent: AtomicBool,
    failures_limit_override: Option<u32>,
    message_tx: mpsc::Sender<InboundMessage>,
    message_rx: Mutex<mpsc::Receiver<InboundMessage>>,
}

impl std::fmt::Debug for DeviceCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCore")
            .field("mac", &self.mac)
            .field("address_type", &self.address_type)
            .field("friendly_name", &self.friendly_name)
            .field("connection_mode", &self.connection_mode)
            .finish_non_exhaustive()
    }
}

impl DeviceCore {
    pub fn new(
        mac: &str,
        address_type: AddressType,
        friendly_name: Option<String>,
        connection_mode: ConnectionMode,
    ) -> Result<Self> {
        let mac = normalize_mac(mac)
            .ok_or_else(|| BridgeError::Config(format!("invalid MAC address '{mac}'")))?;
        let (message_tx, message_rx) = mpsc::channel(MESSAGE_QUEUE_DEPTH);
        Ok(Self {
            mac,
            address_type,
            friendly_name,
            connection_mode,
            client: Mutex::new(None),
            connected: Event::new(),
            disconnected: Event::new(),
            advertisement_seen: Event::new(),
            rssi: std::sync::Mutex::new(None),
            last_advertisement: std::sync::Mutex::new(None),
            model: std::sync::Mutex::new(None),
            version: std::sync::Mutex::new(None),
            config_sent: AtomicBool::new(false),
            failures_limit_override: None,
            message_tx,
            message_rx: Mutex::new(message_rx),
        })
    }

    /// Apply the per-device override for the missing-device restart
    /// threshold.
    pub fn with_failures_limit(mut self, limit: Option<u32>) -> Self {
        self.failures_limit_override = limit;
        self
    }

    pub fn failures_limit_override(&self) -> Option<u32> {
        self.failures_limit_override
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }

    pub fn address_type(&self) -> AddressType {
        self.address_type
    }

    pub fn connection_mode(&self) -> ConnectionMode {
        self.connection_mode
    }

    pub fn is_passive(&self) -> bool {
        self.connection_mode == ConnectionMode::Passive
    }

    /// MAC without separators, lower case.
    pub fn dev_id(&self) -> String {
        self.mac.replace(':', "").to_lowercase()
    }

    /// Stable id used in topics. Based on the MAC only: names and models
    /// can change while running, topics must not.
    pub fn unique_id(&self) -> String {
        format!("0x{}", self.dev_id())
    }

    pub fn friendly_id(&self) -> String {
        self.friendly_name
            .clone()
            .unwrap_or_else(|| self.dev_id())
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/availability", self.unique_id())
    }

    pub async fn set_client(&self, client: Arc<dyn BleClient>) {
        *self.client.lock().await = Some(client);
        self.disconnected.clear();
        self.advertisement_seen.clear();
        self.connected.set();
    }

    pub async fn client(&self) -> Option<Arc<dyn BleClient>> {
        self.client.lock().await.clone()
    }

    pub fn connected_event(&self) -> &Event {
        &self.connected
    }

    pub fn disconnected_event(&self) -> &Event {
        &self.disconnected
    }

    pub fn advertisement_seen_event(&self) -> &Event {
        &self.advertisement_seen
    }

    pub fn is_connected(&self) -> bool {
        self.connected.is_set()
    }

    pub fn set_rssi(&self, rssi: i16) {
        *self.rssi.lock().unwrap() = Some(rssi);
    }

    pub fn rssi(&self) -> Option<i16> {
        *self.rssi.lock().unwrap()
    }

    pub fn linkquality(&self) -> Option<u8> {
        self.rssi().map(crate::utils::rssi_to_linkquality)
    }

    /// Called by the scanner for every matching sighting.
    pub fn mark_advertisement(&self) {
        *self.last_advertisement.lock().unwrap() = Some(std::time::Instant::now());
    }

    pub fn last_advertisement(&self) -> Option<std::time::Instant> {
        *self.last_advertisement.lock().unwrap()
    }

    pub fn set_model(&self, model: String) {
        *self.model.lock().unwrap() = Some(model);
    }

    pub fn model(&self) -> Option<String> {
        self.model.lock().unwrap().clone()
    }

    pub fn set_version(&self, version: String) {
        *self.version.lock().unwrap() = Some(version);
    }

    pub fn version(&self) -> Option<String> {
        self.version.lock().unwrap().clone()
    }

    pub fn config_sent(&self) -> bool {
        self.config_sent.load(Ordering::SeqCst)
    }

    pub fn set_config_sent(&self) {
        self.config_sent.store(true, Ordering::SeqCst);
    }

    /// Reset per-connection bookkeeping so discovery config and full state
    /// go out at least once after every reconnect.
    pub fn mark_connection_fresh(&self) {
        self.config_sent.store(false, Ordering::SeqCst);
    }

    /// Single producer: the fleet coordinator's message router.
    pub fn enqueue_message(&self, message: InboundMessage) -> bool {
        self.message_tx.try_send(message).is_ok()
    }

    /// Single consumer: this device's `handle_messages` loop.
    pub async fn next_message(&self) -> Option<InboundMessage> {
        self.message_rx.lock().await.recv().await
    }

    /// Release the BLE client handle if any. Idempotent and safe to call
    /// when never connected.
    pub async fn close_client(&self) {
        let client = self.client.lock().await.take();
        self.connected.clear();
        if let Some(client) = client {
            match tokio::time::timeout(CLOSE_TIMEOUT, client.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!("[{}] problem on disconnect: {err}", self.mac),
                Err(_) => warn!("[{}] disconnect timed out", self.mac),
            }
        }
        self.disconnected.set();
    }
}

/// One configured peripheral. Implementations own the vendor protocol and
/// the entity surface; the shared behavior lives in [`DeviceCore`].
#[async_trait]
pub trait Device: Send + Sync {
    fn core(&self) -> &DeviceCore;
    fn spec(&self) -> &DeviceSpec;
    fn entities(&self) -> EntityMap;

    /// One-time post-connect initialization: read identity characteristics,
    /// start notifications, run protocol auth. Failures are reported up,
    /// never retried here.
    async fn get_device_data(&self) -> Result<()> {
        Ok(())
    }

    /// The device's primary loop while connected. Runs only while the
    /// connection is live and is cancelled by the supervisor on teardown.
    async fn handle(&self, publisher: &DevicePublisher) -> Result<()>;

    /// Consume inbound command messages. Only spawned when the device has
    /// writable entities; the default keeps an idle tick so read-only
    /// devices that spawn it anyway stay cancellable.
    async fn handle_messages(&self, _publisher: &DevicePublisher) -> Result<()> {
        loop {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    /// Synchronous, non-blocking decode of one advertisement. Never does
    /// I/O; passive devices override it.
    fn handle_advert(&self, _advertisement: &Advertisement) {}

    /// Tear down protocol state and release the BLE client. Must be
    /// idempotent.
    async fn close(&self) {
        self.core().close_client().await;
    }

    /// Human-readable identifier used in logs and Home Assistant names.
    fn label(&self) -> String {
        let core = self.core();
        let mut parts: Vec<String> = Vec::new();
        if let Some(manufacturer) = self.spec().manufacturer {
            parts.push(manufacturer.to_string());
        }
        if let Some(model) = core.model() {
            parts.push(model);
        }
        parts.push(core.friendly_id());
        parts
            .into_iter()
            .map(|p| p.replace(' ', "_"))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// Command topics (relative to the base topic) this device listens on.
    fn subscribed_topics(&self) -> Vec<String> {
        entities::subscribed_topics(&self.core().unique_id(), &self.entities())
    }

    /// Missing-device threshold: configured override or the type default.
    fn connection_failures_limit(&self) -> u32 {
        self.core()
            .failures_limit_override()
            .unwrap_or(self.spec().connection_failures_limit)
    }
}

/// Resolve the connection mode from the type's capabilities and the
/// optional per-device `passive` override. Devices that support passive
/// operation default to it.
pub fn resolve_connection_mode(
    spec: &DeviceSpec,
    passive_override: Option<bool>,
) -> Result<ConnectionMode> {
    let passive = passive_override.unwrap_or(spec.supports_passive);
    if passive && !spec.supports_passive {
        return Err(BridgeError::Config(format!(
            "device type '{}' does not support passive mode",
            spec.device_type
        )));
    }
    if !passive && !spec.supports_active {
        return Err(BridgeError::Config(format!(
            "device type '{}' does not support active mode",
            spec.device_type
        )));
    }
    Ok(if passive {
        ConnectionMode::Passive
    } else {
        spec.active_mode
    })
}

/// Build a device from one configuration entry. An explicit type table, so
/// adding a device type is adding a line here.
pub fn create_device(entry: &DeviceEntry) -> Result<Arc<dyn Device>> {
    match entry.device_type.as_str() {
        kettle_redmond::DEVICE_TYPE => Ok(Arc::new(kettle_redmond::KettleRedmond::from_config(
            entry,
        )?)),
        cover_am43::DEVICE_TYPE => Ok(Arc::new(cover_am43::Am43Cover::from_config(entry)?)),
        coffee_ecam::DEVICE_TYPE => Ok(Arc::new(coffee_ecam::EcamMachine::from_config(entry)?)),
        wheel_inmotion::DEVICE_TYPE => {
            Ok(Arc::new(wheel_inmotion::InmotionWheel::from_config(entry)?))
        }
        sensor_atc::DEVICE_TYPE => Ok(Arc::new(sensor_atc::AtcSensor::from_config(entry)?)),
        presence::DEVICE_TYPE => Ok(Arc::new(presence::PresenceTracker::from_config(entry)?)),
        other => Err(BridgeError::Config(format!(
            "unknown device type '{other}'"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(passive: bool, active: bool) -> DeviceSpec {
        DeviceSpec {
            device_type: "test",
            manufacturer: None,
            supports_passive: passive,
            supports_active: active,
            active_mode: ConnectionMode::ActiveKeepConnection,
            drops_connection: false,
            address_type: AddressType::Public,
            reconnection_interval: Duration::from_secs(60),
            active_interval: Duration::from_secs(60),
            passive_interval: Duration::from_secs(60),
            not_ready_interval: Duration::from_secs(5),
            connection_failures_limit: 5,
        }
    }

    #[test]
    fn connection_mode_resolution() {
        // Passive-capable types default to passive.
        assert_eq!(
            resolve_connection_mode(&spec(true, true), None).unwrap(),
            ConnectionMode::Passive
        );
        assert_eq!(
            resolve_connection_mode(&spec(true, true), Some(false)).unwrap(),
            ConnectionMode::ActiveKeepConnection
        );
        assert_eq!(
            resolve_connection_mode(&spec(false, true), None).unwrap(),
            ConnectionMode::ActiveKeepConnection
        );
        assert!(resolve_connection_mode(&spec(false, true), Some(true)).is_err());
        assert!(resolve_connection_mode(&spec(true, false), Some(false)).is_err());
    }

    #[test]
    fn core_identity_derivation() {
        let core = DeviceCore::new(
            "aa:bb:cc:dd:ee:ff",
            AddressType::Public,
            None,
            ConnectionMode::Passive,
        )
        .unwrap();
        assert_eq!(core.mac(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(core.dev_id(), "aabbccddeeff");
        assert_eq!(core.unique_id(), "0xaabbccddeeff");
        assert_eq!(core.friendly_id(), "aabbccddeeff");
        assert_eq!(core.availability_topic(), "0xaabbccddeeff/availability");

        let named = DeviceCore::new(
            "aa:bb:cc:dd:ee:ff",
            AddressType::Public,
            Some("kitchen".to_string()),
            ConnectionMode::Passive,
        )
        .unwrap();
        assert_eq!(named.friendly_id(), "kitchen");
    }

    #[test]
    fn invalid_mac_is_a_config_error() {
        let err = DeviceCore::new(
            "not-a-mac",
            AddressType::Public,
            None,
            ConnectionMode::Passive,
        )
        .unwrap_err();
        assert!(matches!(err, BridgeError::Config(_)));
    }

    #[tokio::test]
    async fn close_client_is_idempotent_without_a_client() {
        let core = DeviceCore::new(
            "aa:bb:cc:dd:ee:ff",
            AddressType::Public,
            None,
            ConnectionMode::ActiveKeepConnection,
        )
        .unwrap();
        core.close_client().await;
        core.close_client().await;
        assert!(core.disconnected_event().is_set());
        assert!(!core.is_connected());
    }

    #[test]
    fn message_queue_is_bounded() {
        let core = DeviceCore::new(
            "aa:bb:cc:dd:ee:ff",
            AddressType::Public,
            None,
            ConnectionMode::ActiveKeepConnection,
        )
        .unwrap();
        let message = InboundMessage {
            topic: "0xaabbccddeeff/boil/set".to_string(),
            value: serde_json::Value::String("ON".to_string()),
        };
        for _ in 0..MESSAGE_QUEUE_DEPTH {
            assert!(core.enqueue_message(message.clone()));
        }
        assert!(!core.enqueue_message(message));
    }
}
