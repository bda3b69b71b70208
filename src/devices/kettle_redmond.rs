//! Redmond G200-series smart kettle (RK-G200S and siblings).
//!
//! Holds the connection open, authenticates with the configured pairing
//! key, polls the run state (fast while boiling, slow in standby) and
//! accepts a boil switch command.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::ble::backend::AddressType;
use crate::ble::uuids::UUID_DEVICE_NAME;
use crate::config::DeviceEntry;
use crate::devices::entities::{
    EntityDesc, EntityDomain, EntityMap, SET_POSTFIX, split_command_topic,
};
use crate::devices::{
    ConnectionMode, Device, DeviceCore, DeviceSpec, resolve_connection_mode,
};
use crate::error::{BridgeError, Result};
use crate::mqtt::DevicePublisher;
use crate::protocols::queue::CommandQueue;
use crate::protocols::redmond::{KettleMode, KettleState, RedmondProtocol, RunState};
use crate::protocols::CharacteristicSink;

pub const DEVICE_TYPE: &str = "redmond200";

const UUID_NORDIC_TX: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
const UUID_NORDIC_RX: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

const BOIL_ENTITY: &str = "boil";
const TEMPERATURE_ENTITY: &str = "temperature";

/// Seconds between state publishes while boiling.
const SEND_DATA_PERIOD: u64 = 5;
/// Standby publishes every SEND_DATA_PERIOD * this.
const STANDBY_PERIOD_MULTIPLIER: u64 = 12;

const DEFAULT_KEY: &str = "ffffffffffffffff";

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("Redmond"),
    supports_passive: false,
    supports_active: true,
    active_mode: ConnectionMode::ActiveKeepConnection,
    drops_connection: false,
    address_type: AddressType::Random,
    reconnection_interval: Duration::from_secs(30),
    active_interval: Duration::from_secs(1),
    passive_interval: Duration::from_secs(60),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

pub struct KettleRedmond {
    core: DeviceCore,
    key: [u8; 8],
    protocol: std::sync::Mutex<Option<RedmondProtocol>>,
    state: std::sync::Mutex<Option<KettleState>>,
    initial_state_sent: AtomicBool,
}

impl KettleRedmond {
    pub fn from_config(entry: &DeviceEntry) -> Result<Self> {
        let key_hex = entry.key.as_deref().unwrap_or(DEFAULT_KEY);
        let key = parse_key(key_hex)?;
        let mode = resolve_connection_mode(&SPEC, entry.passive)?;
        Ok(Self {
            core: DeviceCore::new(
                &entry.address,
                SPEC.address_type,
                entry.friendly_name.clone(),
                mode,
            )?
                .with_failures_limit(entry.connection_failures_limit),
            key,
            protocol: std::sync::Mutex::new(None),
            state: std::sync::Mutex::new(None),
            initial_state_sent: AtomicBool::new(false),
        })
    }

    fn protocol(&self) -> Result<RedmondProtocol> {
        self.protocol
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))
    }

    fn period_multiplier(state: Option<KettleState>) -> u64 {
        match state {
            Some(state)
                if state.state == RunState::On
                    && matches!(state.mode, KettleMode::Boil | KettleMode::Heat) =>
            {
                1
            }
            _ => STANDBY_PERIOD_MULTIPLIER,
        }
    }

    async fn notify_state(&self, publisher: &DevicePublisher) {
        let Some(state) = *self.state.lock().unwrap() else {
            return;
        };
        let mut payload = json!({ TEMPERATURE_ENTITY: state.temperature });
        if let Some(lqi) = self.core.linkquality() {
            payload["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={payload}", self.label());
        publisher
            .publish_state(&self.core, "", &payload.to_string())
            .await;

        let boiling = state.state == RunState::On;
        publisher
            .publish_state(&self.core, BOIL_ENTITY, if boiling { "ON" } else { "OFF" })
            .await;
        self.initial_state_sent.store(true, Ordering::SeqCst);
    }

    async fn refresh_state(&self) -> Result<()> {
        let state = self.protocol()?.get_mode().await?;
        *self.state.lock().unwrap() = Some(state);
        Ok(())
    }
}

fn parse_key(key_hex: &str) -> Result<[u8; 8]> {
    let bytes: Option<Vec<u8>> = (key_hex.len() == 16)
        .then(|| {
            (0..8)
                .map(|i| u8::from_str_radix(&key_hex[i * 2..i * 2 + 2], 16).ok())
                .collect()
        })
        .flatten();
    bytes
        .and_then(|b| <[u8; 8]>::try_from(b).ok())
        .ok_or_else(|| {
            BridgeError::Config(format!(
                "kettle key must be 16 hex characters, got '{key_hex}'"
            ))
        })
}

#[async_trait]
impl Device for KettleRedmond {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![
            (
                EntityDomain::Switch,
                vec![EntityDesc {
                    name: BOIL_ENTITY,
                    topic: Some(BOIL_ENTITY),
                    icon: Some("kettle"),
                    ..Default::default()
                }],
            ),
            (
                EntityDomain::Sensor,
                vec![EntityDesc {
                    name: TEMPERATURE_ENTITY,
                    device_class: Some("temperature"),
                    unit: Some("\u{b0}C"),
                    ..Default::default()
                }],
            ),
        ]
    }

    async fn get_device_data(&self) -> Result<()> {
        let client = self
            .core
            .client()
            .await
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))?;

        // The R4S module only starts notifying after this magic write.
        client
            .write_characteristic(UUID_NORDIC_TX, &[0x01, 0x00], true)
            .await?;
        let notifications = client.start_notify(UUID_NORDIC_RX).await?;
        let sink = Arc::new(CharacteristicSink::new(
            client.clone(),
            UUID_NORDIC_TX,
            true,
        ));
        let protocol = RedmondProtocol::new(CommandQueue::spawn(sink, notifications));
        // Stored before auth so close() can always stop the queue worker,
        // even when initialization fails halfway.
        *self.protocol.lock().unwrap() = Some(protocol.clone());

        protocol.login(&self.key).await?;

        match client.read_characteristic(UUID_DEVICE_NAME).await {
            Ok(name) => self
                .core
                .set_model(String::from_utf8_lossy(&name).trim_end_matches('\0').to_string()),
            // Some platforms refuse access to the generic access service.
            Err(_) => self.core.set_model("G200S".to_string()),
        }
        let (major, minor) = protocol.get_version().await?;
        self.core.set_version(format!("{major}.{minor}"));

        let state = protocol.get_mode().await?;
        *self.state.lock().unwrap() = Some(state);
        self.initial_state_sent.store(false, Ordering::SeqCst);

        protocol.set_time().await?;
        Ok(())
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        let mut timer = 0u64;
        loop {
            publisher.update_device_data(self).await?;

            let multiplier = Self::period_multiplier(*self.state.lock().unwrap());
            timer += 1;
            if !self.initial_state_sent.load(Ordering::SeqCst)
                || timer >= SEND_DATA_PERIOD * multiplier
            {
                self.refresh_state().await?;
                self.notify_state(publisher).await;
                timer = 0;
            }
            tokio::time::sleep(SPEC.active_interval).await;
        }
    }

    async fn handle_messages(&self, publisher: &DevicePublisher) -> Result<()> {
        loop {
            let Some(message) = self.core.next_message().await else {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            };
            let (entity, action) = split_command_topic(&self.core.unique_id(), &message.topic);
            if entity != BOIL_ENTITY || action != Some(SET_POSTFIX) {
                warn!("[{}] unexpected command topic {}", self.label(), message.topic);
                continue;
            }
            let value = message.value_str();
            let turn_on = matches!(value.to_uppercase().as_str(), "ON" | "1" | "TRUE" | "YES");
            info!("[{}] set {BOIL_ENTITY} to {value}", self.label());

            let protocol = self.protocol()?;
            let result = if turn_on {
                protocol.run().await
            } else {
                protocol.stop().await
            };
            match result {
                Ok(()) => {
                    self.refresh_state().await?;
                    self.notify_state(publisher).await;
                }
                Err(BridgeError::Protocol(err)) => {
                    warn!("[{}] command failed: {err}", self.label());
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn close(&self) {
        if let Some(protocol) = self.protocol.lock().unwrap().take() {
            protocol.shutdown();
        }
        self.core.close_client().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(key: Option<&str>) -> DeviceEntry {
        DeviceEntry {
            device_type: DEVICE_TYPE.to_string(),
            address: "aa:bb:cc:dd:ee:ff".to_string(),
            friendly_name: None,
            key: key.map(str::to_string),
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        }
    }

    #[test]
    fn key_parsing() {
        assert_eq!(parse_key("ffffffffffffffff").unwrap(), [0xff; 8]);
        assert_eq!(
            parse_key("0011223344556677").unwrap(),
            [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77]
        );
        assert!(parse_key("ffff").is_err());
        assert!(parse_key("zzzzzzzzzzzzzzzz").is_err());
    }

    #[test]
    fn builds_with_default_key_and_keep_connection_mode() {
        let kettle = KettleRedmond::from_config(&entry(None)).unwrap();
        assert_eq!(kettle.key, [0xff; 8]);
        assert_eq!(
            kettle.core().connection_mode(),
            ConnectionMode::ActiveKeepConnection
        );
        assert_eq!(
            kettle.subscribed_topics(),
            vec!["0xaabbccddeeff/boil/set".to_string()]
        );
    }

    #[test]
    fn passive_mode_is_rejected() {
        let mut e = entry(None);
        e.passive = Some(true);
        assert!(KettleRedmond::from_config(&e).is_err());
    }

    #[test]
    fn boiling_state_speeds_up_publishing() {
        let boiling = KettleState {
            state: RunState::On,
            mode: KettleMode::Boil,
            ..Default::default()
        };
        assert_eq!(KettleRedmond::period_multiplier(Some(boiling)), 1);

        let standby = KettleState::default();
        assert_eq!(
            KettleRedmond::period_multiplier(Some(standby)),
            STANDBY_PERIOD_MULTIPLIER
        );
        assert_eq!(
            KettleRedmond::period_multiplier(None),
            STANDBY_PERIOD_MULTIPLIER
        );
    }
}
