//! AM43 blind-drive motor: a cover with position control plus battery and
//! illuminance sensors.
//!
//! Keeps the connection open. In standby the full state is republished every
//! five minutes; while the blind moves, the position is polled every five
//! seconds until it reaches the target.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info, warn};
use serde_json::json;
use uuid::Uuid;

use crate::ble::backend::AddressType;
use crate::config::DeviceEntry;
use crate::devices::entities::{
    EntityDesc, EntityDomain, EntityMap, SET_POSITION_POSTFIX, SET_POSTFIX, split_command_topic,
};
use crate::devices::{
    ConnectionMode, Device, DeviceCore, DeviceSpec, resolve_connection_mode,
};
use crate::error::{BridgeError, Result};
use crate::mqtt::DevicePublisher;
use crate::protocols::CharacteristicSink;
use crate::protocols::am43::Am43Protocol;
use crate::protocols::queue::CommandQueue;

pub const DEVICE_TYPE: &str = "am43";

const BLINDS_CONTROL: Uuid = Uuid::from_u128(0x0000fe51_0000_1000_8000_00805f9b34fb);

const COVER_ENTITY: &str = "cover";
const BATTERY_ENTITY: &str = "battery";
const ILLUMINANCE_ENTITY: &str = "illuminance";

const CLOSED_POSITION: u8 = 0;
const OPEN_POSITION: u8 = 100;

const SEND_DATA_PERIOD: u64 = 5;
/// Five minutes between full-state publishes in standby.
const STANDBY_PERIOD_MULTIPLIER: u64 = 60;

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("Blind"),
    supports_passive: false,
    supports_active: true,
    active_mode: ConnectionMode::ActiveKeepConnection,
    drops_connection: false,
    address_type: AddressType::Public,
    reconnection_interval: Duration::from_secs(60),
    active_interval: Duration::from_secs(1),
    passive_interval: Duration::from_secs(60),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoverRunState {
    Open,
    Opening,
    #[default]
    Closed,
    Closing,
    Stopped,
}

impl CoverRunState {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Opening => "opening",
            Self::Closed => "closed",
            Self::Closing => "closing",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Am43State {
    battery: Option<u8>,
    position: u8,
    illuminance: f64,
    run_state: CoverRunState,
    target_position: Option<u8>,
}

pub struct Am43Cover {
    core: DeviceCore,
    protocol: std::sync::Mutex<Option<Am43Protocol>>,
    state: std::sync::Mutex<Am43State>,
    initial_state_sent: AtomicBool,
}

impl Am43Cover {
    pub fn from_config(entry: &DeviceEntry) -> Result<Self> {
        let mode = resolve_connection_mode(&SPEC, entry.passive)?;
        Ok(Self {
            core: DeviceCore::new(
                &entry.address,
                SPEC.address_type,
                entry.friendly_name.clone(),
                mode,
            )?
                .with_failures_limit(entry.connection_failures_limit),
            protocol: std::sync::Mutex::new(None),
            state: std::sync::Mutex::new(Am43State::default()),
            initial_state_sent: AtomicBool::new(false),
        })
    }

    fn protocol(&self) -> Result<Am43Protocol> {
        self.protocol
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))
    }

    fn is_moving(&self) -> bool {
        matches!(
            self.state.lock().unwrap().run_state,
            CoverRunState::Opening | CoverRunState::Closing
        )
    }

    async fn update_full_state(&self) -> Result<()> {
        let protocol = self.protocol()?;
        let position = protocol.get_position().await?;
        let battery = protocol.get_battery().await?;
        let illuminance = protocol.get_illuminance().await?;
        let mut state = self.state.lock().unwrap();
        state.position = position;
        state.battery = Some(battery);
        state.illuminance = illuminance;
        Ok(())
    }

    /// Poll the position while moving; settle the run state when a terminal
    /// position is reached.
    async fn update_running_state(&self) -> Result<()> {
        let position = self.protocol()?.get_position().await?;
        let mut state = self.state.lock().unwrap();
        state.position = position;
        if position == CLOSED_POSITION {
            debug!("[{}] minimum position reached, set to closed", self.core.mac());
            state.run_state = CoverRunState::Closed;
            state.target_position = None;
        } else if position == OPEN_POSITION {
            debug!("[{}] maximum position reached, set to open", self.core.mac());
            state.run_state = CoverRunState::Open;
            state.target_position = None;
        } else if let Some(target) = state.target_position {
            if position == target {
                state.run_state = CoverRunState::Stopped;
                state.target_position = None;
            }
        }
        Ok(())
    }

    async fn notify_state(&self, publisher: &DevicePublisher) {
        let state = *self.state.lock().unwrap();
        let mut sensors = json!({});
        if let Some(battery) = state.battery {
            sensors[BATTERY_ENTITY] = json!(battery);
        }
        sensors[ILLUMINANCE_ENTITY] = json!(state.illuminance);
        if let Some(lqi) = self.core.linkquality() {
            sensors["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={sensors}", self.label());
        publisher
            .publish_state(&self.core, "", &sensors.to_string())
            .await;

        let cover = json!({
            "state": state.run_state.as_str(),
            "position": state.position,
        });
        publisher
            .publish_state(&self.core, COVER_ENTITY, &cover.to_string())
            .await;
        self.initial_state_sent.store(true, Ordering::SeqCst);
    }

    async fn start_movement(&self, target: u8) -> Result<()> {
        self.protocol()?.set_position(target).await?;
        let mut state = self.state.lock().unwrap();
        state.target_position = Some(target);
        state.run_state = if state.position > target {
            CoverRunState::Closing
        } else if state.position < target {
            CoverRunState::Opening
        } else if target == OPEN_POSITION {
            CoverRunState::Open
        } else if target == CLOSED_POSITION {
            CoverRunState::Closed
        } else {
            CoverRunState::Stopped
        };
        Ok(())
    }

    async fn stop_movement(&self) -> Result<()> {
        self.protocol()?.stop().await?;
        let mut state = self.state.lock().unwrap();
        state.run_state = CoverRunState::Stopped;
        state.target_position = None;
        Ok(())
    }
}

#[async_trait]
impl Device for Am43Cover {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![
            (
                EntityDomain::Cover,
                vec![EntityDesc {
                    name: COVER_ENTITY,
                    topic: Some(COVER_ENTITY),
                    device_class: Some("shade"),
                    ..Default::default()
                }],
            ),
            (
                EntityDomain::Sensor,
                vec![
                    EntityDesc {
                        name: BATTERY_ENTITY,
                        device_class: Some("battery"),
                        unit: Some("%"),
                        entity_category: Some("diagnostic"),
                        ..Default::default()
                    },
                    EntityDesc {
                        name: ILLUMINANCE_ENTITY,
                        device_class: Some("illuminance"),
                        unit: Some("lx"),
                        ..Default::default()
                    },
                ],
            ),
        ]
    }

    async fn get_device_data(&self) -> Result<()> {
        let client = self
            .core
            .client()
            .await
            .ok_or_else(|| BridgeError::Transport("no active connection".to_string()))?;
        let notifications = client.start_notify(BLINDS_CONTROL).await?;
        let sink = Arc::new(CharacteristicSink::new(client, BLINDS_CONTROL, true));
        let protocol = Am43Protocol::new(CommandQueue::spawn(sink, notifications));
        *self.protocol.lock().unwrap() = Some(protocol);

        self.core.set_model("AM43".to_string());
        self.initial_state_sent.store(false, Ordering::SeqCst);
        self.update_full_state().await
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        let mut timer = 0u64;
        loop {
            publisher.update_device_data(self).await?;

            let moving = self.is_moving();
            let multiplier = if moving { 1 } else { STANDBY_PERIOD_MULTIPLIER };
            timer += 1;
            if !self.initial_state_sent.load(Ordering::SeqCst)
                || timer >= SEND_DATA_PERIOD * multiplier
            {
                if moving {
                    self.update_running_state().await?;
                } else {
                    self.update_full_state().await?;
                }
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
            if entity != COVER_ENTITY {
                warn!("[{}] unexpected command topic {}", self.label(), message.topic);
                continue;
            }
            let value = message.value_str();
            let result = match action {
                Some(SET_POSTFIX) => {
                    info!("[{}] set cover to {value}", self.label());
                    match value.to_lowercase().as_str() {
                        "open" => self.start_movement(OPEN_POSITION).await,
                        "close" => self.start_movement(CLOSED_POSITION).await,
                        _ => self.stop_movement().await,
                    }
                }
                Some(SET_POSITION_POSTFIX) => match value.parse::<u8>() {
                    Ok(position) if position <= OPEN_POSITION => {
                        info!("[{}] set position to {position}", self.label());
                        self.start_movement(position).await
                    }
                    _ => {
                        warn!("[{}] incorrect position value '{value}'", self.label());
                        continue;
                    }
                },
                _ => {
                    warn!("[{}] unknown action on {}", self.label(), message.topic);
                    continue;
                }
            };
            match result {
                Ok(()) => self.notify_state(publisher).await,
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

    fn entry() -> DeviceEntry {
        DeviceEntry {
            device_type: DEVICE_TYPE.to_string(),
            address: "11:22:33:44:55:66".to_string(),
            friendly_name: Some("bedroom".to_string()),
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        }
    }

    #[test]
    fn subscribes_to_both_cover_command_topics() {
        let cover = Am43Cover::from_config(&entry()).unwrap();
        assert_eq!(
            cover.subscribed_topics(),
            vec![
                "0x112233445566/cover/set".to_string(),
                "0x112233445566/cover/set_position".to_string(),
            ]
        );
    }

    #[test]
    fn label_includes_friendly_name() {
        let cover = Am43Cover::from_config(&entry()).unwrap();
        cover.core().set_model("AM43".to_string());
        assert_eq!(cover.label(), "Blind_AM43_bedroom");
    }
}
