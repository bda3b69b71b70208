//! Xiaomi LYWSD03MMC temperature/humidity sensor running the ATC custom
//! firmware. Passive only: readings are decoded straight from the
//! Environmental Sensing service data in its advertisements.

use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;

use crate::ble::backend::AddressType;
use crate::ble::scanner::Advertisement;
use crate::ble::uuids::UUID_ENVIRONMENTAL_SENSING;
use crate::config::DeviceEntry;
use crate::devices::entities::{EntityDesc, EntityDomain, EntityMap};
use crate::devices::{
    ConnectionMode, Device, DeviceCore, DeviceSpec, resolve_connection_mode,
};
use crate::error::Result;
use crate::mqtt::DevicePublisher;

pub const DEVICE_TYPE: &str = "xiaomilywsd_atc";

const TEMPERATURE_ENTITY: &str = "temperature";
const HUMIDITY_ENTITY: &str = "humidity";
const BATTERY_ENTITY: &str = "battery";

/// Custom-format frames carry centi-units in little endian.
const CUSTOM_FRAME_LEN: usize = 15;
/// Stock ATC frames carry deci-degrees in big endian.
const STOCK_FRAME_LEN: usize = 13;

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("Xiaomi"),
    supports_passive: true,
    supports_active: false,
    active_mode: ConnectionMode::Passive,
    drops_connection: false,
    address_type: AddressType::Public,
    reconnection_interval: Duration::from_secs(60),
    active_interval: Duration::from_secs(60),
    passive_interval: Duration::from_secs(60),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

#[derive(Debug, Clone, Copy, PartialEq)]
struct SensorState {
    temperature: f64,
    humidity: f64,
    battery: u8,
    /// The device sends the richer custom format; low-resolution stock
    /// frames are ignored once one was seen.
    sends_custom: bool,
}

fn decode_service_data(data: &[u8], had_custom: bool) -> Option<SensorState> {
    match data.len() {
        CUSTOM_FRAME_LEN => Some(SensorState {
            temperature: f64::from(i16::from_le_bytes([data[6], data[7]])) / 100.0,
            humidity: f64::from(u16::from_le_bytes([data[8], data[9]])) / 100.0,
            battery: data[12],
            sends_custom: true,
        }),
        STOCK_FRAME_LEN => {
            if had_custom {
                // Low-resolution duplicate of a custom frame.
                return None;
            }
            Some(SensorState {
                temperature: f64::from(i16::from_be_bytes([data[6], data[7]])) / 10.0,
                humidity: f64::from(data[8]),
                battery: data[9],
                sends_custom: false,
            })
        }
        _ => None,
    }
}

pub struct AtcSensor {
    core: DeviceCore,
    state: std::sync::Mutex<Option<SensorState>>,
}

impl AtcSensor {
    pub fn from_config(entry: &DeviceEntry) -> Result<Self> {
        let mode = resolve_connection_mode(&SPEC, entry.passive)?;
        let core = DeviceCore::new(
            &entry.address,
            SPEC.address_type,
            entry.friendly_name.clone(),
            mode,
        )?
        .with_failures_limit(entry.connection_failures_limit);
        core.set_model("LYWSD03MMC".to_string());
        Ok(Self {
            core,
            state: std::sync::Mutex::new(None),
        })
    }

    async fn notify_state(&self, publisher: &DevicePublisher) {
        let Some(state) = *self.state.lock().unwrap() else {
            return;
        };
        let mut payload = json!({
            TEMPERATURE_ENTITY: state.temperature,
            HUMIDITY_ENTITY: state.humidity,
            BATTERY_ENTITY: state.battery,
        });
        if let Some(lqi) = self.core.linkquality() {
            payload["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={payload}", self.label());
        publisher
            .publish_state(&self.core, "", &payload.to_string())
            .await;
    }
}

#[async_trait]
impl Device for AtcSensor {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![(
            EntityDomain::Sensor,
            vec![
                EntityDesc {
                    name: TEMPERATURE_ENTITY,
                    device_class: Some("temperature"),
                    unit: Some("\u{b0}C"),
                    ..Default::default()
                },
                EntityDesc {
                    name: HUMIDITY_ENTITY,
                    device_class: Some("humidity"),
                    unit: Some("%"),
                    ..Default::default()
                },
                EntityDesc {
                    name: BATTERY_ENTITY,
                    device_class: Some("battery"),
                    unit: Some("%"),
                    entity_category: Some("diagnostic"),
                    ..Default::default()
                },
            ],
        )]
    }

    fn handle_advert(&self, advertisement: &Advertisement) {
        let Some(data) = advertisement.service_data(UUID_ENVIRONMENTAL_SENSING) else {
            return;
        };
        let mut state = self.state.lock().unwrap();
        let had_custom = state.map(|s| s.sends_custom).unwrap_or(false);
        if let Some(decoded) = decode_service_data(data, had_custom) {
            debug!("[{}] advert decoded: {decoded:?}", self.core.mac());
            *state = Some(decoded);
        }
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        loop {
            if self.state.lock().unwrap().is_none() {
                tokio::time::sleep(SPEC.not_ready_interval).await;
                continue;
            }
            publisher.update_device_data(self).await?;
            self.notify_state(publisher).await;
            tokio::time::sleep(SPEC.passive_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn custom_frame_is_decoded_in_centi_units() {
        // e6 6f b9 38 c1 a4 | 95 09 | ff 08 | 7e 0c | 64 | e0 04
        let data = [
            0xe6, 0x6f, 0xb9, 0x38, 0xc1, 0xa4, 0x95, 0x09, 0xff, 0x08, 0x7e, 0x0c, 0x64, 0xe0,
            0x04,
        ];
        let state = decode_service_data(&data, false).unwrap();
        assert_eq!(state.temperature, 24.53);
        assert_eq!(state.humidity, 23.03);
        assert_eq!(state.battery, 0x64);
        assert!(state.sends_custom);
    }

    #[test]
    fn stock_frame_is_decoded_in_deci_degrees() {
        // a4 c1 38 84 7e 97 | 01 26 | 15 | 50 | 0b 73 17
        let data = [
            0xa4, 0xc1, 0x38, 0x84, 0x7e, 0x97, 0x01, 0x26, 0x15, 0x50, 0x0b, 0x73, 0x17,
        ];
        let state = decode_service_data(&data, false).unwrap();
        assert_eq!(state.temperature, 29.4);
        assert_eq!(state.humidity, 21.0);
        assert_eq!(state.battery, 0x50);
        assert!(!state.sends_custom);
    }

    #[test]
    fn stock_frames_are_ignored_after_a_custom_frame() {
        let data = [
            0xa4, 0xc1, 0x38, 0x84, 0x7e, 0x97, 0x01, 0x26, 0x15, 0x50, 0x0b, 0x73, 0x17,
        ];
        assert!(decode_service_data(&data, true).is_none());
    }

    #[test]
    fn negative_temperatures_decode() {
        let mut data = [0u8; 15];
        data[6..8].copy_from_slice(&(-520i16).to_le_bytes());
        data[8..10].copy_from_slice(&4500u16.to_le_bytes());
        data[12] = 77;
        let state = decode_service_data(&data, false).unwrap();
        assert_eq!(state.temperature, -5.2);
        assert_eq!(state.humidity, 45.0);
        assert_eq!(state.battery, 77);
    }

    #[test]
    fn garbage_lengths_are_ignored() {
        assert!(decode_service_data(&[0u8; 7], false).is_none());
        assert!(decode_service_data(&[], false).is_none());
    }

    #[test]
    fn defaults_to_passive_mode() {
        let entry = DeviceEntry {
            device_type: DEVICE_TYPE.to_string(),
            address: "a4:c1:38:00:11:22".to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        };
        let sensor = AtcSensor::from_config(&entry).unwrap();
        assert_eq!(sensor.core().connection_mode(), ConnectionMode::Passive);
        assert!(sensor.subscribed_topics().is_empty());
    }
}
