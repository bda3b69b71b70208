//! Home Assistant MQTT discovery payloads.
//!
//! Called once per successful connect/init cycle; builds the retained
//! `homeassistant/{domain}/.../config` documents for every entity a device
//! exposes, plus the implicit linkquality diagnostic sensor.

use log::debug;
use serde_json::{Value, json};

use crate::devices::Device;
use crate::devices::entities::{
    EntityDesc, EntityDomain, EntityMap, SET_MODE_POSTFIX, SET_POSITION_POSTFIX, SET_POSTFIX,
    SET_TARGET_TEMPERATURE_POSTFIX, entity_state_topic, join_topic,
};
use crate::error::Result;
use crate::mqtt::session::{MqttPublisher, QosLevel};

const CONFIG_MQTT_NAMESPACE: &str = "homeassistant";

pub struct DiscoveryPublisher {
    base_topic: String,
    /// Prefix for config object ids, to avoid interfering with other BLE
    /// bridges publishing discovery for the same hardware.
    config_prefix: String,
    /// Fully-qualified bridge availability topic.
    bridge_availability_topic: String,
}

impl DiscoveryPublisher {
    pub fn new(
        base_topic: String,
        config_prefix: String,
        bridge_availability_topic: String,
    ) -> Self {
        Self {
            base_topic,
            config_prefix,
            bridge_availability_topic,
        }
    }

    fn config_topic(&self, domain: EntityDomain, dev_id: &str, entity_name: &str) -> String {
        join_topic([
            CONFIG_MQTT_NAMESPACE,
            domain.as_str(),
            &format!("{}{}", self.config_prefix, dev_id),
            entity_name,
            "config",
        ])
    }

    fn full_state_topic(&self, device: &dyn Device, entity: &EntityDesc) -> String {
        join_topic([
            self.base_topic.as_str(),
            &entity_state_topic(&device.core().unique_id(), entity),
        ])
    }

    fn device_info(&self, device: &dyn Device) -> Value {
        let core = device.core();
        let mut info = json!({
            "identifiers": [core.unique_id()],
            "name": device.label(),
            "model": core.model(),
        });
        if let Some(manufacturer) = device.spec().manufacturer {
            info["manufacturer"] = json!(manufacturer);
        }
        if let Some(version) = core.version() {
            info["sw_version"] = json!(version);
        }
        info
    }

    fn generic_vals(&self, device: &dyn Device, entity: &EntityDesc) -> Value {
        let core = device.core();
        let mut vals = json!({
            "name": format!("{}_{}", entity.name, core.friendly_id()),
            "unique_id": format!("{}_{}", entity.name, core.dev_id()),
            "device": self.device_info(device),
            "availability_mode": "all",
            "availability": [
                {"topic": self.bridge_availability_topic},
                {"topic": join_topic([
                    self.base_topic.as_str(),
                    &core.availability_topic(),
                ])},
            ],
        });
        if let Some(icon) = entity.icon {
            vals["icon"] = json!(format!("mdi:{icon}"));
        }
        if let Some(device_class) = entity.device_class {
            vals["device_class"] = json!(device_class);
        }
        if let Some(unit) = entity.unit {
            vals["unit_of_measurement"] = json!(unit);
        }
        if let Some(category) = entity.entity_category {
            vals["entity_category"] = json!(category);
        }
        vals
    }

    fn entity_config(
        &self,
        device: &dyn Device,
        domain: EntityDomain,
        entity: &EntityDesc,
    ) -> Value {
        let mut config = self.generic_vals(device, entity);
        let state_topic = self.full_state_topic(device, entity);
        match domain {
            EntityDomain::Sensor | EntityDomain::BinarySensor | EntityDomain::DeviceTracker => {
                if let Some(main_value) = entity.main_value {
                    config["json_attributes_topic"] = json!(state_topic);
                    config["value_template"] = json!(format!("{{{{ value_json.{main_value} }}}}"));
                } else {
                    config["value_template"] =
                        json!(format!("{{{{ value_json.{} }}}}", entity.name));
                }
                config["state_topic"] = json!(state_topic);
                if domain == EntityDomain::DeviceTracker {
                    config["source_type"] = json!("bluetooth_le");
                }
            }
            EntityDomain::Switch | EntityDomain::Select => {
                config["state_topic"] = json!(state_topic);
                config["command_topic"] = json!(join_topic([state_topic.as_str(), SET_POSTFIX]));
            }
            EntityDomain::Light => {
                config["schema"] = json!("json");
                config["brightness"] = json!(true);
                config["state_topic"] = json!(state_topic);
                config["command_topic"] = json!(join_topic([state_topic.as_str(), SET_POSTFIX]));
            }
            EntityDomain::Cover => {
                config["state_topic"] = json!(state_topic);
                config["position_topic"] = json!(state_topic);
                config["json_attributes_topic"] = json!(state_topic);
                config["value_template"] = json!("{{ value_json.state }}");
                config["position_template"] = json!("{{ value_json.position }}");
                config["command_topic"] = json!(join_topic([state_topic.as_str(), SET_POSTFIX]));
                config["set_position_topic"] =
                    json!(join_topic([state_topic.as_str(), SET_POSITION_POSTFIX]));
            }
            EntityDomain::Climate => {
                config["current_temperature_topic"] = json!(state_topic);
                config["current_temperature_template"] = json!("{{ value_json.temperature }}");
                config["mode_state_topic"] = json!(state_topic);
                config["mode_state_template"] = json!("{{ value_json.mode }}");
                config["mode_command_topic"] =
                    json!(join_topic([state_topic.as_str(), SET_MODE_POSTFIX]));
                config["temperature_state_topic"] = json!(state_topic);
                config["temperature_state_template"] =
                    json!("{{ value_json.target_temperature }}");
                config["temperature_command_topic"] = json!(join_topic([
                    state_topic.as_str(),
                    SET_TARGET_TEMPERATURE_POSTFIX
                ]));
                config["json_attributes_topic"] = json!(state_topic);
                config["temp_step"] = json!(0.5);
            }
        }
        config
    }

    /// Publish the retained discovery config for every entity of `device`.
    pub async fn send_device_config(
        &self,
        mqtt: &dyn MqttPublisher,
        device: &dyn Device,
    ) -> Result<()> {
        let dev_id = device.core().dev_id();
        for (domain, entities) in entities_with_linkquality(device) {
            for entity in entities {
                let topic = self.config_topic(domain, &dev_id, entity.name);
                let payload = self.entity_config(device, domain, &entity);
                debug!("publish config topic={topic}: {payload}");
                mqtt.publish(
                    &topic,
                    payload.to_string().as_bytes(),
                    QosLevel::AtLeastOnce,
                    true,
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Every device carries a linkquality diagnostic sensor derived from RSSI.
pub fn entities_with_linkquality(device: &dyn Device) -> EntityMap {
    let mut entities = device.entities();
    let linkquality = EntityDesc {
        name: "linkquality",
        unit: Some("lqi"),
        icon: Some("signal"),
        entity_category: Some("diagnostic"),
        ..Default::default()
    };
    if let Some((_, sensors)) = entities
        .iter_mut()
        .find(|(domain, _)| *domain == EntityDomain::Sensor)
    {
        sensors.push(linkquality);
    } else {
        entities.push((EntityDomain::Sensor, vec![linkquality]));
    }
    entities
}
