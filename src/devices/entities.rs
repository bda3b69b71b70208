//! Entity descriptors and the topic conventions derived from them.
//!
//! Topics follow `{base_topic}/{device.unique_id}/{entity}[/set]`; command
//! topics exist only for domains with writable entities.

pub const SET_POSTFIX: &str = "set";
pub const SET_POSITION_POSTFIX: &str = "set_position";
pub const SET_MODE_POSTFIX: &str = "set_mode";
pub const SET_TARGET_TEMPERATURE_POSTFIX: &str = "set_temperature";

/// Home Assistant entity classes a device may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityDomain {
    BinarySensor,
    Climate,
    Cover,
    DeviceTracker,
    Light,
    Select,
    Sensor,
    Switch,
}

impl EntityDomain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BinarySensor => "binary_sensor",
            Self::Climate => "climate",
            Self::Cover => "cover",
            Self::DeviceTracker => "device_tracker",
            Self::Light => "light",
            Self::Select => "select",
            Self::Sensor => "sensor",
            Self::Switch => "switch",
        }
    }

    /// Command topic postfixes subscribed for entities of this domain.
    pub fn command_postfixes(&self) -> &'static [&'static str] {
        match self {
            Self::Switch | Self::Select | Self::Light => &[SET_POSTFIX],
            Self::Cover => &[SET_POSTFIX, SET_POSITION_POSTFIX],
            Self::Climate => &[
                SET_POSTFIX,
                SET_MODE_POSTFIX,
                SET_TARGET_TEMPERATURE_POSTFIX,
            ],
            _ => &[],
        }
    }
}

/// Static description of one exposed entity. Read-only metadata consumed by
/// the discovery collaborator.
#[derive(Debug, Clone, Default)]
pub struct EntityDesc {
    pub name: &'static str,
    /// Subtopic under the device; `None` publishes to the device state
    /// topic itself.
    pub topic: Option<&'static str>,
    pub device_class: Option<&'static str>,
    pub unit: Option<&'static str>,
    pub icon: Option<&'static str>,
    pub entity_category: Option<&'static str>,
    /// Entity state is a JSON object exposed through attributes with one
    /// main value.
    pub main_value: Option<&'static str>,
}

pub type EntityMap = Vec<(EntityDomain, Vec<EntityDesc>)>;

/// Join topic segments, skipping empty ones.
pub fn join_topic<'a>(parts: impl IntoIterator<Item = &'a str>) -> String {
    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Topic an entity's state is published to, relative to the base topic.
pub fn entity_state_topic(unique_id: &str, entity: &EntityDesc) -> String {
    join_topic([unique_id, entity.topic.unwrap_or("")])
}

/// Every command topic (relative to the base topic) the device listens on.
pub fn subscribed_topics(unique_id: &str, entities: &EntityMap) -> Vec<String> {
    let mut topics = Vec::new();
    for (domain, descs) in entities {
        for postfix in domain.command_postfixes() {
            for entity in descs {
                topics.push(join_topic([
                    unique_id,
                    entity.topic.unwrap_or(""),
                    postfix,
                ]));
            }
        }
    }
    topics
}

/// Split an inbound command topic (relative to the base topic) into the
/// entity subtopic and the action postfix.
pub fn split_command_topic<'a>(unique_id: &str, topic: &'a str) -> (String, Option<&'a str>) {
    let mut rest = topic.strip_prefix(unique_id).unwrap_or(topic);
    let mut action = None;
    for postfix in [
        SET_POSTFIX,
        SET_POSITION_POSTFIX,
        SET_MODE_POSTFIX,
        SET_TARGET_TEMPERATURE_POSTFIX,
    ] {
        if let Some(stripped) = rest.strip_suffix(postfix) {
            action = Some(&topic[topic.len() - postfix.len()..]);
            rest = stripped;
            break;
        }
    }
    (rest.trim_matches('/').to_string(), action)
}

/// One inbound command message awaiting processing by a device.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Topic relative to the base topic.
    pub topic: String,
    pub value: serde_json::Value,
}

impl InboundMessage {
    /// Command payloads are usually plain strings ("ON", "open", "42").
    pub fn value_str(&self) -> String {
        match &self.value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}
