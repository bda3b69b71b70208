//! End-to-end surface checks: configuration through the device factory to
//! the entity/topic layout the broker side consumes.

use ble_mqtt_bridge::config::{Config, DeviceEntry};
use ble_mqtt_bridge::devices::entities::EntityDomain;
use ble_mqtt_bridge::devices::{ConnectionMode, create_device};

fn entry(device_type: &str, address: &str) -> DeviceEntry {
    DeviceEntry {
        device_type: device_type.to_string(),
        address: address.to_string(),
        friendly_name: None,
        key: None,
        passive: None,
        threshold: None,
        connection_failures_limit: None,
    }
}

#[test]
fn every_registered_type_builds_from_config() {
    for device_type in [
        "redmond200",
        "am43",
        "ecam",
        "inmotion",
        "xiaomilywsd_atc",
        "presence",
    ] {
        let device = create_device(&entry(device_type, "aa:bb:cc:dd:ee:ff"))
            .unwrap_or_else(|err| panic!("{device_type} failed to build: {err}"));
        assert_eq!(device.spec().device_type, device_type);
        assert!(!device.entities().is_empty());
    }
}

#[test]
fn unknown_types_are_rejected() {
    assert!(create_device(&entry("toaster9000", "aa:bb:cc:dd:ee:ff")).is_err());
}

#[test]
fn config_file_round_trips_into_devices() {
    let raw = r#"{
        "base_topic": "home/ble",
        "devices": [
            {"type": "am43", "address": "02:4E:F0:00:11:22", "friendly_name": "livingroom"},
            {"type": "xiaomilywsd_atc", "address": "A4:C1:38:AA:BB:CC"},
            {"type": "presence", "address": "DE:AD:BE:EF:00:01", "threshold": 60}
        ]
    }"#;
    let config: Config = serde_json::from_str(raw).unwrap();
    let devices: Vec<_> = config
        .devices
        .iter()
        .map(|e| create_device(e).unwrap())
        .collect();

    assert_eq!(
        devices[0].core().connection_mode(),
        ConnectionMode::ActiveKeepConnection
    );
    assert_eq!(devices[1].core().connection_mode(), ConnectionMode::Passive);
    assert_eq!(devices[2].core().connection_mode(), ConnectionMode::Passive);

    // Topic surface: the cover listens on its command topics, sensors on
    // nothing.
    assert_eq!(
        devices[0].subscribed_topics(),
        vec![
            "0x024ef0001122/cover/set".to_string(),
            "0x024ef0001122/cover/set_position".to_string(),
        ]
    );
    assert!(devices[1].subscribed_topics().is_empty());
    assert!(devices[2].subscribed_topics().is_empty());
}

#[test]
fn unique_ids_are_mac_derived_and_stable() {
    let device = create_device(&entry("am43", "02:4e:f0:00:11:22")).unwrap();
    assert_eq!(device.core().unique_id(), "0x024ef0001122");
    assert_eq!(
        device.core().availability_topic(),
        "0x024ef0001122/availability"
    );
}

#[test]
fn passive_only_types_refuse_active_mode() {
    let mut e = entry("presence", "aa:bb:cc:dd:ee:ff");
    e.passive = Some(false);
    assert!(create_device(&e).is_err());
}

#[test]
fn tracker_exposes_binary_sensor_and_device_tracker() {
    let device = create_device(&entry("presence", "aa:bb:cc:dd:ee:ff")).unwrap();
    let domains: Vec<EntityDomain> = device.entities().iter().map(|(d, _)| *d).collect();
    assert!(domains.contains(&EntityDomain::BinarySensor));
    assert!(domains.contains(&EntityDomain::DeviceTracker));
}
