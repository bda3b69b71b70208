//! BLE-to-MQTT bridge library.
//!
//! Bridges Bluetooth Low Energy peripherals to an MQTT broker, exposing
//! each device's sensors and actuators as Home Assistant-discoverable
//! topics and relaying inbound commands back to the hardware.

pub mod ble;
pub mod bridge;
pub mod config;
pub mod devices;
pub mod error;
pub mod mqtt;
pub mod protocols;
pub mod tasks;
pub mod utils;

pub use bridge::FleetCoordinator;
pub use config::Config;
pub use error::{BridgeError, Result};
