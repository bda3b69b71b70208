//! Standard GATT UUIDs used across device types.

use uuid::Uuid;

pub const UUID_DEVICE_NAME: Uuid = Uuid::from_u128(0x00002a00_0000_1000_8000_00805f9b34fb);
pub const UUID_MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const UUID_FIRMWARE_VERSION: Uuid = Uuid::from_u128(0x00002a26_0000_1000_8000_00805f9b34fb);
pub const UUID_BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

/// Environmental Sensing service; ATC-flashed Xiaomi sensors broadcast
/// their readings as service data under this UUID.
pub const UUID_ENVIRONMENTAL_SENSING: Uuid =
    Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);
