//! Advertisement snapshots produced by scan cycles.

use std::collections::HashMap;

use uuid::Uuid;

/// Decoded advertisement payload attached to one sighting of a device.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    pub rssi: Option<i16>,
    pub local_name: Option<String>,
    pub manufacturer_data: Option<(u16, Vec<u8>)>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
}

impl Advertisement {
    pub fn service_data(&self, uuid: Uuid) -> Option<&[u8]> {
        self.service_data.get(&uuid).map(|d| d.as_slice())
    }
}

/// One device sighting from a scan cycle, correlated by MAC address.
#[derive(Debug, Clone)]
pub struct SeenDevice {
    pub mac: String,
    pub advertisement: Advertisement,
}
