//! Generic BLE presence tracker: any advertising device counts as "home"
//! while its advertisements keep arriving within the configured threshold.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use log::{debug, info};
use serde_json::json;

use crate::ble::backend::AddressType;
use crate::ble::scanner::Advertisement;
use crate::config::DeviceEntry;
use crate::devices::entities::{EntityDesc, EntityDomain, EntityMap};
use crate::devices::{
    ConnectionMode, Device, DeviceCore, DeviceSpec, resolve_connection_mode,
};
use crate::error::Result;
use crate::mqtt::DevicePublisher;

pub const DEVICE_TYPE: &str = "presence";

const PRESENCE_ENTITY: &str = "presence";
const TRACKER_ENTITY: &str = "device_tracker";

/// Without an advertisement for this long, presence flips to OFF.
const DEFAULT_THRESHOLD: Duration = Duration::from_secs(300);
/// Publish at least this often even without a state change.
const SEND_DATA_PERIOD: u64 = 60;

static SPEC: DeviceSpec = DeviceSpec {
    device_type: DEVICE_TYPE,
    manufacturer: Some("Generic"),
    supports_passive: true,
    supports_active: false,
    active_mode: ConnectionMode::Passive,
    drops_connection: false,
    address_type: AddressType::Public,
    reconnection_interval: Duration::from_secs(60),
    active_interval: Duration::from_secs(60),
    passive_interval: Duration::from_secs(1),
    not_ready_interval: Duration::from_secs(5),
    connection_failures_limit: 5,
};

pub struct PresenceTracker {
    core: DeviceCore,
    threshold: Duration,
    last_seen: std::sync::Mutex<Option<Instant>>,
    initial_state_sent: AtomicBool,
}

impl PresenceTracker {
    pub fn from_config(entry: &DeviceEntry) -> Result<Self> {
        let mode = resolve_connection_mode(&SPEC, entry.passive)?;
        let threshold = entry
            .threshold
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_THRESHOLD);
        Ok(Self {
            core: DeviceCore::new(
                &entry.address,
                SPEC.address_type,
                entry.friendly_name.clone(),
                mode,
            )?
                .with_failures_limit(entry.connection_failures_limit),
            threshold,
            last_seen: std::sync::Mutex::new(None),
            initial_state_sent: AtomicBool::new(false),
        })
    }

    fn is_present(&self) -> bool {
        self.last_seen
            .lock()
            .unwrap()
            .map(|seen| seen.elapsed() < self.threshold)
            .unwrap_or(false)
    }

    async fn notify_state(&self, publisher: &DevicePublisher, present: bool) {
        let mut payload = json!({
            PRESENCE_ENTITY: if present { "ON" } else { "OFF" },
            TRACKER_ENTITY: if present { "home" } else { "not_home" },
        });
        if let Some(lqi) = self.core.linkquality() {
            payload["linkquality"] = json!(lqi);
        }
        info!("[{}] send state={payload}", self.label());
        publisher
            .publish_state(&self.core, "", &payload.to_string())
            .await;
        self.initial_state_sent.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl Device for PresenceTracker {
    fn core(&self) -> &DeviceCore {
        &self.core
    }

    fn spec(&self) -> &DeviceSpec {
        &SPEC
    }

    fn entities(&self) -> EntityMap {
        vec![
            (
                EntityDomain::BinarySensor,
                vec![EntityDesc {
                    name: PRESENCE_ENTITY,
                    device_class: Some("presence"),
                    ..Default::default()
                }],
            ),
            (
                EntityDomain::DeviceTracker,
                vec![EntityDesc {
                    name: TRACKER_ENTITY,
                    ..Default::default()
                }],
            ),
        ]
    }

    fn handle_advert(&self, _advertisement: &Advertisement) {
        debug!("[{}] advert received", self.core.mac());
        *self.last_seen.lock().unwrap() = Some(Instant::now());
    }

    async fn handle(&self, publisher: &DevicePublisher) -> Result<()> {
        let mut last_published: Option<bool> = None;
        let mut timer = 0u64;
        loop {
            let present = self.is_present();
            timer += 1;
            let changed = last_published != Some(present);
            if changed
                || !self.initial_state_sent.load(Ordering::SeqCst)
                || timer >= SEND_DATA_PERIOD
            {
                publisher.update_device_data(self).await?;
                self.notify_state(publisher, present).await;
                last_published = Some(present);
                timer = 0;
            }
            tokio::time::sleep(SPEC.passive_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(threshold: Option<u64>) -> PresenceTracker {
        let entry = DeviceEntry {
            device_type: DEVICE_TYPE.to_string(),
            address: "de:ad:be:ef:00:01".to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold,
            connection_failures_limit: None,
        };
        PresenceTracker::from_config(&entry).unwrap()
    }

    #[test]
    fn absent_until_first_advert() {
        let tracker = tracker(None);
        assert!(!tracker.is_present());
        tracker.handle_advert(&Advertisement::default());
        assert!(tracker.is_present());
    }

    #[test]
    fn stale_sighting_counts_as_absent() {
        let tracker = tracker(Some(1));
        *tracker.last_seen.lock().unwrap() =
            Some(Instant::now() - Duration::from_secs(2));
        assert!(!tracker.is_present());
    }

    #[test]
    fn threshold_is_configurable() {
        let configured = tracker(Some(30));
        assert_eq!(configured.threshold, Duration::from_secs(30));
        let tracker = tracker(None);
        assert_eq!(tracker.threshold, DEFAULT_THRESHOLD);
    }
}
