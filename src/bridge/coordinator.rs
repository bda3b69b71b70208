//! Fleet coordinator: owns the broker session, the scan loop and one
//! supervisor per registered device, bound together as one unit whose
//! lifetime is the MQTT connection.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::ble::backend::BleBackend;
use crate::ble::scanner::SeenDevice;
use crate::bridge::recovery::AdapterRecoveryMonitor;
use crate::bridge::supervisor::DeviceSupervisor;
use crate::config::Config;
use crate::devices::Device;
use crate::devices::entities::join_topic;
use crate::error::{BridgeError, Result};
use crate::mqtt::{
    DevicePublisher, DiscoveryPublisher, MessageRouter, MqttPublisher, MqttSession, QosLevel,
};
use crate::tasks::{race_and_cancel, spawn_cancellable};

const BRIDGE_TOPIC: &str = "bridge";
const BRIDGE_STATE_TOPIC: &str = "state";

const SCAN_WINDOW: Duration = Duration::from_secs(3);
const SCAN_PAUSE: Duration = Duration::from_secs(1);
/// Consecutive empty scan cycles before the adapter is deemed silent and
/// restarted.
const EMPTY_SCANS_BEFORE_RESTART: u32 = 10;

pub struct FleetCoordinator {
    config: Config,
    backend: Arc<dyn BleBackend>,
    recovery: Arc<AdapterRecoveryMonitor>,
    devices: Vec<Arc<dyn Device>>,
}

impl FleetCoordinator {
    pub fn new(config: Config, backend: Arc<dyn BleBackend>) -> Self {
        let recovery = Arc::new(AdapterRecoveryMonitor::new(config.hci_adapter.clone()));
        Self {
            config,
            backend,
            recovery,
            devices: Vec::new(),
        }
    }

    pub fn register(&mut self, device: Arc<dyn Device>) {
        info!(
            "registered {} ({}, {:?})",
            device.label(),
            device.core().mac(),
            device.core().connection_mode()
        );
        self.devices.push(device);
    }

    pub fn availability_topic(&self) -> String {
        join_topic([
            self.config.base_topic.as_str(),
            BRIDGE_TOPIC,
            BRIDGE_STATE_TOPIC,
        ])
    }

    /// Broker reconnect loop: runs sessions until cancelled or a fatal
    /// broker error (refused credentials) occurs.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        loop {
            match self.run_session(&cancel).await {
                Ok(()) => {}
                Err(err @ BridgeError::Config(_)) => {
                    error!("fatal broker error: {err}");
                    return Err(err);
                }
                Err(err) => warn!("broker connection lost: {err}"),
            }
            if cancel.is_cancelled() {
                return Ok(());
            }
            info!(
                "reconnecting to the broker in {}s",
                self.config.reconnection_interval
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs(self.config.reconnection_interval)) => {}
            }
        }
    }

    /// One broker session: connect, announce, run the bounded batch of
    /// disconnect watcher + scan task + supervisors, tear down.
    async fn run_session(&self, cancel: &CancellationToken) -> Result<()> {
        let availability_topic = self.availability_topic();
        let (session, mut eventloop) = MqttSession::new(&self.config, &availability_topic);
        let session = Arc::new(session);
        session
            .wait_connected(
                &mut eventloop,
                Duration::from_secs(self.config.reconnection_interval),
            )
            .await?;
        info!("connected to {}", self.config.mqtt_host);
        session
            .publish(&availability_topic, b"online", QosLevel::AtLeastOnce, true)
            .await?;

        // The event loop runs outside the raced set: it is the thing being
        // awaited, not a worker, and teardown publishes must still flush
        // through it. Only its disconnect report is raced.
        let router = Arc::new(MessageRouter::new(
            self.config.base_topic.clone(),
            self.devices.clone(),
        ));
        let (disconnect_tx, disconnect_rx) = oneshot::channel();
        let driver = {
            let session = session.clone();
            tokio::spawn(async move {
                let reason = session.drive(eventloop, router).await;
                let _ = disconnect_tx.send(reason);
            })
        };

        let discovery = Arc::new(DiscoveryPublisher::new(
            self.config.base_topic.clone(),
            self.config.mqtt_config_prefix.clone(),
            availability_topic.clone(),
        ));

        let children = cancel.child_token();
        let mut handles = Vec::new();

        handles.push(spawn_cancellable(children.clone(), async move {
            match disconnect_rx.await {
                Ok(reason) => Err(reason),
                Err(_) => Err(BridgeError::Mqtt("event loop ended".to_string())),
            }
        }));

        handles.push(spawn_cancellable(
            children.clone(),
            scan_task(
                self.backend.clone(),
                self.devices.clone(),
                self.recovery.clone(),
            ),
        ));

        // Supervisors are spawned plain: they observe the child token
        // cooperatively so their teardown (availability, client close)
        // always runs before the session goes away.
        for device in &self.devices {
            let publisher = DevicePublisher::new(
                session.clone() as Arc<dyn MqttPublisher>,
                self.config.base_topic.clone(),
                discovery.clone(),
            );
            let supervisor = DeviceSupervisor::new(
                device.clone(),
                self.backend.clone(),
                session.clone() as Arc<dyn MqttPublisher>,
                publisher,
                self.recovery.clone(),
                self.config.base_topic.clone(),
            );
            let token = children.clone();
            handles.push(tokio::spawn(async move {
                supervisor.run(token).await;
                Ok(())
            }));
        }

        let result = race_and_cancel(children, handles).await;

        if session.is_connected() {
            let _ = tokio::time::timeout(
                Duration::from_secs(1),
                session.publish(&availability_topic, b"offline", QosLevel::AtMostOnce, true),
            )
            .await;
            session.disconnect().await;
        }
        driver.abort();
        let _ = driver.await;
        result
    }
}

/// Continuous scan loop: bounded scan cycles feeding sightings into the
/// registered devices. A silent adapter (ten empty cycles in a row) gets
/// restarted.
async fn scan_task(
    backend: Arc<dyn BleBackend>,
    devices: Vec<Arc<dyn Device>>,
    recovery: Arc<AdapterRecoveryMonitor>,
) -> Result<()> {
    let mut empty_scans = 0u32;
    loop {
        if empty_scans >= EMPTY_SCANS_BEFORE_RESTART {
            warn!("{empty_scans} empty scan cycles in a row, restarting the adapter");
            empty_scans = 0;
            recovery.restart().await;
        }
        match backend.scan_cycle(SCAN_WINDOW).await {
            Ok(seen) => {
                if seen.is_empty() {
                    empty_scans += 1;
                } else {
                    empty_scans = 0;
                }
                debug!("scan cycle found {} advertisements", seen.len());
                for sighting in &seen {
                    dispatch_advert(&devices, sighting);
                }
            }
            Err(err) => {
                if err.is_hardware_fault() {
                    recovery.restart().await;
                }
                warn!("scan failed: {err}");
                empty_scans += 1;
            }
        }
        tokio::time::sleep(SCAN_PAUSE).await;
    }
}

/// Correlate one sighting to registered devices by MAC: refresh RSSI for
/// everyone, decode adverts for passive devices, raise the seen event for
/// active ones.
fn dispatch_advert(devices: &[Arc<dyn Device>], sighting: &SeenDevice) {
    for device in devices {
        if !device.core().mac().eq_ignore_ascii_case(&sighting.mac) {
            continue;
        }
        if let Some(rssi) = sighting.advertisement.rssi {
            device.core().set_rssi(rssi);
        }
        device.core().mark_advertisement();
        if device.core().is_passive() {
            if let Some(name) = &sighting.advertisement.local_name {
                device.core().set_model(name.clone());
            }
            device.handle_advert(&sighting.advertisement);
        } else {
            debug!("active device seen: {}", device.label());
            device.core().advertisement_seen_event().set();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::ble::backend::{AddressType, BleClient};
    use crate::ble::scanner::Advertisement;
    use crate::bridge::recovery::RestartCommands;
    use crate::config::DeviceEntry;
    use crate::devices::create_device;

    fn presence_entry(mac: &str) -> DeviceEntry {
        DeviceEntry {
            device_type: "presence".to_string(),
            address: mac.to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        }
    }

    fn kettle_entry(mac: &str) -> DeviceEntry {
        DeviceEntry {
            device_type: "redmond200".to_string(),
            address: mac.to_string(),
            friendly_name: None,
            key: None,
            passive: None,
            threshold: None,
            connection_failures_limit: None,
        }
    }

    #[test]
    fn dispatch_updates_rssi_and_raises_seen_for_active_devices() {
        let kettle = create_device(&kettle_entry("aa:bb:cc:dd:ee:ff")).unwrap();
        let devices = vec![kettle.clone()];
        let sighting = SeenDevice {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            advertisement: Advertisement {
                rssi: Some(-60),
                ..Default::default()
            },
        };
        dispatch_advert(&devices, &sighting);
        assert_eq!(kettle.core().rssi(), Some(-60));
        assert!(kettle.core().advertisement_seen_event().is_set());
        assert!(kettle.core().last_advertisement().is_some());
    }

    #[test]
    fn dispatch_feeds_passive_devices_and_updates_model() {
        let tracker = create_device(&presence_entry("11:22:33:44:55:66")).unwrap();
        let devices = vec![tracker.clone()];
        let sighting = SeenDevice {
            mac: "11:22:33:44:55:66".to_string(),
            advertisement: Advertisement {
                rssi: Some(-70),
                local_name: Some("Tile".to_string()),
                ..Default::default()
            },
        };
        dispatch_advert(&devices, &sighting);
        assert_eq!(tracker.core().rssi(), Some(-70));
        assert_eq!(tracker.core().model(), Some("Tile".to_string()));
        assert!(!tracker.core().advertisement_seen_event().is_set());
    }

    #[test]
    fn dispatch_ignores_unknown_macs() {
        let kettle = create_device(&kettle_entry("aa:bb:cc:dd:ee:ff")).unwrap();
        let devices = vec![kettle.clone()];
        let sighting = SeenDevice {
            mac: "00:00:00:00:00:00".to_string(),
            advertisement: Advertisement::default(),
        };
        dispatch_advert(&devices, &sighting);
        assert_eq!(kettle.core().rssi(), None);
        assert!(!kettle.core().advertisement_seen_event().is_set());
    }

    struct EmptyScanBackend {
        scans: AtomicU32,
    }

    #[async_trait]
    impl BleBackend for EmptyScanBackend {
        async fn scan_cycle(&self, _window: Duration) -> Result<Vec<SeenDevice>> {
            self.scans.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }

        async fn connect(
            &self,
            mac: &str,
            _address_type: AddressType,
            _timeout: Duration,
        ) -> Result<Arc<dyn BleClient>> {
            Err(BridgeError::DeviceNotFound(mac.to_string()))
        }
    }

    struct CountingCommands {
        sequences: AtomicU32,
    }

    #[async_trait]
    impl RestartCommands for CountingCommands {
        async fn run(&self, _program: &str, args: &[&str]) -> Result<()> {
            if args.contains(&"up") {
                self.sequences.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        }

        fn service_script(&self) -> Option<String> {
            None
        }
    }

    #[tokio::test(start_paused = true)]
    async fn empty_scan_streak_restarts_the_adapter() {
        let backend = Arc::new(EmptyScanBackend {
            scans: AtomicU32::new(0),
        });
        let counting = Arc::new(CountingCommands {
            sequences: AtomicU32::new(0),
        });
        struct Shared(Arc<CountingCommands>);
        #[async_trait]
        impl RestartCommands for Shared {
            async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
                self.0.run(program, args).await
            }
            fn service_script(&self) -> Option<String> {
                self.0.service_script()
            }
        }
        let recovery = Arc::new(AdapterRecoveryMonitor::with_commands(
            "hci0",
            Box::new(Shared(counting.clone())),
        ));

        let cancel = CancellationToken::new();
        let task = spawn_cancellable(
            cancel.clone(),
            scan_task(backend.clone(), Vec::new(), recovery),
        );

        // Ten empty cycles (the mock scan is instant, so one per 1s pause),
        // then the restart fires and resets the streak. Probe before a
        // second streak can accumulate.
        tokio::time::sleep(Duration::from_secs(15)).await;
        assert_eq!(counting.sequences.load(Ordering::SeqCst), 1);
        assert!(backend.scans.load(Ordering::SeqCst) >= 10);

        cancel.cancel();
        let _ = task.await;
    }

    #[test]
    fn bridge_availability_topic_layout() {
        let config = Config::default();
        let coordinator = FleetCoordinator::new(
            config,
            Arc::new(EmptyScanBackend {
                scans: AtomicU32::new(0),
            }),
        );
        assert_eq!(coordinator.availability_topic(), "blemqtt/bridge/state");
    }
}
