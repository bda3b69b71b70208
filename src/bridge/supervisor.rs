//! Per-device connection supervisor: the state machine that takes a
//! configured device from unknown to connected/initialized/running and back,
//! forever, under constant failure.
//!
//! The cycle: wait for the recovery barrier, wait for the device to be seen
//! by the scanner, connect, initialize, race the handler tasks until one of
//! them (or the disconnect watcher) finishes, tear down, account the
//! failure, maybe restart the adapter, back off, repeat. The supervisor is
//! the only place that interprets errors into retry/backoff/restart
//! decisions; it never exits on a device error and never lets one device
//! take down the fleet.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::ble::backend::{BleBackend, BleClient};
use crate::bridge::recovery::AdapterRecoveryMonitor;
use crate::devices::entities::join_topic;
use crate::devices::{ConnectionMode, Device};
use crate::error::{BridgeError, FailureKind, Result};
use crate::mqtt::{DevicePublisher, MqttPublisher};
use crate::tasks::{race_and_cancel, spawn_cancellable};
use crate::utils::Event;

/// How long the scanner gets to sight the device before the attempt counts
/// as a missing-device failure.
const VISIBILITY_TIMEOUT: Duration = Duration::from_secs(10);
/// BLE connect deadline: the stack's own implicit 10s plus slack.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(12);
/// Grace period for the disconnect to be observed after closing.
const DISCONNECT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(1);
const DISCONNECT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Settle time after a hardware-fault-triggered adapter restart.
const HARDWARE_FAULT_COOLDOWN: Duration = Duration::from_secs(3);
/// Non-missing failures tolerated before an adapter restart.
const FAILURE_LIMIT: u32 = 5;

pub struct DeviceSupervisor {
    device: Arc<dyn Device>,
    backend: Arc<dyn BleBackend>,
    mqtt: Arc<dyn MqttPublisher>,
    publisher: DevicePublisher,
    recovery: Arc<AdapterRecoveryMonitor>,
    base_topic: String,
}

impl DeviceSupervisor {
    pub fn new(
        device: Arc<dyn Device>,
        backend: Arc<dyn BleBackend>,
        mqtt: Arc<dyn MqttPublisher>,
        publisher: DevicePublisher,
        recovery: Arc<AdapterRecoveryMonitor>,
        base_topic: String,
    ) -> Self {
        Self {
            device,
            backend,
            mqtt,
            publisher,
            recovery,
            base_topic,
        }
    }

    /// Manage the device until `cancel` fires. Never returns earlier and
    /// never propagates a device error.
    pub async fn run(&self, cancel: CancellationToken) {
        let device = &self.device;
        let core = device.core();
        let mut failure_count = 0u32;
        let mut missing_device_count = 0u32;
        let mut last_connection_successful = true;
        debug!("start managing device={}", device.label());

        loop {
            self.recovery.barrier().await;
            if cancel.is_cancelled() {
                self.shutdown_availability().await;
                return;
            }

            let result = self
                .run_cycle(
                    &cancel,
                    &mut failure_count,
                    &mut missing_device_count,
                    &mut last_connection_successful,
                )
                .await;

            // DISCONNECTING: always executed, success or failure. Modes
            // that intentionally drop between polls do not publish offline
            // here; they report it once, on shutdown.
            if core.connection_mode().holds_connection() {
                let _ = tokio::time::timeout(
                    AVAILABILITY_TIMEOUT,
                    self.publisher.send_availability(core, false),
                )
                .await;
            }
            device.close().await;

            if cancel.is_cancelled() {
                self.shutdown_availability().await;
                return;
            }

            match result {
                Ok(()) | Err(BridgeError::Cancelled) => {}
                Err(err) => {
                    if err.is_hardware_fault() {
                        warn!("[{}] adapter fault: {err}", device.label());
                        self.recovery.restart().await;
                        tokio::time::sleep(HARDWARE_FAULT_COOLDOWN).await;
                    }
                    match err.failure_kind() {
                        FailureKind::MissingDevice => {
                            missing_device_count += 1;
                            warn!(
                                "[{}] connection problem: {err}, attempts={missing_device_count}",
                                device.label()
                            );
                        }
                        FailureKind::Other => {
                            failure_count += 1;
                            warn!(
                                "[{}] error while connecting: {err}, failure_count={failure_count}",
                                device.label()
                            );
                        }
                    }
                }
            }

            // Some devices keep the link half-open without advertising;
            // after enough misses the adapter itself is suspect.
            if missing_device_count >= device.connection_failures_limit() {
                error!(
                    "Device {} was not found {missing_device_count} times, restarting the adapter",
                    device.label()
                );
                missing_device_count = 0;
                self.recovery.restart().await;
            }
            if failure_count >= FAILURE_LIMIT {
                self.recovery.restart().await;
                failure_count = 0;
            }

            if !core.is_passive() && !core.disconnected_event().is_set() {
                let wait = core.disconnected_event().wait();
                if tokio::time::timeout(DISCONNECT_WAIT_TIMEOUT, wait)
                    .await
                    .is_err()
                {
                    warn!(
                        "[{}] not disconnected within {DISCONNECT_WAIT_TIMEOUT:?}",
                        device.label()
                    );
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.shutdown_availability().await;
                    return;
                }
                _ = self.sleep_until_next_connection(last_connection_successful) => {}
            }
        }
    }

    /// One connect/init/run cycle, IDLE through RUNNING.
    async fn run_cycle(
        &self,
        cancel: &CancellationToken,
        failure_count: &mut u32,
        missing_device_count: &mut u32,
        last_connection_successful: &mut bool,
    ) -> Result<()> {
        let device = &self.device;
        let core = device.core();
        let passive = core.is_passive();

        if !passive {
            *last_connection_successful = false;

            // AWAITING_VISIBILITY
            let seen = tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                seen = tokio::time::timeout(
                    VISIBILITY_TIMEOUT,
                    core.advertisement_seen_event().wait(),
                ) => seen,
            };
            if seen.is_err() {
                return Err(BridgeError::Timeout(format!(
                    "[{}] is not visible for {VISIBILITY_TIMEOUT:?}",
                    device.label()
                )));
            }

            // CONNECTING
            let client = tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                client = self.backend.connect(core.mac(), core.address_type(), CONNECT_TIMEOUT) => client?,
            };
            core.set_client(client).await;
            *last_connection_successful = true;

            // INITIALIZING
            tokio::select! {
                _ = cancel.cancelled() => return Err(BridgeError::Cancelled),
                init = device.get_device_data() => init?,
            }
            *failure_count = 0;
            *missing_device_count = 0;
            core.mark_connection_fresh();
            info!("[{}] connected and initialized", device.label());
        }

        let topics = device.subscribed_topics();
        if !topics.is_empty() {
            let full: Vec<String> = topics
                .iter()
                .map(|topic| join_topic([self.base_topic.as_str(), topic.as_str()]))
                .collect();
            self.mqtt.subscribe(&full).await?;
            debug!("[{}] mqtt subscribed", device.label());
        }

        // RUNNING: race the handler tasks; the first to finish (clean exit,
        // error, or observed disconnect) tears down its siblings.
        let children = cancel.child_token();
        let mut handles = Vec::new();
        if !passive && !device.spec().drops_connection {
            if let Some(client) = core.client().await {
                let disconnected = core.disconnected_event().clone();
                handles.push(spawn_cancellable(
                    children.clone(),
                    watch_disconnect(client, disconnected),
                ));
            }
        }
        {
            let device = self.device.clone();
            let publisher = self.publisher.clone();
            handles.push(spawn_cancellable(children.clone(), async move {
                device.handle(&publisher).await
            }));
        }
        if !topics.is_empty() {
            let device = self.device.clone();
            let publisher = self.publisher.clone();
            handles.push(spawn_cancellable(children.clone(), async move {
                device.handle_messages(&publisher).await
            }));
        }

        let result = race_and_cancel(children, handles).await;
        if core.disconnected_event().is_set() {
            debug!("{} has disconnected", device.label());
        }
        result
    }

    /// BACKOFF policy: keep-connection devices (and any device whose last
    /// attempt failed) reconnect as soon as the scanner sees them again;
    /// everything else sleeps the full reconnection interval.
    async fn sleep_until_next_connection(&self, last_connection_successful: bool) {
        let core = self.device.core();
        let interval = self.device.spec().reconnection_interval;
        debug!(
            "sleep for {interval:?} before reconnecting to {}",
            self.device.label()
        );
        if core.connection_mode() == ConnectionMode::ActiveKeepConnection
            || !last_connection_successful
        {
            let _ = tokio::time::timeout(interval, core.advertisement_seen_event().wait()).await;
        } else {
            tokio::time::sleep(interval).await;
        }
    }

    /// On shutdown, modes that do not hold a connection get their only
    /// chance to report offline here.
    async fn shutdown_availability(&self) {
        let core = self.device.core();
        if !core.connection_mode().holds_connection() {
            let _ = tokio::time::timeout(
                AVAILABILITY_TIMEOUT,
                self.publisher.send_availability(core, false),
            )
            .await;
        }
    }
}

/// Resolve once the connection is observed gone: through the client's own
/// disconnect event (notification stream ended) or by polling the stack.
async fn watch_disconnect(client: Arc<dyn BleClient>, disconnected: Event) -> Result<()> {
    let client_gone = client.disconnected_event();
    loop {
        if disconnected.is_set() || client_gone.is_set() || !client.is_connected().await {
            disconnected.set();
            return Ok(());
        }
        tokio::select! {
            _ = disconnected.wait() => {}
            _ = client_gone.wait() => {}
            _ = tokio::time::sleep(DISCONNECT_POLL_INTERVAL) => {}
        }
    }
}
