use std::sync::Arc;

use anyhow::{Context, Result};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use ble_mqtt_bridge::ble::BluestBackend;
use ble_mqtt_bridge::config::Config;
use ble_mqtt_bridge::devices::create_device;
use ble_mqtt_bridge::FleetCoordinator;

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = Config::config_path();
    let config = Config::load(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;

    env_logger::Builder::new()
        .filter_level(
            config
                .log_level
                .parse()
                .unwrap_or(log::LevelFilter::Info),
        )
        .format_timestamp_secs()
        .init();
    info!("starting ble-mqtt-bridge");

    let backend = Arc::new(
        BluestBackend::new()
            .await
            .context("initializing the Bluetooth adapter")?,
    );

    let mut coordinator = FleetCoordinator::new(config.clone(), backend);
    for entry in &config.devices {
        match create_device(entry) {
            Ok(device) => coordinator.register(device),
            Err(err) => {
                // One bad entry must not keep the rest of the fleet down.
                error!("skipping device {}: {err}", entry.address);
            }
        }
    }

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("received interrupt, shutting down");
            shutdown.cancel();
        }
    });

    coordinator.run(cancel).await?;
    info!("bye");
    Ok(())
}
