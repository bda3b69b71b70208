//! Adapter recovery: restart the host BLE interface when failures cluster.
//!
//! One instance per process, shared by every supervisor and the scan task.
//! Concurrent restart requests collapse into a single physical restart: a
//! caller finding a restart already underway just waits it out.

use std::time::Duration;

use async_trait::async_trait;
use log::{error, warn};
use tokio::sync::Mutex;

use crate::error::{BridgeError, Result};

/// How long a caller sleeps when another restart is already in progress.
const ALREADY_RESTARTING_WAIT: Duration = Duration::from_secs(9);
const COMMAND_TIMEOUT: Duration = Duration::from_secs(10);
const POST_RESTART_DELAY: Duration = Duration::from_secs(3);
const POST_UP_DELAY: Duration = Duration::from_secs(5);

const SERVICE_SCRIPTS: &[&str] = &["/etc/init.d/bluetoothd", "/etc/init.d/bluetooth"];

/// OS command execution behind the restart sequence; injectable for tests.
#[async_trait]
pub trait RestartCommands: Send + Sync {
    async fn run(&self, program: &str, args: &[&str]) -> Result<()>;
    /// Path of the bluetoothd init script, when the host has one.
    fn service_script(&self) -> Option<String>;
}

/// Real implementation driving `hciconfig` and the init.d service.
pub struct HciCommands;

#[async_trait]
impl RestartCommands for HciCommands {
    async fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .spawn()
            .map_err(|err| BridgeError::Transport(format!("cannot spawn {program}: {err}")))?;
        match tokio::time::timeout(COMMAND_TIMEOUT, child.wait()).await {
            Ok(Ok(status)) => {
                if !status.success() {
                    warn!("{program} {args:?} exited with {status}");
                }
                Ok(())
            }
            Ok(Err(err)) => Err(BridgeError::Transport(format!("{program} failed: {err}"))),
            Err(_) => {
                let _ = child.kill().await;
                Err(BridgeError::Timeout(format!("{program} {args:?}")))
            }
        }
    }

    fn service_script(&self) -> Option<String> {
        SERVICE_SCRIPTS
            .iter()
            .find(|path| std::path::Path::new(path).exists())
            .map(|path| path.to_string())
    }
}

pub struct AdapterRecoveryMonitor {
    adapter: String,
    restarting: Mutex<()>,
    commands: Box<dyn RestartCommands>,
}

impl AdapterRecoveryMonitor {
    pub fn new(adapter: impl Into<String>) -> Self {
        Self::with_commands(adapter, Box::new(HciCommands))
    }

    pub fn with_commands(adapter: impl Into<String>, commands: Box<dyn RestartCommands>) -> Self {
        Self {
            adapter: adapter.into(),
            restarting: Mutex::new(()),
            commands,
        }
    }

    /// Wait until any in-progress restart has finished.
    pub async fn barrier(&self) {
        let _guard = self.restarting.lock().await;
    }

    /// Restart the adapter: interface down, service restart (or interface
    /// reset), interface up, with settle delays. If a restart is already
    /// underway the other caller's restart counts for us too.
    pub async fn restart(&self) {
        let Ok(_guard) = self.restarting.try_lock() else {
            tokio::time::sleep(ALREADY_RESTARTING_WAIT).await;
            return;
        };
        warn!("restarting bluetooth adapter {}...", self.adapter);
        self.step("hciconfig", &[&self.adapter, "down"]).await;
        match self.commands.service_script() {
            Some(script) => self.step(&script, &["restart"]).await,
            None => self.step("hciconfig", &[&self.adapter, "reset"]).await,
        }
        tokio::time::sleep(POST_RESTART_DELAY).await;
        self.step("hciconfig", &[&self.adapter, "up"]).await;
        tokio::time::sleep(POST_UP_DELAY).await;
        warn!("restarting bluetooth adapter {} finished", self.adapter);
    }

    async fn step(&self, program: &str, args: &[&str]) {
        if let Err(err) = self.commands.run(program, args).await {
            error!("adapter restart step {program} {args:?} failed: {err}");
        }
    }
}
