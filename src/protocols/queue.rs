//! Generic request/response multiplexer over a BLE notification stream.
//!
//! The peripherals spoken to here are half-duplex, single-channel links:
//! replies arrive as unsolicited notifications on a characteristic, so at
//! most one command may be in flight per device. `CommandQueue` serializes
//! concurrent callers into strict submission order and pairs each write
//! with the next inbound notification.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{BridgeError, Result};
use crate::utils::format_binary;

/// Default reply deadline for vendor protocol commands.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(25);

const COMMAND_QUEUE_DEPTH: usize = 16;

/// Where request frames are written; implemented over a characteristic of
/// the active BLE client.
#[async_trait]
pub trait FrameSink: Send + Sync {
    async fn write_frame(&self, frame: &[u8]) -> Result<()>;
}

/// One outstanding request. The oneshot sender is consumed on resolution,
/// making a double resolve impossible by construction.
struct PendingCommand {
    request: Vec<u8>,
    expect_reply: bool,
    timeout: Duration,
    reply: oneshot::Sender<Result<Vec<u8>>>,
}

/// Cloneable handle to the single background worker serving one device.
#[derive(Clone)]
pub struct CommandQueue {
    submit: mpsc::Sender<PendingCommand>,
    cancel: CancellationToken,
}

impl CommandQueue {
    /// Start the worker for one connection. `notifications` is the raw
    /// notification channel of the reply characteristic.
    pub fn spawn(sink: Arc<dyn FrameSink>, notifications: mpsc::Receiver<Vec<u8>>) -> Self {
        let (submit, commands) = mpsc::channel(COMMAND_QUEUE_DEPTH);
        let cancel = CancellationToken::new();
        tokio::spawn(worker(sink, commands, notifications, cancel.clone()));
        Self { submit, cancel }
    }

    /// Enqueue a request and wait for its resolution. Calls are served in
    /// strict submission order; a reply is awaited only when `expect_reply`
    /// is set.
    pub async fn send(
        &self,
        request: Vec<u8>,
        expect_reply: bool,
        timeout: Duration,
    ) -> Result<Vec<u8>> {
        let (tx, rx) = oneshot::channel();
        let command = PendingCommand {
            request,
            expect_reply,
            timeout,
            reply: tx,
        };
        self.submit
            .send(command)
            .await
            .map_err(|_| BridgeError::Cancelled)?;
        rx.await.map_err(|_| BridgeError::Cancelled)?
    }

    /// Stop the worker. The in-flight command and everything still queued
    /// resolve with `Cancelled`; later `send` calls fail the same way.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

async fn worker(
    sink: Arc<dyn FrameSink>,
    mut commands: mpsc::Receiver<PendingCommand>,
    mut notifications: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let command = tokio::select! {
            _ = cancel.cancelled() => break,
            next = commands.recv() => match next {
                Some(command) => command,
                None => break,
            },
        };

        // A lingering notification from a previous timed-out command must
        // not be mistaken for this command's reply.
        while notifications.try_recv().is_ok() {}

        let PendingCommand {
            request,
            expect_reply,
            timeout,
            reply,
        } = command;
        debug!("write frame [{}]", format_binary(&request));

        let outcome = tokio::select! {
            _ = cancel.cancelled() => Err(BridgeError::Cancelled),
            res = execute(sink.as_ref(), &mut notifications, &request, expect_reply, timeout) => res,
        };
        let _ = reply.send(outcome);

        if cancel.is_cancelled() {
            break;
        }
    }

    // Teardown: nothing queued may be left waiting forever.
    commands.close();
    while let Ok(command) = commands.try_recv() {
        let _ = command.reply.send(Err(BridgeError::Cancelled));
    }
}

async fn execute(
    sink: &dyn FrameSink,
    notifications: &mut mpsc::Receiver<Vec<u8>>,
    request: &[u8],
    expect_reply: bool,
    timeout: Duration,
) -> Result<Vec<u8>> {
    sink.write_frame(request).await?;
    if !expect_reply {
        return Ok(Vec::new());
    }
    match tokio::time::timeout(timeout, notifications.recv()).await {
        Ok(Some(frame)) => Ok(frame),
        Ok(None) => Err(BridgeError::Transport(
            "notification stream ended".to_string(),
        )),
        Err(_) => Err(BridgeError::Timeout("command reply".to_string())),
    }
}
