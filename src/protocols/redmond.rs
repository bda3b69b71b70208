//! Protocol for Redmond G200-series kitchen devices (kettles and cookers
//! with the R4S BLE module).
//!
//! Frames are `[0x55, counter, command, payload.., 0xAA]` where the counter
//! increments per command and wraps at 101. Replies echo the counter and
//! command id inside the same framing. All commands require a prior AUTH
//! exchange with the 8-byte pairing key.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};

use chrono::{Local, Offset};
use log::debug;

use crate::error::{BridgeError, ProtocolError, Result};
use crate::protocols::queue::{CommandQueue, DEFAULT_COMMAND_TIMEOUT};

pub const START_BYTE: u8 = 0x55;
pub const END_BYTE: u8 = 0xaa;
const COUNTER_MODULO: u8 = 101;

const BOIL_TIME_RELATIVE_DEFAULT: i16 = 0x80;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    Version = 0x01,
    RunCurrentMode = 0x03,
    StopCurrentMode = 0x04,
    WriteMode = 0x05,
    ReadMode = 0x06,
    SetTime = 0x6e,
    Auth = 0xff,
}

/// Operating mode of a G200 kettle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum KettleMode {
    #[default]
    Boil = 0x00,
    Heat = 0x01,
    Light = 0x03,
}

impl KettleMode {
    fn from_byte(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Boil),
            0x01 => Ok(Self::Heat),
            0x03 => Ok(Self::Light),
            other => Err(ProtocolError::BadFrame(format!(
                "unknown kettle mode {other:#04x}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum RunState {
    #[default]
    Off = 0x00,
    SetupProgram = 0x01,
    On = 0x02,
    Heat = 0x03,
    Cooking = 0x05,
    WarmUp = 0x06,
}

impl RunState {
    fn from_byte(value: u8) -> std::result::Result<Self, ProtocolError> {
        match value {
            0x00 => Ok(Self::Off),
            0x01 => Ok(Self::SetupProgram),
            0x02 => Ok(Self::On),
            0x03 => Ok(Self::Heat),
            0x05 => Ok(Self::Cooking),
            0x06 => Ok(Self::WarmUp),
            other => Err(ProtocolError::BadFrame(format!(
                "unknown run state {other:#04x}"
            ))),
        }
    }
}

/// Decoded 16-byte kettle status record.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct KettleState {
    pub mode: KettleMode,
    pub target_temperature: u8,
    pub is_blocked: bool,
    pub sound: bool,
    pub temperature: u8,
    pub color_change_period: u16,
    pub state: RunState,
    pub boil_time: i16,
    pub error: u8,
}

impl KettleState {
    pub const ENCODED_LEN: usize = 16;

    pub fn from_bytes(data: &[u8]) -> std::result::Result<Self, ProtocolError> {
        if data.len() != Self::ENCODED_LEN {
            return Err(ProtocolError::BadFrame(format!(
                "kettle state must be {} bytes, got {}",
                Self::ENCODED_LEN,
                data.len()
            )));
        }
        Ok(Self {
            mode: KettleMode::from_byte(data[0])?,
            target_temperature: data[2],
            is_blocked: data[3] != 0,
            sound: data[4] != 0,
            temperature: data[5],
            color_change_period: u16::from_le_bytes([data[6], data[7]]),
            state: RunState::from_byte(data[8])?,
            boil_time: i16::from(data[13]) - BOIL_TIME_RELATIVE_DEFAULT,
            error: data[15],
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::ENCODED_LEN] {
        let period = self.color_change_period.to_le_bytes();
        let mut out = [0u8; Self::ENCODED_LEN];
        out[0] = self.mode as u8;
        out[2] = self.target_temperature;
        out[3] = u8::from(self.is_blocked);
        out[4] = u8::from(self.sound);
        out[5] = self.temperature;
        out[6] = period[0];
        out[7] = period[1];
        out[8] = self.state as u8;
        out[13] = (self.boil_time + BOIL_TIME_RELATIVE_DEFAULT) as u8;
        out[15] = self.error;
        out
    }
}

/// Counter-framed command engine over the shared command queue.
#[derive(Clone)]
pub struct RedmondProtocol {
    queue: CommandQueue,
    counter: Arc<AtomicU8>,
}

impl RedmondProtocol {
    pub fn new(queue: CommandQueue) -> Self {
        Self {
            queue,
            counter: Arc::new(AtomicU8::new(0)),
        }
    }

    /// Stop the underlying command queue; pending commands resolve as
    /// cancelled.
    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    /// Current counter value; the stored counter advances modulo 101.
    fn next_counter(&self) -> u8 {
        self.counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                Some((c + 1) % COUNTER_MODULO)
            })
            .unwrap_or_default()
    }

    fn frame(counter: u8, command: Command, payload: &[u8]) -> Vec<u8> {
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.push(START_BYTE);
        frame.push(counter);
        frame.push(command as u8);
        frame.extend_from_slice(payload);
        frame.push(END_BYTE);
        frame
    }

    /// Strip and validate the reply framing, returning the payload.
    fn unframe(
        counter: u8,
        command: Command,
        raw: &[u8],
    ) -> std::result::Result<Vec<u8>, ProtocolError> {
        if raw.len() < 4 {
            return Err(ProtocolError::BadFrame(format!(
                "reply too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] != START_BYTE || raw[raw.len() - 1] != END_BYTE {
            return Err(ProtocolError::BadFrame(
                "reply lacks frame markers".to_string(),
            ));
        }
        if raw[1] != counter {
            return Err(ProtocolError::BadFrame(format!(
                "reply counter {} does not match request counter {counter}",
                raw[1]
            )));
        }
        if raw[2] != command as u8 {
            return Err(ProtocolError::BadFrame(format!(
                "reply command {:#04x} does not match request {:#04x}",
                raw[2], command as u8
            )));
        }
        Ok(raw[3..raw.len() - 1].to_vec())
    }

    pub async fn send_command(
        &self,
        command: Command,
        payload: &[u8],
        expect_reply: bool,
    ) -> Result<Vec<u8>> {
        let counter = self.next_counter();
        let frame = Self::frame(counter, command, payload);
        let raw = self
            .queue
            .send(frame, expect_reply, DEFAULT_COMMAND_TIMEOUT)
            .await?;
        if !expect_reply {
            return Ok(Vec::new());
        }
        Ok(Self::unframe(counter, command, &raw)?)
    }

    fn check_success(response: &[u8]) -> std::result::Result<(), ProtocolError> {
        if response.first().copied().unwrap_or(0) == 0 {
            return Err(ProtocolError::ErrorStatus(
                response.first().copied().unwrap_or(0),
            ));
        }
        Ok(())
    }

    fn check_zero_response(response: &[u8]) -> std::result::Result<(), ProtocolError> {
        match response.first().copied() {
            Some(0) => Ok(()),
            other => Err(ProtocolError::ErrorStatus(other.unwrap_or(0xff))),
        }
    }

    /// AUTH exchange with the 8-byte pairing key. The device only answers
    /// AUTH while in pairing mode, so a reply timeout maps to
    /// `NotInPairingMode`; a zero status byte means the key was refused.
    pub async fn login(&self, key: &[u8]) -> Result<()> {
        debug!("logging in...");
        match self.send_command(Command::Auth, key, true).await {
            Ok(response) => {
                if response.first().copied().unwrap_or(0) == 0 {
                    return Err(ProtocolError::AuthRejected.into());
                }
                Ok(())
            }
            Err(BridgeError::Timeout(_)) => Err(ProtocolError::NotInPairingMode.into()),
            Err(err) => Err(err),
        }
    }

    pub async fn get_version(&self) -> Result<(u8, u8)> {
        let response = self.send_command(Command::Version, &[], true).await?;
        if response.len() < 2 {
            return Err(ProtocolError::BadFrame("short version reply".to_string()).into());
        }
        Ok((response[0], response[1]))
    }

    pub async fn run(&self) -> Result<()> {
        debug!("run current mode");
        let response = self
            .send_command(Command::RunCurrentMode, &[], true)
            .await?;
        Ok(Self::check_success(&response)?)
    }

    pub async fn stop(&self) -> Result<()> {
        debug!("stop current mode");
        let response = self
            .send_command(Command::StopCurrentMode, &[], true)
            .await?;
        Ok(Self::check_success(&response)?)
    }

    pub async fn get_mode(&self) -> Result<KettleState> {
        let response = self.send_command(Command::ReadMode, &[], true).await?;
        Ok(KettleState::from_bytes(&response)?)
    }

    pub async fn set_mode(&self, state: &KettleState) -> Result<()> {
        let response = self
            .send_command(Command::WriteMode, &state.to_bytes(), true)
            .await?;
        Ok(Self::check_success(&response)?)
    }

    /// Sync the device clock: local epoch seconds plus the UTC offset.
    pub async fn set_time(&self) -> Result<()> {
        let now = Local::now();
        let offset = now.offset().fix().local_minus_utc();
        let mut payload = Vec::with_capacity(8);
        payload.extend_from_slice(&(now.timestamp() as i32).to_le_bytes());
        payload.extend_from_slice(&offset.to_le_bytes());
        let response = self.send_command(Command::SetTime, &payload, true).await?;
        Ok(Self::check_zero_response(&response)?)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::mpsc;

    use super::*;
    use crate::protocols::queue::FrameSink;

    #[test]
    fn frame_layout() {
        let frame = RedmondProtocol::frame(7, Command::ReadMode, &[0x01, 0x02]);
        assert_eq!(frame, vec![0x55, 7, 0x06, 0x01, 0x02, 0xaa]);
    }

    #[tokio::test]
    async fn counter_wraps_at_modulo() {
        let (tx, _rx_keep) = mpsc::channel(1);
        struct Nop(#[allow(dead_code)] mpsc::Sender<Vec<u8>>);
        #[async_trait]
        impl FrameSink for Nop {
            async fn write_frame(&self, _frame: &[u8]) -> crate::error::Result<()> {
                Ok(())
            }
        }
        let (_ntx, nrx) = mpsc::channel(1);
        let proto = RedmondProtocol::new(CommandQueue::spawn(Arc::new(Nop(tx)), nrx));
        for expected in (0..COUNTER_MODULO).chain([0, 1]) {
            assert_eq!(proto.next_counter(), expected);
        }
    }

    #[test]
    fn unframe_validates_markers_counter_and_command() {
        let ok = RedmondProtocol::unframe(3, Command::ReadMode, &[0x55, 3, 0x06, 0x42, 0xaa]);
        assert_eq!(ok.unwrap(), vec![0x42]);

        let bad_marker =
            RedmondProtocol::unframe(3, Command::ReadMode, &[0x54, 3, 0x06, 0x42, 0xaa]);
        assert!(matches!(bad_marker, Err(ProtocolError::BadFrame(_))));

        let bad_counter =
            RedmondProtocol::unframe(3, Command::ReadMode, &[0x55, 4, 0x06, 0x42, 0xaa]);
        assert!(matches!(bad_counter, Err(ProtocolError::BadFrame(_))));

        let bad_command =
            RedmondProtocol::unframe(3, Command::ReadMode, &[0x55, 3, 0x05, 0x42, 0xaa]);
        assert!(matches!(bad_command, Err(ProtocolError::BadFrame(_))));

        let short = RedmondProtocol::unframe(3, Command::ReadMode, &[0x55, 3]);
        assert!(matches!(short, Err(ProtocolError::BadFrame(_))));
    }

    #[test]
    fn kettle_state_round_trip() {
        let state = KettleState {
            mode: KettleMode::Heat,
            target_temperature: 40,
            is_blocked: false,
            sound: true,
            temperature: 25,
            color_change_period: 0x0f,
            state: RunState::On,
            boil_time: -2,
            error: 0,
        };
        let decoded = KettleState::from_bytes(&state.to_bytes()).unwrap();
        assert_eq!(decoded, state);
    }

    #[test]
    fn kettle_state_decodes_observed_boil_frame() {
        // Observed while boiling: mode=boil, sound on, 20 degrees, running.
        let data = [
            0x00, 0x00, 0x00, 0x00, 0x01, 0x14, 0x0f, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x80,
            0x00, 0x00,
        ];
        let state = KettleState::from_bytes(&data).unwrap();
        assert_eq!(state.mode, KettleMode::Boil);
        assert_eq!(state.temperature, 0x14);
        assert_eq!(state.state, RunState::On);
        assert_eq!(state.boil_time, 0);
    }

    struct Scripted {
        written: Mutex<Vec<Vec<u8>>>,
        replies: mpsc::Sender<Vec<u8>>,
        script: Mutex<Vec<Option<Vec<u8>>>>,
    }

    #[async_trait]
    impl FrameSink for Scripted {
        async fn write_frame(&self, frame: &[u8]) -> crate::error::Result<()> {
            self.written.lock().unwrap().push(frame.to_vec());
            let next = self.script.lock().unwrap().pop().flatten();
            if let Some(mut reply) = next {
                // Echo the request counter into the scripted reply.
                reply[1] = frame[1];
                let _ = self.replies.send(reply).await;
            }
            Ok(())
        }
    }

    fn scripted_protocol(script: Vec<Option<Vec<u8>>>) -> (RedmondProtocol, Arc<Scripted>) {
        let (tx, rx) = mpsc::channel(16);
        let sink = Arc::new(Scripted {
            written: Mutex::new(Vec::new()),
            replies: tx,
            script: Mutex::new(script),
        });
        let proto = RedmondProtocol::new(CommandQueue::spawn(sink.clone(), rx));
        (proto, sink)
    }

    #[tokio::test]
    async fn login_accepts_nonzero_status() {
        let (proto, _sink) =
            scripted_protocol(vec![Some(vec![0x55, 0, Command::Auth as u8, 0x01, 0xaa])]);
        proto.login(&[0xff; 8]).await.unwrap();
    }

    #[tokio::test]
    async fn login_rejects_zero_status() {
        let (proto, _sink) =
            scripted_protocol(vec![Some(vec![0x55, 0, Command::Auth as u8, 0x00, 0xaa])]);
        let err = proto.login(&[0xff; 8]).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::AuthRejected)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn login_timeout_means_not_in_pairing_mode() {
        let (proto, _sink) = scripted_protocol(vec![None]);
        let err = proto.login(&[0xff; 8]).await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::NotInPairingMode)
        ));
    }

    #[tokio::test]
    async fn get_mode_decodes_state() {
        let mut reply = vec![0x55, 0, Command::ReadMode as u8];
        reply.extend_from_slice(&KettleState::default().to_bytes());
        reply.push(0xaa);
        let (proto, sink) = scripted_protocol(vec![Some(reply)]);
        let state = proto.get_mode().await.unwrap();
        assert_eq!(state, KettleState::default());
        assert_eq!(sink.written.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn run_checks_status_byte() {
        let (proto, _sink) = scripted_protocol(vec![Some(vec![
            0x55,
            0,
            Command::RunCurrentMode as u8,
            0x00,
            0xaa,
        ])]);
        let err = proto.run().await.unwrap_err();
        assert!(matches!(
            err,
            BridgeError::Protocol(ProtocolError::ErrorStatus(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn command_timeout_maps_to_timeout() {
        let (proto, _sink) = scripted_protocol(vec![None]);
        let err = proto.get_mode().await.unwrap_err();
        assert!(matches!(err, BridgeError::Timeout(_)));
    }
}
