//! Protocol for AM43 blind-drive motors (also sold as A-OK, Zemismart).
//!
//! Frames are `[0x9A, command, len, data.., checksum]` where the checksum is
//! the XOR of every preceding byte. Positions on the wire are inverted with
//! respect to the Home Assistant convention (0 = open on the device), so
//! values are flipped in both directions.

use log::debug;

use crate::error::{ProtocolError, Result};
use crate::protocols::queue::{CommandQueue, DEFAULT_COMMAND_TIMEOUT};

pub const FRAME_HEADER: u8 = 0x9a;

const CMD_MOVE: u8 = 0x0a;
const CMD_SET_POSITION: u8 = 0x0d;
const CMD_GET_BATTERY: u8 = 0xa2;
const CMD_GET_POSITION: u8 = 0xa7;
const CMD_GET_ILLUMINANCE: u8 = 0xaa;

const MOVE_STOP: u8 = 0xcc;

const RESPONSE_ACK: u8 = 0x5a;

/// XOR of all bytes; both generated for requests and verified on replies.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

fn frame(command: u8, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 4);
    out.push(FRAME_HEADER);
    out.push(command);
    out.push(data.len() as u8);
    out.extend_from_slice(data);
    out.push(checksum(&out));
    out
}

fn check_reply(raw: &[u8], command: u8) -> std::result::Result<(), ProtocolError> {
    if raw.len() < 4 {
        return Err(ProtocolError::BadFrame(format!(
            "reply too short: {} bytes",
            raw.len()
        )));
    }
    if raw[0] != FRAME_HEADER {
        return Err(ProtocolError::BadFrame(format!(
            "unexpected reply header {:#04x}",
            raw[0]
        )));
    }
    let expected = checksum(&raw[..raw.len() - 1]);
    let actual = raw[raw.len() - 1];
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch {
            expected: u16::from(expected),
            actual: u16::from(actual),
        });
    }
    if raw[1] != command {
        return Err(ProtocolError::BadFrame(format!(
            "reply for command {:#04x}, expected {:#04x}",
            raw[1], command
        )));
    }
    Ok(())
}

/// Device positions are inverted relative to Home Assistant (100 = open).
fn convert_position(value: u8) -> u8 {
    100 - value.min(100)
}

#[derive(Clone)]
pub struct Am43Protocol {
    queue: CommandQueue,
}

impl Am43Protocol {
    pub fn new(queue: CommandQueue) -> Self {
        Self { queue }
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    async fn request(&self, command: u8, data: &[u8]) -> Result<Vec<u8>> {
        let raw = self
            .queue
            .send(frame(command, data), true, DEFAULT_COMMAND_TIMEOUT)
            .await?;
        check_reply(&raw, command)?;
        Ok(raw)
    }

    fn check_ack(raw: &[u8]) -> std::result::Result<(), ProtocolError> {
        match raw.get(3) {
            Some(&RESPONSE_ACK) => Ok(()),
            Some(&status) => Err(ProtocolError::ErrorStatus(status)),
            None => Err(ProtocolError::BadFrame("truncated ack reply".to_string())),
        }
    }

    /// Battery percentage, e.g. `9a a2 05 00 00 00 00 51 6c` -> 0x51.
    pub async fn get_battery(&self) -> Result<u8> {
        let raw = self.request(CMD_GET_BATTERY, &[0x01]).await?;
        raw.get(7)
            .copied()
            .ok_or_else(|| ProtocolError::BadFrame("short battery reply".to_string()).into())
    }

    /// Illuminance in lux; the device reports a raw step of 12.5 lx.
    pub async fn get_illuminance(&self) -> Result<f64> {
        let raw = self.request(CMD_GET_ILLUMINANCE, &[0x01]).await?;
        let step = raw
            .get(4)
            .copied()
            .ok_or_else(|| ProtocolError::BadFrame("short illuminance reply".to_string()))?;
        Ok(f64::from(step) * 12.5)
    }

    /// Current position in the 0..=100 Home Assistant scale.
    pub async fn get_position(&self) -> Result<u8> {
        let raw = self.request(CMD_GET_POSITION, &[0x01]).await?;
        let device_position = raw
            .get(5)
            .copied()
            .ok_or_else(|| ProtocolError::BadFrame("short position reply".to_string()))?;
        Ok(convert_position(device_position))
    }

    pub async fn set_position(&self, position: u8) -> Result<()> {
        debug!("set position {position}");
        let raw = self
            .request(CMD_SET_POSITION, &[convert_position(position)])
            .await?;
        Ok(Self::check_ack(&raw)?)
    }

    pub async fn stop(&self) -> Result<()> {
        debug!("stop movement");
        let raw = self.request(CMD_MOVE, &[MOVE_STOP]).await?;
        Ok(Self::check_ack(&raw)?)
    }
}
