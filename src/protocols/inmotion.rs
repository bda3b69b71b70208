//! Protocol for InMotion electric unicycles (V5/V8/V10 families).
//!
//! Frames are delimited by the markers `AA AA` and `55 55`; any body byte
//! equal to a marker byte or to the escape byte 0xA5 is escaped with 0xA5
//! before transmission and unescaped on receipt. The body carries a 32-bit
//! command id, a length byte, channel/format/frame-type bytes and an 8-byte
//! payload, followed by an additive checksum (sum mod 256) computed over the
//! unescaped body.

use log::debug;

use crate::error::{ProtocolError, Result};
use crate::protocols::queue::{CommandQueue, DEFAULT_COMMAND_TIMEOUT};

pub const MAGIC_START: [u8; 2] = [0xaa, 0xaa];
pub const MAGIC_END: [u8; 2] = [0x55, 0x55];
pub const ESCAPE_BYTE: u8 = 0xa5;

const DATA_FRAME: u8 = 0;
const DEFAULT_CHANNEL: u8 = 5;

/// Voltage divisor: the wheel reports centivolts.
const VOLTAGE_SCALE: f64 = 100.0;
/// Speed calculation factor for the V8 family.
const SPEED_FACTOR: f64 = 3812.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum CommandId {
    GetFastInfo = 0x0f55_0113,
    Light = 0x0f55_010d,
}

/// Escape marker bytes occurring inside a frame body.
pub fn escape(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len());
    for &byte in body {
        if byte == 0xaa || byte == 0x55 || byte == ESCAPE_BYTE {
            out.push(ESCAPE_BYTE);
        }
        out.push(byte);
    }
    out
}

/// Inverse of [`escape`]: a 0xA5 prefix makes the next byte literal.
pub fn unescape(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut escaped = false;
    for &byte in data {
        if !escaped && byte == ESCAPE_BYTE {
            escaped = true;
            continue;
        }
        escaped = false;
        out.push(byte);
    }
    out
}

/// Additive checksum over the unescaped body.
pub fn checksum(body: &[u8]) -> u8 {
    body.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

fn body(id: CommandId, frame_type: u8, payload: &[u8; 8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    out.extend_from_slice(&(id as u32).to_le_bytes());
    out.push(payload.len() as u8);
    out.push(DEFAULT_CHANNEL);
    out.push(frame_type);
    out.extend_from_slice(payload);
    out
}

fn frame(id: CommandId, frame_type: u8, payload: &[u8; 8]) -> Vec<u8> {
    let mut inner = body(id, frame_type, payload);
    inner.push(checksum(&inner));
    let mut out = Vec::with_capacity(inner.len() + 6);
    out.extend_from_slice(&MAGIC_START);
    out.extend_from_slice(&escape(&inner));
    out.extend_from_slice(&MAGIC_END);
    out
}

/// Strip markers, unescape and verify the trailing checksum, returning the
/// raw body without it.
fn unframe(raw: &[u8]) -> std::result::Result<Vec<u8>, ProtocolError> {
    if raw.len() < 6 || raw[..2] != MAGIC_START || raw[raw.len() - 2..] != MAGIC_END {
        return Err(ProtocolError::BadFrame(
            "reply lacks frame markers".to_string(),
        ));
    }
    let mut inner = unescape(&raw[2..raw.len() - 2]);
    let Some(actual) = inner.pop() else {
        return Err(ProtocolError::BadFrame("empty frame body".to_string()));
    };
    let expected = checksum(&inner);
    if expected != actual {
        return Err(ProtocolError::ChecksumMismatch {
            expected: u16::from(expected),
            actual: u16::from(actual),
        });
    }
    Ok(inner)
}

fn int_le(data: &[u8], offset: usize) -> Option<i32> {
    data.get(offset..offset + 4)
        .map(|b| i32::from_le_bytes([b[0], b[1], b[2], b[3]]))
}

/// Live telemetry snapshot decoded from a fast-info reply.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WheelSnapshot {
    pub speed_kmh: f64,
    pub voltage: f64,
    pub battery: u8,
    pub temperature: i8,
}

impl WheelSnapshot {
    /// The extended-data block starts after the body header (command id,
    /// length, channel, format, frame type mirror the request layout).
    const EX_DATA_OFFSET: usize = 8;

    fn from_body(inner: &[u8]) -> std::result::Result<Self, ProtocolError> {
        let ex_data = inner
            .get(Self::EX_DATA_OFFSET..)
            .ok_or_else(|| ProtocolError::BadFrame("short fast-info reply".to_string()))?;
        let speed_a = int_le(ex_data, 12);
        let speed_b = int_le(ex_data, 16);
        let voltage_raw = int_le(ex_data, 24);
        let (Some(speed_a), Some(speed_b), Some(voltage_raw)) = (speed_a, speed_b, voltage_raw)
        else {
            return Err(ProtocolError::BadFrame(
                "truncated fast-info telemetry".to_string(),
            ));
        };
        let speed_kmh =
            ((f64::from(speed_a) + f64::from(speed_b)) / (SPEED_FACTOR * 2.0)).abs() * 3.6;
        let voltage = f64::from(voltage_raw) / VOLTAGE_SCALE;
        let temperature = ex_data.get(32).copied().unwrap_or(0) as i8;
        Ok(Self {
            speed_kmh,
            voltage,
            battery: battery_from_voltage(voltage),
            temperature,
        })
    }
}

/// Battery estimate from pack voltage (V8-family discharge curve).
pub fn battery_from_voltage(volts: f64) -> u8 {
    if volts >= 82.5 {
        100
    } else if volts > 68.0 {
        (((volts - 68.0) / 14.5) * 100.0) as u8
    } else {
        0
    }
}

#[derive(Clone)]
pub struct InmotionProtocol {
    queue: CommandQueue,
}

impl InmotionProtocol {
    pub fn new(queue: CommandQueue) -> Self {
        Self { queue }
    }

    pub fn shutdown(&self) {
        self.queue.shutdown();
    }

    pub async fn get_fast_info(&self) -> Result<WheelSnapshot> {
        let raw = self
            .queue
            .send(
                frame(CommandId::GetFastInfo, DATA_FRAME, &[0xff; 8]),
                true,
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        let inner = unframe(&raw)?;
        Ok(WheelSnapshot::from_body(&inner)?)
    }

    pub async fn set_light(&self, on: bool) -> Result<()> {
        debug!("set light {on}");
        let mut payload = [0u8; 8];
        payload[0] = u8::from(on);
        self.queue
            .send(
                frame(CommandId::Light, DATA_FRAME, &payload),
                false,
                DEFAULT_COMMAND_TIMEOUT,
            )
            .await?;
        Ok(())
    }
}
