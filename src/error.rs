//! Error taxonomy for the bridge.
//! Leaf protocol code raises typed errors; the per-device supervisor is the
//! single place that turns them into retry/backoff/adapter-restart decisions.

use thiserror::Error;

/// Vendor-protocol level failures. These indicate a programming, pairing or
/// configuration issue rather than a flaky link, and carry enough detail for
/// an operator to act on.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    BadFrame(String),
    #[error("checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    ChecksumMismatch { expected: u16, actual: u16 },
    #[error("device reported error status {0:#04x}")]
    ErrorStatus(u8),
    #[error("authentication rejected, check the pairing key")]
    AuthRejected,
    #[error("device is not in pairing mode")]
    NotInPairingMode,
}

/// Top-level error type used throughout the bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// An operation exceeded its deadline. Always recoverable; retried per
    /// the supervisor's backoff policy.
    #[error("{0} timed out")]
    Timeout(String),
    /// The BLE stack reports the address unreachable. The expected steady
    /// state for intermittently-advertising peripherals; tracked by its own
    /// failure counter.
    #[error("device {0} not found")]
    DeviceNotFound(String),
    /// BLE stack or adapter level failure.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("mqtt error: {0}")]
    Mqtt(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
    /// Cooperative shutdown. Never counts as a failure and never triggers
    /// an adapter restart.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// BlueZ/D-Bus error strings that indicate a sick adapter rather than a sick
/// peripheral. Connections failing this way warrant an adapter restart.
const HARDWARE_FAULT_MARKERS: &[&str] = &[
    "org.freedesktop.DBus.Error.ServiceUnknown",
    "org.freedesktop.DBus.Error.NoReply",
    "org.freedesktop.DBus.Error.AccessDenied",
    "org.bluez.Error.Failed: Connection aborted",
    "org.bluez.Error.NotReady",
    "org.bluez.Error.InProgress",
];

/// How the supervisor accounts a failed cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Device invisible/unreachable: increments `missing_device_count`.
    MissingDevice,
    /// Anything else: increments `failure_count`.
    Other,
}

impl BridgeError {
    pub fn is_hardware_fault(&self) -> bool {
        match self {
            BridgeError::Transport(msg) => {
                HARDWARE_FAULT_MARKERS.iter().any(|m| msg.contains(m))
            }
            _ => false,
        }
    }

    /// Classify this error for the supervisor's failure counters.
    /// Must not be called for `Cancelled`, which is not a failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            BridgeError::Timeout(_) | BridgeError::DeviceNotFound(_) => {
                FailureKind::MissingDevice
            }
            _ => FailureKind::Other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_fault_detected_in_transport_errors() {
        let err = BridgeError::Transport(
            "le-connection failed: org.bluez.Error.NotReady".to_string(),
        );
        assert!(err.is_hardware_fault());

        let err = BridgeError::Transport("connection reset by peer".to_string());
        assert!(!err.is_hardware_fault());

        // Only transport errors can be hardware faults.
        let err = BridgeError::Mqtt("org.bluez.Error.NotReady".to_string());
        assert!(!err.is_hardware_fault());
    }

    #[test]
    fn failure_classification() {
        assert_eq!(
            BridgeError::Timeout("connect".into()).failure_kind(),
            FailureKind::MissingDevice
        );
        assert_eq!(
            BridgeError::DeviceNotFound("AA:BB:CC:DD:EE:FF".into()).failure_kind(),
            FailureKind::MissingDevice
        );
        assert_eq!(
            BridgeError::Transport("boom".into()).failure_kind(),
            FailureKind::Other
        );
        assert_eq!(
            BridgeError::Protocol(ProtocolError::AuthRejected).failure_kind(),
            FailureKind::Other
        );
    }
}
