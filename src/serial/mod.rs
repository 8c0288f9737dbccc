pub mod interface;
pub mod io;
pub mod protocol;
pub mod simulator;

pub use interface::{DeviceFilter, SerialInterface};
pub use io::{NativePort, SerialPortIO};
pub use protocol::SlotProtocol;
pub use simulator::SimulatedArpmini;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialDeviceInfo {
    pub port_name: String,
    pub vid: u16,
    pub pid: u16,
    pub serial_number: Option<String>,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
}

/// A connectable port as offered to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortCandidate {
    pub label: String,
    pub port_name: String,
}

/// Coarse classification used by callers to tell failures apart:
/// nothing was sent, the slot may be inconsistent, or the link is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureKind {
    Validation,
    Connection,
    Protocol,
    DeviceLost,
}

/// Handshake violations. The wire may have been partially written when one
/// of these is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolFault {
    #[error("bad ack during transfer at byte {index} (received {received:02X?})")]
    BadTransferAck { index: usize, received: Option<u8> },

    #[error("missing final confirmation (received {received:02X?})")]
    MissingFinalConfirmation { received: Option<u8> },

    #[error("ack not received after zero byte (received {received:02X?})")]
    ZeroByteAckMissing { received: Option<u8> },

    #[error("final ack not received (received {received:02X?})")]
    FinalAckMissing { received: Option<u8> },

    #[error("incomplete or invalid device response ({received_len} bytes, terminal {terminal:02X?})")]
    IncompleteExport { received_len: usize, terminal: Option<u8> },
}

#[derive(Debug, thiserror::Error)]
pub enum SerialError {
    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid song size: expected {expected} bytes, got {actual}")]
    Validation { expected: usize, actual: usize },

    #[error("Invalid slot index: {0}")]
    InvalidSlot(usize),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolFault),

    #[error("Device lost")]
    DeviceLost,

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialport error: {0}")]
    SerialportError(#[from] serialport::Error),
}

impl SerialError {
    pub fn kind(&self) -> FailureKind {
        match self {
            SerialError::Validation { .. } | SerialError::InvalidSlot(_) => FailureKind::Validation,
            SerialError::Protocol(_) => FailureKind::Protocol,
            SerialError::DeviceLost => FailureKind::DeviceLost,
            SerialError::PortNotFound(_)
            | SerialError::ConnectionFailed(_)
            | SerialError::NotConnected
            | SerialError::IoError(_)
            | SerialError::SerialportError(_) => FailureKind::Connection,
        }
    }
}

pub type Result<T> = std::result::Result<T, SerialError>;
