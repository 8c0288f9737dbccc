pub mod liveness;
pub mod manager;
pub mod models;
pub mod port_monitor;
pub mod registry;

pub use manager::DeviceManager;
pub use models::*;
pub use registry::{SlotEntry, SlotRegistry};

use crate::serial::FailureKind;

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("No Arpmini found")]
    NoCandidates,

    #[error("Device already connected")]
    AlreadyConnected,

    #[error("Device not connected")]
    NotConnected,

    #[error("Serial communication error: {0}")]
    SerialError(#[from] crate::serial::SerialError),
}

impl DeviceError {
    pub fn kind(&self) -> FailureKind {
        match self {
            DeviceError::SerialError(e) => e.kind(),
            DeviceError::NoCandidates | DeviceError::AlreadyConnected | DeviceError::NotConnected => {
                FailureKind::Connection
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, DeviceError>;
