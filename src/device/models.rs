use serde::{Deserialize, Serialize};

// Re-export serial protocol models
pub use crate::serial::protocol::{SlotIndex, SlotStatus, SongBlob, NUM_SLOTS, SONG_SIZE};
pub use crate::serial::PortCandidate;

/// Device connection state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error(String),
}

/// Notifications for whoever renders the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    Connected { port_name: String },
    SlotUpdated { slot: SlotIndex, status: SlotStatus },
    ScanCompleted { scanned: usize },
    ScanInterrupted { scanned: usize },
    /// The liveness probe failed; a `Disconnected` follows.
    DeviceLost { port_name: String },
    Disconnected { port_name: String },
}
