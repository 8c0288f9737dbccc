use std::fmt;
use serde::{Deserialize, Serialize};

use super::{ProtocolFault, Result, SerialError, SerialInterface};

pub const NUM_SLOTS: usize = 60;
/// 8 tracks x 32 notes plus 32 configuration bytes
pub const SONG_SIZE: usize = 288;

pub const OP_STATUS: u8 = 0xFC;
pub const OP_EXPORT: u8 = 0xFD;
pub const OP_IMPORT: u8 = 0xFE;
pub const ACK: u8 = 0xFE;
pub const TERMINAL: u8 = 0xFF;
const TRIGGER: u8 = 0x00;

/// Zero-based slot position, always below [`NUM_SLOTS`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SlotIndex(u8);

impl SlotIndex {
    pub fn new(index: usize) -> Result<Self> {
        if index < NUM_SLOTS {
            Ok(Self(index as u8))
        } else {
            Err(SerialError::InvalidSlot(index))
        }
    }

    /// From the 1-based number shown to users and used on the wire.
    pub fn from_number(number: usize) -> Result<Self> {
        match number.checked_sub(1) {
            Some(index) => Self::new(index).map_err(|_| SerialError::InvalidSlot(number)),
            None => Err(SerialError::InvalidSlot(number)),
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn number(self) -> u8 {
        self.0 + 1
    }

    pub fn all() -> impl Iterator<Item = SlotIndex> {
        (0..NUM_SLOTS as u8).map(SlotIndex)
    }
}

impl fmt::Display for SlotIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.number())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    #[default]
    Empty,
    Song,
    Drum,
}

impl SlotStatus {
    /// Unknown codes collapse to `Empty`.
    pub fn from_code(code: u8) -> Self {
        match code {
            1 => SlotStatus::Song,
            2 => SlotStatus::Drum,
            _ => SlotStatus::Empty,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            SlotStatus::Empty => 0,
            SlotStatus::Song => 1,
            SlotStatus::Drum => 2,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SlotStatus::Empty => "Empty",
            SlotStatus::Song => "Song",
            SlotStatus::Drum => "Drum",
        }
    }

    pub fn is_occupied(self) -> bool {
        self != SlotStatus::Empty
    }
}

impl fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque slot content. Construction enforces the exact length.
#[derive(Clone, PartialEq, Eq)]
pub struct SongBlob(Box<[u8; SONG_SIZE]>);

impl SongBlob {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bytes: [u8; SONG_SIZE] = data.try_into().map_err(|_| SerialError::Validation {
            expected: SONG_SIZE,
            actual: data.len(),
        })?;
        Ok(Self(Box::new(bytes)))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0[..]
    }
}

impl TryFrom<&[u8]> for SongBlob {
    type Error = SerialError;

    fn try_from(data: &[u8]) -> Result<Self> {
        Self::from_bytes(data)
    }
}

impl TryFrom<Vec<u8>> for SongBlob {
    type Error = SerialError;

    fn try_from(data: Vec<u8>) -> Result<Self> {
        Self::from_bytes(&data)
    }
}

impl AsRef<[u8]> for SongBlob {
    fn as_ref(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl fmt::Debug for SongBlob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SongBlob({} bytes, head {:02X?})", SONG_SIZE, &self.0[..8])
    }
}

/// Arpmini slot protocol.
///
/// Every exchange opens with `[opcode, slot number]`, optionally followed by a
/// trigger byte. Import and clear then walk a byte-by-byte handshake where
/// each written byte must be answered by one exact ack byte; the first
/// mismatch aborts the operation and leaves the slot as the device has it.
pub struct SlotProtocol {
    interface: SerialInterface,
}

impl SlotProtocol {
    pub fn new(interface: SerialInterface) -> Self {
        Self { interface }
    }

    /// Best-effort status probe. Any failure reads as `Empty`.
    pub async fn query_status(&mut self, slot: SlotIndex) -> SlotStatus {
        match self.try_query_status(slot).await {
            Ok(status) => status,
            Err(e) => {
                log::debug!("Status query for {} failed: {}", slot, e);
                SlotStatus::Empty
            }
        }
    }

    /// Status probe that still reports link failures, so a scan can stop
    /// instead of recording them as `Empty`. Malformed replies read as `Empty`.
    pub async fn try_query_status(&mut self, slot: SlotIndex) -> Result<SlotStatus> {
        self.send_header(OP_STATUS, slot, true).await?;
        let reply = self.interface.read_bytes(2).await?;

        if reply.len() == 2 && reply[1] == OP_STATUS {
            Ok(SlotStatus::from_code(reply[0]))
        } else {
            log::debug!("Unexpected status reply for {}: {:02X?}", slot, reply);
            Ok(SlotStatus::Empty)
        }
    }

    /// Write `data` into `slot`, then re-query the slot. Returns the status
    /// the device reports afterwards.
    pub async fn import(&mut self, slot: SlotIndex, data: &[u8]) -> Result<SlotStatus> {
        let blob = SongBlob::from_bytes(data)?;
        self.import_blob(slot, &blob).await
    }

    pub async fn import_blob(&mut self, slot: SlotIndex, blob: &SongBlob) -> Result<SlotStatus> {
        self.send_header(OP_IMPORT, slot, false).await?;

        let steps = blob.as_bytes().iter().map(|&byte| (byte, ACK));
        self.handshake(steps, |index, received| ProtocolFault::BadTransferAck { index, received })
            .await?;
        self.expect_marker(TERMINAL, |received| ProtocolFault::MissingFinalConfirmation { received })
            .await?;

        log::info!("Imported {} bytes into {}", SONG_SIZE, slot);
        Ok(self.query_status(slot).await)
    }

    /// Read the content of `slot`. Does not change anything on the device.
    pub async fn export(&mut self, slot: SlotIndex) -> Result<SongBlob> {
        self.send_header(OP_EXPORT, slot, true).await?;
        let data = self.interface.read_bytes(SONG_SIZE + 1).await?;

        match data.split_last() {
            Some((&TERMINAL, payload)) if payload.len() == SONG_SIZE => {
                log::info!("Exported {}", slot);
                SongBlob::from_bytes(payload)
            }
            _ => {
                let fault = ProtocolFault::IncompleteExport {
                    received_len: data.len(),
                    terminal: data.last().copied(),
                };
                log::warn!("Export of {} failed: {}", slot, fault);
                Err(fault.into())
            }
        }
    }

    /// Erase `slot`: an import of the single byte `0x00` closed by an
    /// explicit terminal marker that the device echoes back.
    pub async fn clear(&mut self, slot: SlotIndex) -> Result<SlotStatus> {
        self.send_header(OP_IMPORT, slot, false).await?;
        self.handshake([(0x00, ACK)], |_, received| ProtocolFault::ZeroByteAckMissing { received })
            .await?;
        self.handshake([(TERMINAL, TERMINAL)], |_, received| ProtocolFault::FinalAckMissing { received })
            .await?;

        log::info!("Cleared {}", slot);
        Ok(self.query_status(slot).await)
    }

    async fn send_header(&mut self, opcode: u8, slot: SlotIndex, trigger: bool) -> Result<()> {
        let header = [opcode, slot.number(), TRIGGER];
        let len = if trigger { 3 } else { 2 };
        log::debug!("-> {:02X?}", &header[..len]);
        self.interface.write_bytes(&header[..len]).await
    }

    async fn read_byte(&mut self) -> Result<Option<u8>> {
        let reply = self.interface.read_bytes(1).await?;
        Ok(reply.first().copied())
    }

    /// Write each byte and require its paired ack, stopping at the first
    /// violation. `fault` builds the error from the failing step index and
    /// whatever was received (`None` on timeout).
    async fn handshake<I, F>(&mut self, steps: I, fault: F) -> Result<()>
    where
        I: IntoIterator<Item = (u8, u8)>,
        F: Fn(usize, Option<u8>) -> ProtocolFault,
    {
        for (index, (byte, expected)) in steps.into_iter().enumerate() {
            self.interface.write_bytes(&[byte]).await?;
            let received = self.read_byte().await?;
            if received != Some(expected) {
                let fault = fault(index, received);
                log::warn!("Handshake aborted: {}", fault);
                return Err(fault.into());
            }
        }
        Ok(())
    }

    async fn expect_marker<F>(&mut self, expected: u8, fault: F) -> Result<()>
    where
        F: FnOnce(Option<u8>) -> ProtocolFault,
    {
        let received = self.read_byte().await?;
        if received == Some(expected) {
            Ok(())
        } else {
            let fault = fault(received);
            log::warn!("Handshake aborted: {}", fault);
            Err(fault.into())
        }
    }

    pub fn interface(&self) -> &SerialInterface {
        &self.interface
    }

    pub fn interface_mut(&mut self) -> &mut SerialInterface {
        &mut self.interface
    }
}
