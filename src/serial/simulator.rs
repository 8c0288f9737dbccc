//! In-memory Arpmini that speaks the slot protocol, for tests and dry runs.
use std::collections::VecDeque;
use std::io::{Error as IoError, ErrorKind};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use super::io::SerialPortIO;
use super::protocol::{SlotStatus, ACK, NUM_SLOTS, OP_EXPORT, OP_IMPORT, OP_STATUS, SONG_SIZE, TERMINAL};
use super::{Result, SerialError};

#[derive(Debug, Clone)]
struct StoredSlot {
    status: SlotStatus,
    content: Vec<u8>,
}

impl Default for StoredSlot {
    fn default() -> Self {
        Self { status: SlotStatus::Empty, content: vec![0u8; SONG_SIZE] }
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    Header(u8),
    Trigger { opcode: u8, slot: Option<usize> },
    Receiving { slot: Option<usize>, buffer: Vec<u8> },
}

#[derive(Debug)]
struct DeviceState {
    slots: Vec<StoredSlot>,
    phase: Phase,
    outbox: VecDeque<u8>,
    written: Vec<u8>,
    plugged: bool,
    muted: bool,
    drop_terminal: bool,
    corrupt_ack_at: Option<usize>,
    import_status: SlotStatus,
    latency: Duration,
    status_queries: usize,
}

impl DeviceState {
    fn new() -> Self {
        Self {
            slots: vec![StoredSlot::default(); NUM_SLOTS],
            phase: Phase::Idle,
            outbox: VecDeque::new(),
            written: Vec::new(),
            plugged: true,
            muted: false,
            drop_terminal: false,
            corrupt_ack_at: None,
            import_status: SlotStatus::Song,
            latency: Duration::ZERO,
            status_queries: 0,
        }
    }

    fn receive(&mut self, byte: u8) {
        let phase = std::mem::replace(&mut self.phase, Phase::Idle);
        self.phase = match phase {
            Phase::Idle => match byte {
                OP_STATUS | OP_EXPORT | OP_IMPORT => Phase::Header(byte),
                _ => Phase::Idle,
            },
            Phase::Header(opcode) => {
                let slot = (byte as usize).checked_sub(1).filter(|i| *i < NUM_SLOTS);
                if opcode == OP_IMPORT {
                    Phase::Receiving { slot, buffer: Vec::with_capacity(SONG_SIZE) }
                } else {
                    Phase::Trigger { opcode, slot }
                }
            }
            Phase::Trigger { opcode, slot } => {
                self.answer(opcode, slot);
                Phase::Idle
            }
            Phase::Receiving { slot, mut buffer } => self.receive_payload(slot, &mut buffer, byte)
                .unwrap_or(Phase::Receiving { slot, buffer }),
        };
    }

    fn answer(&mut self, opcode: u8, slot: Option<usize>) {
        let stored = slot.map(|i| self.slots[i].clone()).unwrap_or_default();
        if opcode == OP_STATUS {
            self.status_queries += 1;
            self.outbox.extend([stored.status.code(), OP_STATUS]);
        } else {
            self.outbox.extend(stored.content.iter().copied());
            if !self.drop_terminal {
                self.outbox.push_back(TERMINAL);
            }
        }
    }

    /// Returns the next phase once the transfer ends, `None` while it continues.
    fn receive_payload(&mut self, slot: Option<usize>, buffer: &mut Vec<u8>, byte: u8) -> Option<Phase> {
        if buffer.len() == 1 && buffer[0] == 0x00 && byte == TERMINAL {
            if let Some(i) = slot {
                self.slots[i] = StoredSlot::default();
            }
            if !self.drop_terminal {
                self.outbox.push_back(TERMINAL);
            }
            return Some(Phase::Idle);
        }

        let index = buffer.len();
        buffer.push(byte);
        if self.corrupt_ack_at == Some(index) {
            self.corrupt_ack_at = None;
            self.outbox.push_back(0x00);
            return Some(Phase::Idle);
        }
        self.outbox.push_back(ACK);

        if buffer.len() < SONG_SIZE {
            return None;
        }
        if let Some(i) = slot {
            self.slots[i] = StoredSlot { status: self.import_status, content: buffer.clone() };
        }
        if !self.drop_terminal {
            self.outbox.push_back(TERMINAL);
        }
        Some(Phase::Idle)
    }
}

/// Simulated device. Clones share the same device, so a test can keep one
/// clone for inspection and hand another to a [`super::SerialInterface`].
///
/// A transfer whose first two bytes are `0x00 0xFF` is taken for a clear, the
/// same ambiguity the firmware has.
#[derive(Debug, Clone)]
pub struct SimulatedArpmini {
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatedArpmini {
    pub fn new() -> Self {
        Self { state: Arc::new(Mutex::new(DeviceState::new())) }
    }

    pub fn boxed(&self) -> Box<dyn SerialPortIO> {
        Box::new(self.clone())
    }

    fn lock(&self) -> MutexGuard<'_, DeviceState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Preload a slot. `content` is padded or cut to the song size.
    pub fn set_slot(&self, index: usize, status: SlotStatus, content: &[u8]) {
        let mut stored = StoredSlot { status, content: content.to_vec() };
        stored.content.resize(SONG_SIZE, 0);
        self.lock().slots[index] = stored;
    }

    pub fn slot_status(&self, index: usize) -> SlotStatus {
        self.lock().slots[index].status
    }

    pub fn slot_content(&self, index: usize) -> Vec<u8> {
        self.lock().slots[index].content.clone()
    }

    /// Status the device assigns to a slot after a completed import.
    pub fn set_import_status(&self, status: SlotStatus) {
        self.lock().import_status = status;
    }

    /// Answer the payload byte at `index` of the next import with `0x00`
    /// instead of the ack, then drop back to idle.
    pub fn corrupt_ack_at(&self, index: usize) {
        self.lock().corrupt_ack_at = Some(index);
    }

    /// Omit the trailing `0xFF` of exports, imports and clears.
    pub fn drop_terminal(&self, drop: bool) {
        self.lock().drop_terminal = drop;
    }

    /// Swallow all input and never answer.
    pub fn mute_replies(&self, muted: bool) {
        self.lock().muted = muted;
    }

    /// Delay applied to every read.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Pull the cable: every later call on the transport fails.
    pub fn unplug(&self) {
        self.lock().plugged = false;
    }

    pub fn is_plugged(&self) -> bool {
        self.lock().plugged
    }

    /// Every byte the host has written so far.
    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    pub fn clear_log(&self) {
        self.lock().written.clear();
    }

    pub fn status_queries(&self) -> usize {
        self.lock().status_queries
    }

    fn unplugged() -> SerialError {
        SerialError::IoError(IoError::new(ErrorKind::BrokenPipe, "device unplugged"))
    }
}

impl Default for SimulatedArpmini {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SerialPortIO for SimulatedArpmini {
    async fn send_data(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.lock();
        if !state.plugged {
            return Err(Self::unplugged());
        }
        state.written.extend_from_slice(data);
        if !state.muted {
            for &byte in data {
                state.receive(byte);
            }
        }
        Ok(())
    }

    async fn read_data(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize> {
        let latency = self.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.lock();
        if !state.plugged {
            return Err(Self::unplugged());
        }
        let n = buf.len().min(state.outbox.len());
        for (slot, byte) in buf.iter_mut().zip(state.outbox.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }

    async fn flush(&mut self) -> Result<()> {
        if self.lock().plugged {
            Ok(())
        } else {
            Err(Self::unplugged())
        }
    }

    fn bytes_to_read(&self) -> Result<u32> {
        let state = self.lock();
        if state.plugged {
            Ok(state.outbox.len() as u32)
        } else {
            Err(Self::unplugged())
        }
    }
}
