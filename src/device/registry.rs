use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::{SlotIndex, SlotStatus};

/// Last known state of one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotEntry {
    pub slot: SlotIndex,
    pub status: SlotStatus,
    /// When the device last reported this slot. `None` until scanned.
    pub refreshed_at: Option<DateTime<Utc>>,
}

impl SlotEntry {
    fn unscanned(slot: SlotIndex) -> Self {
        Self { slot, status: SlotStatus::Empty, refreshed_at: None }
    }

    /// Button text, e.g. `Song 3`.
    pub fn label(&self) -> String {
        format!("{} {}", self.status, self.slot.number())
    }

    pub fn is_scanned(&self) -> bool {
        self.refreshed_at.is_some()
    }
}

/// Cached status of all slots, in slot order.
///
/// Rebuilt on every connect. On disconnect the entries are kept as they were
/// but the registry goes offline, meaning none of them can be trusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotRegistry {
    entries: Vec<SlotEntry>,
    port_name: Option<String>,
    online: bool,
}

impl SlotRegistry {
    pub fn new() -> Self {
        Self {
            entries: SlotIndex::all().map(SlotEntry::unscanned).collect(),
            port_name: None,
            online: false,
        }
    }

    /// Fresh, unscanned registry for a new connection.
    pub(crate) fn reset_for(&mut self, port_name: &str) {
        *self = Self::new();
        self.port_name = Some(port_name.to_string());
        self.online = true;
    }

    pub(crate) fn mark_offline(&mut self) {
        self.online = false;
    }

    pub(crate) fn update(&mut self, slot: SlotIndex, status: SlotStatus) {
        let entry = &mut self.entries[slot.index()];
        entry.status = status;
        entry.refreshed_at = Some(Utc::now());
    }

    pub fn get(&self, slot: SlotIndex) -> &SlotEntry {
        &self.entries[slot.index()]
    }

    pub fn status(&self, slot: SlotIndex) -> SlotStatus {
        self.get(slot).status
    }

    pub fn entries(&self) -> &[SlotEntry] {
        &self.entries
    }

    pub fn is_online(&self) -> bool {
        self.online
    }

    pub fn port_name(&self) -> Option<&str> {
        self.port_name.as_deref()
    }

    /// Whether importing into `slot` would overwrite content.
    pub fn is_occupied(&self, slot: SlotIndex) -> bool {
        self.status(slot).is_occupied()
    }

    /// Export and clear only make sense for occupied slots on a live link.
    pub fn has_content(&self, slot: SlotIndex) -> bool {
        self.online && self.is_occupied(slot)
    }

    pub fn scanned_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_scanned()).count()
    }
}

impl Default for SlotRegistry {
    fn default() -> Self {
        Self::new()
    }
}
