use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::serial::interface::{DeviceFilter, ARPMINI_PID, ARPMINI_VID, BAUD_RATE};

/// Runtime settings, loaded from a JSON file. Missing fields take defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorSettings {
    pub vendor_id: u16,
    pub product_id: u16,
    pub label_suffix: String,
    pub baud_rate: u32,
    pub read_timeout_ms: u64,
    pub liveness_interval_ms: u64,
    pub port_refresh_interval_ms: u64,
}

impl Default for EditorSettings {
    fn default() -> Self {
        Self {
            vendor_id: ARPMINI_VID,
            product_id: ARPMINI_PID,
            label_suffix: "Arpmini".to_string(),
            baud_rate: BAUD_RATE,
            read_timeout_ms: 1000,
            liveness_interval_ms: 1000,
            port_refresh_interval_ms: 2000,
        }
    }
}

impl EditorSettings {
    /// Load from `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            log::debug!("No settings file at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings from {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("Invalid settings file {}", path.display()))
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(self.baud_rate > 0, "baud_rate must be positive");
        anyhow::ensure!(self.read_timeout_ms > 0, "read_timeout_ms must be positive");
        anyhow::ensure!(self.liveness_interval_ms > 0, "liveness_interval_ms must be positive");
        anyhow::ensure!(self.port_refresh_interval_ms > 0, "port_refresh_interval_ms must be positive");
        Ok(())
    }

    pub fn device_filter(&self) -> DeviceFilter {
        DeviceFilter {
            vid: self.vendor_id,
            pid: self.product_id,
            label_suffix: self.label_suffix.clone(),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    pub fn port_refresh_interval(&self) -> Duration {
        Duration::from_millis(self.port_refresh_interval_ms)
    }
}
