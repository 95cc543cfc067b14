//! DFU transfer settings with persistence.
//!
//! This module provides:
//! - `DfuSettings` struct holding the user-tunable transfer parameters
//! - Persistence to a JSON file in the app data directory
//!
//! ## Extensibility
//!
//! To add a new setting:
//! 1. Add the field to `DfuSettings` with a `#[serde(default = ...)]` function
//! 2. Add range checks to `validate()`
//! 3. Cover the new default in the settings tests

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dfu::config::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECT_TIMEOUT_MS, DEFAULT_EVENT_QUEUE_CAPACITY,
    DEFAULT_LEGACY_PACING, DEFAULT_LEGACY_RECEIPT_CHECK_INTERVAL, DEFAULT_LEGACY_RECEIPT_INTERVAL,
    DEFAULT_PACING, DEFAULT_RESPONSE_TIMEOUT_MS, MAX_LEGACY_RECEIPT_CHECK_INTERVAL,
};
use crate::dfu::{DfuError, DfuResult};

/// User-tunable DFU transfer parameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DfuSettings {
    /// Time to wait for each control point response. `None` waits forever.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: Option<u64>,

    /// Time to wait for connection and service discovery.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Secure DFU data write size, capped by the transport MTU.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,

    /// Pause between Secure DFU data writes.
    #[serde(default = "default_pacing_ms")]
    pub pacing_ms: u64,

    /// Pause between legacy slice writes.
    #[serde(default = "default_legacy_pacing_ms")]
    pub legacy_pacing_ms: u64,

    /// Receipt interval requested from legacy bootloaders, in slices.
    #[serde(default = "default_legacy_receipt_interval")]
    pub legacy_receipt_interval: u16,

    /// Slices sent between legacy receipt checks.
    #[serde(default = "default_legacy_receipt_check_interval")]
    pub legacy_receipt_check_interval: usize,

    /// Send Receipt Notification Set(0) before the Secure DFU init select.
    #[serde(default = "default_true")]
    pub disable_receipt_notifications: bool,

    /// Capacity to pass to `event_channel` when building the transport queue.
    #[serde(default = "default_event_queue_capacity")]
    pub event_queue_capacity: usize,
}

fn default_response_timeout_ms() -> Option<u64> {
    Some(DEFAULT_RESPONSE_TIMEOUT_MS)
}

fn default_connect_timeout_ms() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_chunk_size() -> usize {
    DEFAULT_CHUNK_SIZE
}

fn default_pacing_ms() -> u64 {
    DEFAULT_PACING.as_millis() as u64
}

fn default_legacy_pacing_ms() -> u64 {
    DEFAULT_LEGACY_PACING.as_millis() as u64
}

fn default_legacy_receipt_interval() -> u16 {
    DEFAULT_LEGACY_RECEIPT_INTERVAL
}

fn default_legacy_receipt_check_interval() -> usize {
    DEFAULT_LEGACY_RECEIPT_CHECK_INTERVAL
}

fn default_true() -> bool {
    true
}

fn default_event_queue_capacity() -> usize {
    DEFAULT_EVENT_QUEUE_CAPACITY
}

impl Default for DfuSettings {
    fn default() -> Self {
        Self {
            response_timeout_ms: default_response_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            chunk_size: default_chunk_size(),
            pacing_ms: default_pacing_ms(),
            legacy_pacing_ms: default_legacy_pacing_ms(),
            legacy_receipt_interval: default_legacy_receipt_interval(),
            legacy_receipt_check_interval: default_legacy_receipt_check_interval(),
            disable_receipt_notifications: true,
            event_queue_capacity: default_event_queue_capacity(),
        }
    }
}

impl DfuSettings {
    /// Reject values that would stall or break a transfer.
    pub fn validate(&self) -> DfuResult<()> {
        let zero = [
            ("chunkSize", self.chunk_size == 0),
            ("legacyReceiptInterval", self.legacy_receipt_interval == 0),
            (
                "legacyReceiptCheckInterval",
                self.legacy_receipt_check_interval == 0,
            ),
            ("eventQueueCapacity", self.event_queue_capacity == 0),
            ("connectTimeoutMs", self.connect_timeout_ms == 0),
            ("responseTimeoutMs", self.response_timeout_ms == Some(0)),
        ];

        if let Some((name, _)) = zero.iter().find(|(_, is_zero)| *is_zero) {
            return Err(DfuError::InvalidSettings {
                reason: format!("{} must be greater than zero", name),
            });
        }

        if self.legacy_receipt_check_interval > MAX_LEGACY_RECEIPT_CHECK_INTERVAL {
            return Err(DfuError::InvalidSettings {
                reason: format!(
                    "legacyReceiptCheckInterval must be at most {}",
                    MAX_LEGACY_RECEIPT_CHECK_INTERVAL
                ),
            });
        }

        Ok(())
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        self.response_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn pacing(&self) -> Duration {
        Duration::from_millis(self.pacing_ms)
    }

    pub fn legacy_pacing(&self) -> Duration {
        Duration::from_millis(self.legacy_pacing_ms)
    }

    /// Check if these settings differ from defaults.
    pub fn has_non_default_settings(&self) -> bool {
        *self != Self::default()
    }
}

/// Settings file name stored in app data directory.
const SETTINGS_FILENAME: &str = "dfu_settings.json";

/// Manages persistence of DFU settings to JSON file.
pub struct SettingsManager {
    settings_file_path: PathBuf,
}

impl SettingsManager {
    /// Create a new settings manager for the given app data directory.
    pub fn new(app_data_dir: &Path) -> Self {
        let settings_file_path = app_data_dir.join(SETTINGS_FILENAME);
        Self { settings_file_path }
    }

    /// Load settings from disk, returning defaults if file doesn't exist.
    pub fn load(&self) -> DfuResult<DfuSettings> {
        if !self.settings_file_path.exists() {
            return Ok(DfuSettings::default());
        }

        let contents = fs::read_to_string(&self.settings_file_path)?;

        // Handle empty file gracefully
        if contents.trim().is_empty() {
            return Ok(DfuSettings::default());
        }

        let settings: DfuSettings = serde_json::from_str(&contents)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Save settings to disk.
    pub fn save(&self, settings: &DfuSettings) -> DfuResult<()> {
        settings.validate()?;

        if let Some(parent) = self.settings_file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_file_path, contents)?;

        tracing::debug!(path = %self.settings_file_path.display(), "Saved DFU settings");
        Ok(())
    }

    /// Get the path where settings are stored.
    pub fn settings_path(&self) -> &Path {
        &self.settings_file_path
    }
}
