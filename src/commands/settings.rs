//! Async commands for DFU settings management.
//!
//! Provides get/save operations for DFU transfer settings,
//! persisting to a JSON file in the app data directory.

use std::path::PathBuf;

use crate::settings::{DfuSettings, SettingsManager};

/// Get current DFU settings from disk.
///
/// Returns default settings if no settings file exists yet.
pub async fn get_dfu_settings(app_data_dir: PathBuf) -> Result<DfuSettings, String> {
    let manager = SettingsManager::new(&app_data_dir);
    manager
        .load()
        .map_err(|e| format!("Failed to load settings: {}", e))
}

/// Save DFU settings to disk.
///
/// This persists settings across app restarts.
pub async fn save_dfu_settings(
    settings: DfuSettings,
    app_data_dir: PathBuf,
) -> Result<(), String> {
    let manager = SettingsManager::new(&app_data_dir);
    manager
        .save(&settings)
        .map_err(|e| format!("Failed to save settings: {}", e))?;

    if settings.has_non_default_settings() {
        tracing::info!(?settings, "Saved non-default DFU settings");
    }

    Ok(())
}
