//! DFU orchestration over BLE.
//!
//! Drives the complete update:
//! 1. Read the firmware package
//! 2. Connect and discover services
//! 3. Pick Secure or Legacy DFU from the discovered characteristics
//! 4. Hand the session to the matching client until Done or the first error

use std::path::Path;
use std::sync::mpsc::Receiver;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::config::{LEGACY_DFU_CONTROL, LEGACY_DFU_DATA, SECURE_DFU_CONTROL, SECURE_DFU_DATA};
use super::error::{DfuError, DfuResult};
use super::firmware_reader::read_firmware_zip;
use super::legacy::LegacyDfuClient;
use super::link::GattLink;
use super::secure::SecureDfuClient;
use super::session::{CancelToken, TransferSession};
use super::transport::{BleTransport, TransportEvent};
use crate::settings::DfuSettings;

/// Which DFU protocol a bootloader speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolGeneration {
    /// Object-based Secure DFU (service 0xFE59).
    Secure,
    /// Pre-SDK 12 Legacy DFU.
    Legacy,
}

impl ProtocolGeneration {
    /// Pick a generation from discovered `(service, characteristic)` pairs.
    ///
    /// Secure DFU wins when a device exposes both.
    pub fn detect(characteristics: &[(Uuid, Uuid)]) -> DfuResult<Self> {
        let has = |uuid: Uuid| characteristics.iter().any(|(_, c)| *c == uuid);

        if has(SECURE_DFU_CONTROL) && has(SECURE_DFU_DATA) {
            Ok(ProtocolGeneration::Secure)
        } else if has(LEGACY_DFU_CONTROL) && has(LEGACY_DFU_DATA) {
            Ok(ProtocolGeneration::Legacy)
        } else {
            Err(DfuError::UnsupportedDevice)
        }
    }
}

/// A protocol client able to run one transfer session to completion.
pub trait DfuClient {
    fn drive_transfer(
        &mut self,
        session: &mut TransferSession<'_>,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()>;
}

/// DFU progress stages for UI feedback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "data")]
pub enum DfuStage {
    /// Reading firmware package.
    ReadingPackage,
    /// Connecting and discovering services.
    Connecting,
    /// Bootloader protocol identified.
    DetectedProtocol { generation: ProtocolGeneration },
    /// Starting DFU transfer.
    Starting,
    /// Sending init packet.
    SendingInit,
    /// Uploading firmware data.
    Uploading { sent: usize, total: usize },
    /// Device validating the image.
    Validating,
    /// Device activating the image and resetting.
    Activating,
    /// DFU process complete.
    Complete,
    /// Debug log message.
    Log { message: String },
}

impl DfuStage {
    /// Get a percentage estimate for this stage.
    pub fn percent(&self) -> f32 {
        match self {
            DfuStage::ReadingPackage => 0.0,
            DfuStage::Connecting => 2.0,
            DfuStage::DetectedProtocol { .. } => 6.0,
            DfuStage::Starting => 8.0,
            DfuStage::SendingInit => 10.0,
            DfuStage::Uploading { sent, total } => {
                if *total == 0 {
                    12.0
                } else {
                    12.0 + (*sent as f32 / *total as f32) * 82.0
                }
            }
            DfuStage::Validating => 95.0,
            DfuStage::Activating => 98.0,
            DfuStage::Complete => 100.0,
            // Log messages don't affect progress percentage
            DfuStage::Log { .. } => -1.0,
        }
    }

    /// Get a human-readable message for this stage.
    pub fn message(&self) -> String {
        match self {
            DfuStage::ReadingPackage => "Reading firmware package...".into(),
            DfuStage::Connecting => "Connecting to bootloader...".into(),
            DfuStage::DetectedProtocol { generation } => {
                format!("Detected {:?} DFU bootloader", generation)
            }
            DfuStage::Starting => "Starting firmware transfer...".into(),
            DfuStage::SendingInit => "Sending initialization data...".into(),
            DfuStage::Uploading { sent, total } => {
                let percent = if *total == 0 {
                    0
                } else {
                    (sent * 100) / total
                };
                format!("Uploading firmware... {}%", percent)
            }
            DfuStage::Validating => "Validating firmware...".into(),
            DfuStage::Activating => "Activating firmware...".into(),
            DfuStage::Complete => "Update complete!".into(),
            DfuStage::Log { message } => message.clone(),
        }
    }
}

/// Upload firmware to a BLE peripheral via DFU.
///
/// This is the high-level function that orchestrates the complete DFU process.
/// The peripheral must already be running its DFU bootloader.
///
/// # Arguments
/// * `transport` - Outgoing half of the BLE backend
/// * `events` - Receiving end of the backend's event queue
/// * `peripheral_id` - Backend-specific peripheral identifier
/// * `firmware_zip_path` - Path to the firmware .zip package
/// * `settings` - Timeouts, pacing and flow-control tunables
/// * `cancel` - Cooperative cancellation flag
/// * `on_progress` - Callback for progress updates
pub fn upload_firmware<T, P, F>(
    transport: T,
    events: Receiver<TransportEvent>,
    peripheral_id: &str,
    firmware_zip_path: P,
    settings: &DfuSettings,
    cancel: &CancelToken,
    on_progress: F,
) -> DfuResult<()>
where
    T: BleTransport,
    P: AsRef<Path>,
    F: Fn(DfuStage),
{
    settings.validate()?;

    // Step 1: Read firmware package
    on_progress(DfuStage::ReadingPackage);
    let package = read_firmware_zip(firmware_zip_path)?;

    // Step 2: Connect and discover services
    on_progress(DfuStage::Connecting);
    let mut link = GattLink::new(transport, events);
    link.connect(peripheral_id, Some(settings.connect_timeout()), cancel)?;

    // Step 3: Pick the protocol generation
    let generation = ProtocolGeneration::detect(link.characteristics())?;
    tracing::info!(?generation, "Detected DFU bootloader");
    on_progress(DfuStage::DetectedProtocol { generation });

    // Step 4: Run the transfer
    let mut session = TransferSession::new(&package, cancel.clone());
    let result = match generation {
        ProtocolGeneration::Secure => {
            SecureDfuClient::new(&mut link, settings).drive_transfer(&mut session, &on_progress)
        }
        ProtocolGeneration::Legacy => {
            LegacyDfuClient::new(&mut link, settings).drive_transfer(&mut session, &on_progress)
        }
    };

    if let Err(error) = &result {
        tracing::warn!(
            state = ?session.state(),
            code = error.error_code(),
            %error,
            "DFU transfer failed"
        );

        if matches!(error, DfuError::Cancelled) && generation == ProtocolGeneration::Secure {
            if let Err(abort_error) = SecureDfuClient::new(&mut link, settings).abort() {
                tracing::debug!(%abort_error, "Abort after cancel failed");
            }
        }

        let unconsumed = link.take_pending();
        if !unconsumed.is_empty() {
            tracing::debug!(count = unconsumed.len(), "Dropping unconsumed notifications");
        }
    }
    result?;

    on_progress(DfuStage::Complete);
    Ok(())
}
