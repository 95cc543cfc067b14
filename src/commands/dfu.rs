//! Async commands for DFU (Device Firmware Update) operations.
//!
//! These commands wrap the blocking DFU client for async callers.

use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;

use serde::{Deserialize, Serialize};

use crate::dfu::packet::ImageType;
use crate::dfu::{
    read_firmware_zip, upload_firmware, BleTransport, CancelToken, DfuStage, TransportEvent,
};
use crate::settings::DfuSettings;

/// Serialisable progress event for async callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DfuProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Bytes sent (for uploading stage).
    pub sent: Option<usize>,
    /// Total bytes (for uploading stage).
    pub total: Option<usize>,
    /// Progress percentage (0-100).
    pub percent: f32,
    /// Human-readable message.
    pub message: String,
}

impl From<DfuStage> for DfuProgressEvent {
    fn from(stage: DfuStage) -> Self {
        let (stage_name, sent, total) = match &stage {
            DfuStage::ReadingPackage => ("reading", None, None),
            DfuStage::Connecting => ("connecting", None, None),
            DfuStage::DetectedProtocol { .. } => ("detected", None, None),
            DfuStage::Starting => ("starting", None, None),
            DfuStage::SendingInit => ("init", None, None),
            DfuStage::Uploading { sent, total } => ("uploading", Some(*sent), Some(*total)),
            DfuStage::Validating => ("validating", None, None),
            DfuStage::Activating => ("activating", None, None),
            DfuStage::Complete => ("complete", None, None),
            DfuStage::Log { .. } => ("log", None, None),
        };

        Self {
            stage: stage_name.to_string(),
            sent,
            total,
            percent: stage.percent(),
            message: stage.message(),
        }
    }
}

/// Flash firmware to a BLE peripheral via DFU.
///
/// # Arguments
/// * `transport` - BLE backend connected to `events`
/// * `events` - Receiving end of the backend's event queue
/// * `peripheral_id` - Peripheral to update
/// * `firmware_path` - Path to the firmware.zip file
/// * `settings` - Transfer tunables
/// * `cancel` - Token the caller keeps to cancel the flash
/// * `progress` - Channel for progress updates
pub async fn flash_dfu_firmware<T>(
    transport: T,
    events: Receiver<TransportEvent>,
    peripheral_id: String,
    firmware_path: String,
    settings: DfuSettings,
    cancel: CancelToken,
    progress: Sender<DfuProgressEvent>,
) -> Result<(), String>
where
    T: BleTransport + 'static,
{
    // Create a channel for progress updates from the blocking thread
    let (tx, rx) = mpsc::channel::<DfuStage>();

    // Forward progress updates
    let progress_task = thread::spawn(move || {
        while let Ok(stage) = rx.recv() {
            let event = DfuProgressEvent::from(stage);
            let _ = progress.send(event);
        }
    });

    // Run DFU in a blocking task
    let result = tokio::task::spawn_blocking(move || {
        upload_firmware(
            transport,
            events,
            &peripheral_id,
            &firmware_path,
            &settings,
            &cancel,
            |stage| {
                let _ = tx.send(stage);
            },
        )
    })
    .await
    .map_err(|e| format!("DFU task panicked: {}", e))?;

    // Wait for progress forwarding to complete
    let _ = progress_task.join();

    result.map_err(|e| {
        tracing::error!(code = e.error_code(), error = %e, "DFU flash failed");
        format!("[{}] {}", e.error_code(), e)
    })
}

/// Cancel a running flash started with the same token.
pub fn cancel_dfu_flash(cancel: &CancelToken) {
    tracing::info!("DFU cancellation requested");
    cancel.cancel();
}

/// Validate that a firmware zip file is valid.
pub async fn validate_firmware_package(firmware_path: String) -> Result<FirmwareInfo, String> {
    tokio::task::spawn_blocking(move || {
        let package = read_firmware_zip(&firmware_path).map_err(|e| format!("{}", e))?;
        let sizes = package.image_sizes().map_err(|e| format!("{}", e))?;

        Ok(FirmwareInfo {
            image_type: package.image_type,
            firmware_size: package.image.len(),
            init_size: package.init_packet.len(),
            image_sizes: [sizes.softdevice, sizes.bootloader, sizes.application],
            firmware_crc16: package.manifest.firmware_crc16,
            device_type: package.manifest.device_type,
            dfu_version: package.manifest.dfu_version,
        })
    })
    .await
    .map_err(|e| format!("Validation failed: {}", e))?
}

/// Information about a firmware package.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareInfo {
    /// Firmware component the package updates.
    pub image_type: ImageType,
    /// Size of the firmware binary in bytes.
    pub firmware_size: usize,
    /// Size of the init packet in bytes.
    pub init_size: usize,
    /// Component sizes announced to legacy bootloaders.
    pub image_sizes: [u32; 3],
    /// CRC16 of the firmware (legacy packages).
    pub firmware_crc16: Option<u16>,
    /// Target device type (legacy packages).
    pub device_type: Option<u16>,
    /// DFU protocol version (legacy packages).
    pub dfu_version: Option<f32>,
}
