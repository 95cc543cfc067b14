//! Nordic DFU (Device Firmware Update) over Bluetooth LE.
//!
//! This module provides a Rust implementation of the Nordic Secure DFU and
//! Legacy DFU client protocols. The Bluetooth stack itself is supplied by the
//! caller through [`BleTransport`] and an event queue.
//!
//! # Protocol Overview
//!
//! The DFU process consists of:
//! 1. **Package Loading** - Read init packet and image from a firmware .zip
//! 2. **Connection** - Connect and discover the bootloader's characteristics
//! 3. **Detection** - Secure DFU (0xFE59) or Legacy DFU (0x1530)
//! 4. **Init Transfer** - Send the init packet, skipped if the device already has it
//! 5. **Firmware Transfer** - Send the image in CRC-verified objects or receipt-paced slices
//! 6. **Activation** - Device validates and boots the new firmware
//!
//! # Example
//!
//! ```ignore
//! use ble_dfu::dfu::{event_channel, upload_firmware, CancelToken};
//! use ble_dfu::settings::DfuSettings;
//!
//! let settings = DfuSettings::default();
//! let (events, receiver) = event_channel(settings.event_queue_capacity);
//! let transport = MyBackend::new(events);
//! upload_firmware(
//!     transport,
//!     receiver,
//!     "C4:5A:9B:10:22:01",
//!     "firmware.zip",
//!     &settings,
//!     &CancelToken::new(),
//!     |stage| println!("{}: {:.0}%", stage.message(), stage.percent()),
//! )?;
//! ```

pub mod config;
mod chunked;
mod error;
mod firmware_reader;
mod legacy;
mod link;
pub mod packet;
mod protocol;
pub mod response;
mod secure;
mod session;
mod transport;

// Errors
pub use error::{DecodeError, DfuError, DfuResult};

// Transport boundary
pub use link::{Deadline, GattLink};
pub use transport::{
    event_channel, BleTransport, ConnectionEvent, EventSender, Notification, TransportEvent,
};
#[cfg(test)]
pub(crate) use transport::MockBleTransport;

// Protocol
pub use legacy::{LegacyDfuClient, LegacyState};
pub use protocol::{upload_firmware, DfuClient, DfuStage, ProtocolGeneration};
pub use secure::{SecureDfuClient, SecureState};
pub use session::{CancelToken, SessionState, TransferSession};

// Firmware reading
pub use firmware_reader::{
    read_firmware_package, read_firmware_zip, read_firmware_zip_image, FirmwareImage,
    FirmwarePackage, InitPacket, ManifestData,
};
