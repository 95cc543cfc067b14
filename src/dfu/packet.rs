//! Wire-level vocabulary and request builders for Nordic BLE DFU.
//!
//! Secure DFU (SDK 12+) and Legacy DFU (SDK <= 11) share nothing on the wire
//! except the idea of a control point and a packet characteristic, so each
//! generation gets its own closed set of opcodes and result codes.

use std::fmt;

use super::config::LEGACY_SIZE_HEADER_LEN;
use super::error::{DfuError, DfuResult};

/// Convert a buffer length or offset to the 32-bit form used in every DFU frame.
pub fn wire_len(len: usize) -> DfuResult<u32> {
    u32::try_from(len).map_err(|_| DfuError::ImageTooLarge { len })
}

// ============================================================================
// Secure DFU
// ============================================================================

/// Secure DFU control point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SecureOpcode {
    /// Retrieve protocol version.
    ProtocolVersion = 0x00,
    /// Create selected object.
    ObjectCreate = 0x01,
    /// Set receipt notification interval.
    ReceiptNotifSet = 0x02,
    /// Request CRC of selected object.
    CrcGet = 0x03,
    /// Execute selected object.
    ObjectExecute = 0x04,
    /// Select object.
    ObjectSelect = 0x06,
    /// Retrieve MTU size.
    MtuGet = 0x07,
    /// Write selected object. Implicit on the packet characteristic.
    ObjectWrite = 0x08,
    /// Ping.
    Ping = 0x09,
    /// Retrieve hardware version.
    HardwareVersion = 0x0A,
    /// Retrieve firmware version.
    FirmwareVersion = 0x0B,
    /// Abort the DFU procedure.
    Abort = 0x0C,
    /// Response to a control point request.
    Response = 0x60,
}

impl SecureOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(SecureOpcode::ProtocolVersion),
            0x01 => Some(SecureOpcode::ObjectCreate),
            0x02 => Some(SecureOpcode::ReceiptNotifSet),
            0x03 => Some(SecureOpcode::CrcGet),
            0x04 => Some(SecureOpcode::ObjectExecute),
            0x06 => Some(SecureOpcode::ObjectSelect),
            0x07 => Some(SecureOpcode::MtuGet),
            0x08 => Some(SecureOpcode::ObjectWrite),
            0x09 => Some(SecureOpcode::Ping),
            0x0A => Some(SecureOpcode::HardwareVersion),
            0x0B => Some(SecureOpcode::FirmwareVersion),
            0x0C => Some(SecureOpcode::Abort),
            0x60 => Some(SecureOpcode::Response),
            _ => None,
        }
    }
}

/// Secure DFU object types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet (signed command).
    Command = 0x01,
    /// Firmware image data.
    Data = 0x02,
}

/// Secure DFU result codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    /// Extended error; the next byte carries an [`ExtendedError`].
    ExtError = 0x0B,
}

impl ResultCode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ResultCode::Invalid),
            0x01 => Some(ResultCode::Success),
            0x02 => Some(ResultCode::OpCodeNotSupported),
            0x03 => Some(ResultCode::InvalidParameter),
            0x04 => Some(ResultCode::InsufficientResources),
            0x05 => Some(ResultCode::InvalidObject),
            0x07 => Some(ResultCode::UnsupportedType),
            0x08 => Some(ResultCode::OperationNotPermitted),
            0x0A => Some(ResultCode::OperationFailed),
            0x0B => Some(ResultCode::ExtError),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ResultCode::Invalid => "Invalid opcode",
            ResultCode::Success => "Operation successful",
            ResultCode::OpCodeNotSupported => "Opcode not supported",
            ResultCode::InvalidParameter => "Missing or invalid parameter value",
            ResultCode::InsufficientResources => "Not enough memory for the data object",
            ResultCode::InvalidObject => "Object does not match firmware and hardware requirements",
            ResultCode::UnsupportedType => "Not a valid object type for a Create request",
            ResultCode::OperationNotPermitted => "DFU state does not allow this operation",
            ResultCode::OperationFailed => "Operation failed",
            ResultCode::ExtError => "Extended error",
        }
    }
}

/// Secure DFU extended error codes, reported after [`ResultCode::ExtError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ExtendedError {
    NoError = 0x00,
    InvalidErrorCode = 0x01,
    WrongCommandFormat = 0x02,
    UnknownCommand = 0x03,
    InitCommandInvalid = 0x04,
    FwVersionFailure = 0x05,
    HwVersionFailure = 0x06,
    SdVersionFailure = 0x07,
    SignatureMissing = 0x08,
    WrongHashType = 0x09,
    HashFailed = 0x0A,
    WrongSignatureType = 0x0B,
    VerificationFailed = 0x0C,
    InsufficientSpace = 0x0D,
}

impl ExtendedError {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x00 => Some(ExtendedError::NoError),
            0x01 => Some(ExtendedError::InvalidErrorCode),
            0x02 => Some(ExtendedError::WrongCommandFormat),
            0x03 => Some(ExtendedError::UnknownCommand),
            0x04 => Some(ExtendedError::InitCommandInvalid),
            0x05 => Some(ExtendedError::FwVersionFailure),
            0x06 => Some(ExtendedError::HwVersionFailure),
            0x07 => Some(ExtendedError::SdVersionFailure),
            0x08 => Some(ExtendedError::SignatureMissing),
            0x09 => Some(ExtendedError::WrongHashType),
            0x0A => Some(ExtendedError::HashFailed),
            0x0B => Some(ExtendedError::WrongSignatureType),
            0x0C => Some(ExtendedError::VerificationFailed),
            0x0D => Some(ExtendedError::InsufficientSpace),
            _ => None,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            ExtendedError::NoError => "No extended error code has been set",
            ExtendedError::InvalidErrorCode => "Invalid error code",
            ExtendedError::WrongCommandFormat => "Command format was incorrect",
            ExtendedError::UnknownCommand => "Command is not supported",
            ExtendedError::InitCommandInvalid => "Init command is invalid",
            ExtendedError::FwVersionFailure => "Firmware version is too low",
            ExtendedError::HwVersionFailure => "Hardware version does not match",
            ExtendedError::SdVersionFailure => "SoftDevice requirement not met",
            ExtendedError::SignatureMissing => "Init packet is not signed",
            ExtendedError::WrongHashType => "Hash type not supported",
            ExtendedError::HashFailed => "Firmware hash could not be calculated",
            ExtendedError::WrongSignatureType => "Signature type not supported",
            ExtendedError::VerificationFailed => "Firmware hash does not match init packet",
            ExtendedError::InsufficientSpace => "Not enough space for the firmware",
        }
    }
}

// ============================================================================
// Legacy DFU
// ============================================================================

/// Legacy DFU control point opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LegacyOpcode {
    /// Start DFU with image type, followed by image sizes on the packet characteristic
    StartDfu = 0x01,
    /// Initialize DFU parameters (init packet follows on the packet characteristic)
    InitDfuParams = 0x02,
    /// Receive firmware image (data slices)
    ReceiveFirmwareImage = 0x03,
    /// Validate the received firmware
    ValidateFirmware = 0x04,
    /// Activate firmware and reset device
    ActivateAndReset = 0x05,
    /// System reset
    SystemReset = 0x06,
    /// Report received image size
    ReportReceivedImageSize = 0x07,
    /// Request packet receipt notification interval
    PacketReceiptNotificationRequest = 0x08,
    /// Response from bootloader
    Response = 0x10,
    /// Packet receipt notification from bootloader
    PacketReceiptNotification = 0x11,
}

impl LegacyOpcode {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(LegacyOpcode::StartDfu),
            0x02 => Some(LegacyOpcode::InitDfuParams),
            0x03 => Some(LegacyOpcode::ReceiveFirmwareImage),
            0x04 => Some(LegacyOpcode::ValidateFirmware),
            0x05 => Some(LegacyOpcode::ActivateAndReset),
            0x06 => Some(LegacyOpcode::SystemReset),
            0x07 => Some(LegacyOpcode::ReportReceivedImageSize),
            0x08 => Some(LegacyOpcode::PacketReceiptNotificationRequest),
            0x10 => Some(LegacyOpcode::Response),
            0x11 => Some(LegacyOpcode::PacketReceiptNotification),
            _ => None,
        }
    }
}

/// Legacy DFU response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LegacyStatus {
    Success = 0x01,
    InvalidState = 0x02,
    NotSupported = 0x03,
    DataSizeExceedsLimit = 0x04,
    CrcError = 0x05,
    OperationFailed = 0x06,
}

impl LegacyStatus {
    /// Parse a status code from a byte value.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(LegacyStatus::Success),
            0x02 => Some(LegacyStatus::InvalidState),
            0x03 => Some(LegacyStatus::NotSupported),
            0x04 => Some(LegacyStatus::DataSizeExceedsLimit),
            0x05 => Some(LegacyStatus::CrcError),
            0x06 => Some(LegacyStatus::OperationFailed),
            _ => None,
        }
    }

    /// Get a human-readable description.
    pub fn description(&self) -> &'static str {
        match self {
            LegacyStatus::Success => "Operation successful",
            LegacyStatus::InvalidState => "Invalid state for this operation",
            LegacyStatus::NotSupported => "Operation not supported",
            LegacyStatus::DataSizeExceedsLimit => "Data size exceeds limit",
            LegacyStatus::CrcError => "CRC validation failed",
            LegacyStatus::OperationFailed => "Operation failed",
        }
    }
}

/// DFU image type (what firmware component is being updated).
///
/// Sent as a single byte in the legacy StartDfu command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ImageType {
    SoftDevice = 0x01,
    Bootloader = 0x02,
    SoftDeviceBootloader = 0x03,
    Application = 0x04,
}

/// Image component sizes announced in the legacy Start DFU size header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageSizes {
    pub softdevice: u32,
    pub bootloader: u32,
    pub application: u32,
}

macro_rules! impl_display_hex {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:?} (0x{:02X})", self, *self as u8)
            }
        })*
    };
}

impl_display_hex!(
    SecureOpcode,
    ObjectType,
    ResultCode,
    ExtendedError,
    LegacyOpcode,
    LegacyStatus,
    ImageType
);

// ============================================================================
// Secure DFU Request Builders
// ============================================================================

/// Build an Object Select request: `[0x06, type]`.
pub fn build_select(object_type: ObjectType) -> Vec<u8> {
    vec![SecureOpcode::ObjectSelect as u8, object_type as u8]
}

/// Build an Object Create request: `[0x01, type, size_le32]`.
pub fn build_create(object_type: ObjectType, size: u32) -> Vec<u8> {
    let mut payload = Vec::with_capacity(6);
    payload.push(SecureOpcode::ObjectCreate as u8);
    payload.push(object_type as u8);
    payload.extend_from_slice(&size.to_le_bytes());
    payload
}

/// Build a CRC Get request.
pub fn build_crc_get() -> Vec<u8> {
    vec![SecureOpcode::CrcGet as u8]
}

/// Build an Object Execute request.
pub fn build_execute() -> Vec<u8> {
    vec![SecureOpcode::ObjectExecute as u8]
}

/// Build a Receipt Notification Set request: `[0x02, prn_le16]`. Zero disables receipts.
pub fn build_receipt_notif_set(prn: u16) -> Vec<u8> {
    let mut payload = vec![SecureOpcode::ReceiptNotifSet as u8];
    payload.extend_from_slice(&prn.to_le_bytes());
    payload
}

/// Build a Ping request carrying an identifier echoed back by the device.
pub fn build_ping(id: u8) -> Vec<u8> {
    vec![SecureOpcode::Ping as u8, id]
}

/// Build an Abort request.
pub fn build_abort() -> Vec<u8> {
    vec![SecureOpcode::Abort as u8]
}

// ============================================================================
// Legacy DFU Request Builders
// ============================================================================

/// Build a legacy Start DFU request: `[0x01, image_type]`.
pub fn build_legacy_start(image_type: ImageType) -> Vec<u8> {
    vec![LegacyOpcode::StartDfu as u8, image_type as u8]
}

/// Build the 12-byte size header written to the packet characteristic after Start DFU.
///
/// Layout: `[softdevice_le32, bootloader_le32, application_le32]`.
pub fn build_legacy_image_sizes(sizes: &ImageSizes) -> [u8; LEGACY_SIZE_HEADER_LEN] {
    let mut header = [0u8; LEGACY_SIZE_HEADER_LEN];
    header[0..4].copy_from_slice(&sizes.softdevice.to_le_bytes());
    header[4..8].copy_from_slice(&sizes.bootloader.to_le_bytes());
    header[8..12].copy_from_slice(&sizes.application.to_le_bytes());
    header
}

/// Build a legacy Init DFU Params request. `complete` marks the end of the init packet.
pub fn build_legacy_init(complete: bool) -> Vec<u8> {
    vec![LegacyOpcode::InitDfuParams as u8, u8::from(complete)]
}

/// Build a legacy packet receipt notification request: `[0x08, slices_le16]`.
pub fn build_legacy_receipt_request(slices: u16) -> Vec<u8> {
    let mut payload = vec![LegacyOpcode::PacketReceiptNotificationRequest as u8];
    payload.extend_from_slice(&slices.to_le_bytes());
    payload
}

/// Build a legacy Receive Firmware Image request.
pub fn build_legacy_receive_image() -> Vec<u8> {
    vec![LegacyOpcode::ReceiveFirmwareImage as u8]
}

/// Build a legacy Report Received Image Size request.
pub fn build_legacy_report_size() -> Vec<u8> {
    vec![LegacyOpcode::ReportReceivedImageSize as u8]
}

/// Build a legacy Validate Firmware request.
pub fn build_legacy_validate() -> Vec<u8> {
    vec![LegacyOpcode::ValidateFirmware as u8]
}

/// Build a legacy Activate Image and Reset request.
pub fn build_legacy_activate() -> Vec<u8> {
    vec![LegacyOpcode::ActivateAndReset as u8]
}
