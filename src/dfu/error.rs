//! DFU error types for the Nordic BLE DFU client.

use thiserror::Error;
use uuid::Uuid;

use super::packet::{ExtendedError, LegacyOpcode, LegacyStatus, ResultCode, SecureOpcode};

/// Result type alias for DFU operations.
pub type DfuResult<T> = Result<T, DfuError>;

/// Reasons a notification payload could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    /// Frame is shorter than its opcode requires.
    #[error("Truncated frame: {len} bytes, need at least {needed}")]
    Truncated { len: usize, needed: usize },

    /// First byte is not a response opcode for this protocol generation.
    #[error("Unexpected opcode 0x{0:02X}, expected a response frame")]
    NotAResponse(u8),

    /// Echoed request opcode is not part of the protocol.
    #[error("Unknown request opcode 0x{0:02X}")]
    UnknownOpcode(u8),

    /// Result code is not part of the protocol.
    #[error("Unknown result code 0x{0:02X}")]
    UnknownResult(u8),

    /// Extended error code is not part of the protocol.
    #[error("Unknown extended error code 0x{0:02X}")]
    UnknownExtendedError(u8),
}

/// Errors that can occur during DFU operations.
#[derive(Debug, Error)]
pub enum DfuError {
    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------
    /// Connect, subscribe or write failed in the BLE backend.
    #[error("Transport error during {operation}: {reason}")]
    Transport { operation: String, reason: String },

    /// Device was disconnected during operation.
    #[error("Device disconnected during {operation}")]
    DeviceDisconnected { operation: String },

    /// A required GATT characteristic was not discovered.
    #[error("Missing characteristic {uuid}")]
    MissingCharacteristic { uuid: Uuid },

    /// Peripheral exposes neither the Secure nor the Legacy DFU service.
    #[error("Device does not expose a DFU service")]
    UnsupportedDevice,

    /// Write payload exceeds the negotiated MTU.
    #[error("Packet size {size} exceeds maximum {max_size}")]
    PacketTooLarge { size: usize, max_size: usize },

    // ------------------------------------------------------------------
    // Decoding
    // ------------------------------------------------------------------
    /// Notification payload could not be decoded.
    #[error("Malformed notification {raw:02X?}: {error}")]
    Decode {
        #[source]
        error: DecodeError,
        raw: Vec<u8>,
    },

    // ------------------------------------------------------------------
    // Device-reported failures
    // ------------------------------------------------------------------
    /// Secure DFU device returned a non-success result code.
    #[error("{request} failed: {result} - {}", .result.description())]
    Protocol {
        request: SecureOpcode,
        result: ResultCode,
    },

    /// Secure DFU device returned an extended error.
    #[error("{request} failed with extended error {error} - {}", .error.description())]
    ExtendedProtocol {
        request: SecureOpcode,
        error: ExtendedError,
    },

    /// Legacy DFU device returned a non-success status.
    #[error("{procedure} failed: {status} - {}", .status.description())]
    LegacyProtocol {
        procedure: LegacyOpcode,
        status: LegacyStatus,
    },

    // ------------------------------------------------------------------
    // Integrity
    // ------------------------------------------------------------------
    /// Device CRC-32 disagrees with the locally computed value.
    #[error("CRC mismatch: expected 0x{expected:08X}, device reported 0x{actual:08X}")]
    CrcMismatch { expected: u32, actual: u32 },

    /// Device offset disagrees with the number of bytes sent.
    #[error("Offset mismatch: sent {expected} bytes, device reported {actual}")]
    OffsetMismatch { expected: u32, actual: u32 },

    /// Device advertised an unusable maximum object size.
    #[error("Device reported invalid max object size {max_size}")]
    InvalidObjectSize { max_size: u32 },

    /// Device holds a partially transferred data object.
    #[error("Resuming a data transfer is not supported (device offset {offset})")]
    ResumeNotSupported { offset: u32 },

    // ------------------------------------------------------------------
    // Flow
    // ------------------------------------------------------------------
    /// No matching response arrived in time.
    #[error("Timeout after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Operation was cancelled by user.
    #[error("Operation cancelled by user")]
    Cancelled,

    // ------------------------------------------------------------------
    // Package and settings
    // ------------------------------------------------------------------
    /// Standard I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// ZIP archive error.
    #[error("ZIP error: {0}")]
    Zip(#[from] zip::result::ZipError),

    /// JSON error for manifest.json or the settings file.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Required file missing from the firmware package.
    #[error("Missing file in firmware package: {filename}")]
    MissingFile { filename: String },

    /// Invalid or malformed manifest.json.
    #[error("Invalid manifest: {reason}")]
    InvalidManifest { reason: String },

    /// Buffer length does not fit the 32-bit length fields on the wire.
    #[error("Buffer of {len} bytes exceeds the 4 GiB DFU limit")]
    ImageTooLarge { len: usize },

    /// Settings value out of range.
    #[error("Invalid settings: {reason}")]
    InvalidSettings { reason: String },
}

impl DfuError {
    /// Wrap a decode failure together with the offending bytes.
    pub fn decode(error: DecodeError, raw: &[u8]) -> Self {
        DfuError::Decode {
            error,
            raw: raw.to_vec(),
        }
    }

    /// Build a transport error for a backend failure.
    pub fn transport(operation: impl Into<String>, reason: impl ToString) -> Self {
        DfuError::Transport {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Check if a fresh session is likely to succeed after this error.
    ///
    /// Nothing inside the client retries; this is a hint for callers.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            DfuError::Timeout { .. }
                | DfuError::DeviceDisconnected { .. }
                | DfuError::CrcMismatch { .. }
                | DfuError::OffsetMismatch { .. }
        )
    }

    /// Get a stable error code for support purposes.
    pub fn error_code(&self) -> &'static str {
        match self {
            DfuError::Transport { .. } => "DFU-001",
            DfuError::DeviceDisconnected { .. } => "DFU-002",
            DfuError::MissingCharacteristic { .. } => "DFU-003",
            DfuError::UnsupportedDevice => "DFU-004",
            DfuError::PacketTooLarge { .. } => "DFU-005",
            DfuError::Decode { .. } => "DFU-010",
            DfuError::Protocol { .. } => "DFU-020",
            DfuError::ExtendedProtocol { .. } => "DFU-021",
            DfuError::LegacyProtocol { .. } => "DFU-022",
            DfuError::CrcMismatch { .. } => "DFU-030",
            DfuError::OffsetMismatch { .. } => "DFU-031",
            DfuError::InvalidObjectSize { .. } => "DFU-032",
            DfuError::ResumeNotSupported { .. } => "DFU-033",
            DfuError::Timeout { .. } => "DFU-040",
            DfuError::Io(_) => "DFU-050",
            DfuError::Zip(_) => "DFU-051",
            DfuError::Json(_) => "DFU-052",
            DfuError::MissingFile { .. } => "DFU-053",
            DfuError::InvalidManifest { .. } => "DFU-054",
            DfuError::ImageTooLarge { .. } => "DFU-055",
            DfuError::InvalidSettings { .. } => "DFU-060",
            DfuError::Cancelled => "DFU-099",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_is_retriable() {
        assert!(DfuError::Timeout {
            operation: "CrcGet".into(),
            timeout_ms: 100
        }
        .is_retriable());
        assert!(DfuError::CrcMismatch {
            expected: 0x1234,
            actual: 0x5678
        }
        .is_retriable());
        assert!(!DfuError::UnsupportedDevice.is_retriable());
        assert!(!DfuError::ExtendedProtocol {
            request: SecureOpcode::ObjectExecute,
            error: ExtendedError::VerificationFailed,
        }
        .is_retriable());
    }

    #[test]
    fn test_error_codes() {
        assert_eq!(DfuError::Cancelled.error_code(), "DFU-099");
        assert_eq!(DfuError::UnsupportedDevice.error_code(), "DFU-004");
        assert_eq!(DfuError::ImageTooLarge { len: 0 }.error_code(), "DFU-055");
    }

    #[test]
    fn test_extended_error_message() {
        let err = DfuError::ExtendedProtocol {
            request: SecureOpcode::ObjectExecute,
            error: ExtendedError::InsufficientSpace,
        };
        let message = err.to_string();

        assert!(message.contains("ObjectExecute"));
        assert!(message.contains("InsufficientSpace (0x0D)"));
        assert!(message.contains("Not enough space"));
    }

    #[test]
    fn test_decode_error_keeps_raw_bytes() {
        let err = DfuError::decode(DecodeError::NotAResponse(0x42), &[0x42, 0x01]);

        assert!(matches!(
            &err,
            DfuError::Decode { error: DecodeError::NotAResponse(0x42), raw } if raw == &vec![0x42, 0x01]
        ));
        assert!(err.to_string().contains("0x42"));
    }
}
