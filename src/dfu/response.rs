//! Control point response decoding.
//!
//! Turns raw notification payloads into typed frames. Decoding never panics
//! and never defaults: anything that does not match the protocol is reported
//! as a [`DecodeError`].

use super::error::{DecodeError, DfuError, DfuResult};
use super::packet::{ExtendedError, LegacyOpcode, LegacyStatus, ResultCode, SecureOpcode};
use super::protocol::ProtocolGeneration;

/// Minimum length of any response frame: opcode, request, result.
const RESPONSE_HEADER_LEN: usize = 3;

/// Length of a legacy receipt notification: opcode + bytes received (le32).
const RECEIPT_LEN: usize = 5;

fn read_u32_le(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn ensure_len(data: &[u8], needed: usize) -> Result<(), DecodeError> {
    if data.len() < needed {
        return Err(DecodeError::Truncated {
            len: data.len(),
            needed,
        });
    }
    Ok(())
}

// ============================================================================
// Secure DFU
// ============================================================================

/// Outcome carried by a Secure DFU response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureResult {
    Success,
    /// Generic failure result code.
    Failure(ResultCode),
    /// Second-tier error reported after [`ResultCode::ExtError`].
    Extended(ExtendedError),
}

/// Select response payload: the device's view of the selected object type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectInfo {
    /// Largest object the device accepts in one create/execute cycle.
    pub max_size: u32,
    /// Bytes received so far for this object type.
    pub offset: u32,
    /// CRC-32 of the bytes received so far.
    pub crc: u32,
}

/// CRC Get response payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcInfo {
    pub offset: u32,
    pub crc: u32,
}

/// A decoded Secure DFU control point response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureResponse {
    /// Opcode of the request being acknowledged.
    pub request: SecureOpcode,
    pub result: SecureResult,
    /// Opcode-specific bytes following the result.
    pub payload: Vec<u8>,
}

impl SecureResponse {
    /// Decode `[0x60, request, result, payload...]`.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        ensure_len(raw, RESPONSE_HEADER_LEN)?;

        if raw[0] != SecureOpcode::Response as u8 {
            return Err(DecodeError::NotAResponse(raw[0]));
        }

        let request = SecureOpcode::from_byte(raw[1]).ok_or(DecodeError::UnknownOpcode(raw[1]))?;
        let code = ResultCode::from_byte(raw[2]).ok_or(DecodeError::UnknownResult(raw[2]))?;

        let (result, payload_start) = match code {
            ResultCode::Success => (SecureResult::Success, RESPONSE_HEADER_LEN),
            ResultCode::ExtError => {
                ensure_len(raw, RESPONSE_HEADER_LEN + 1)?;
                let ext = ExtendedError::from_byte(raw[3])
                    .ok_or(DecodeError::UnknownExtendedError(raw[3]))?;
                (SecureResult::Extended(ext), RESPONSE_HEADER_LEN + 1)
            }
            other => (SecureResult::Failure(other), RESPONSE_HEADER_LEN),
        };

        Ok(Self {
            request,
            result,
            payload: raw[payload_start..].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == SecureResult::Success
    }

    /// Convert a failure result into the matching [`DfuError`].
    pub fn into_success(self) -> DfuResult<Self> {
        match self.result {
            SecureResult::Success => Ok(self),
            SecureResult::Failure(result) => Err(DfuError::Protocol {
                request: self.request,
                result,
            }),
            SecureResult::Extended(error) => Err(DfuError::ExtendedProtocol {
                request: self.request,
                error,
            }),
        }
    }

    /// Parse a Select payload: max_size, offset, crc (le32 each).
    pub fn object_info(&self) -> Result<ObjectInfo, DecodeError> {
        ensure_len(&self.payload, 12).map_err(|_| self.truncated(12))?;
        Ok(ObjectInfo {
            max_size: read_u32_le(&self.payload, 0),
            offset: read_u32_le(&self.payload, 4),
            crc: read_u32_le(&self.payload, 8),
        })
    }

    /// Parse a CRC Get payload: offset, crc (le32 each).
    pub fn crc_info(&self) -> Result<CrcInfo, DecodeError> {
        ensure_len(&self.payload, 8).map_err(|_| self.truncated(8))?;
        Ok(CrcInfo {
            offset: read_u32_le(&self.payload, 0),
            crc: read_u32_le(&self.payload, 4),
        })
    }

    // Report lengths against the whole frame, which is what shows up in logs.
    fn truncated(&self, payload_needed: usize) -> DecodeError {
        DecodeError::Truncated {
            len: RESPONSE_HEADER_LEN + self.payload.len(),
            needed: RESPONSE_HEADER_LEN + payload_needed,
        }
    }
}

// ============================================================================
// Legacy DFU
// ============================================================================

/// Outcome carried by a Legacy DFU response. There is no extended tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyResult {
    Success,
    Failure(LegacyStatus),
}

/// A decoded Legacy DFU control point response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LegacyResponse {
    /// Procedure being acknowledged.
    pub procedure: LegacyOpcode,
    pub result: LegacyResult,
    pub payload: Vec<u8>,
}

impl LegacyResponse {
    /// Decode `[0x10, procedure, status, payload...]`.
    pub fn decode(raw: &[u8]) -> Result<Self, DecodeError> {
        ensure_len(raw, RESPONSE_HEADER_LEN)?;

        if raw[0] != LegacyOpcode::Response as u8 {
            return Err(DecodeError::NotAResponse(raw[0]));
        }

        let procedure = LegacyOpcode::from_byte(raw[1]).ok_or(DecodeError::UnknownOpcode(raw[1]))?;
        let status = LegacyStatus::from_byte(raw[2]).ok_or(DecodeError::UnknownResult(raw[2]))?;

        let result = match status {
            LegacyStatus::Success => LegacyResult::Success,
            other => LegacyResult::Failure(other),
        };

        Ok(Self {
            procedure,
            result,
            payload: raw[RESPONSE_HEADER_LEN..].to_vec(),
        })
    }

    pub fn is_success(&self) -> bool {
        self.result == LegacyResult::Success
    }

    /// Convert a failure status into [`DfuError::LegacyProtocol`].
    pub fn into_success(self) -> DfuResult<Self> {
        match self.result {
            LegacyResult::Success => Ok(self),
            LegacyResult::Failure(status) => Err(DfuError::LegacyProtocol {
                procedure: self.procedure,
                status,
            }),
        }
    }

    /// Parse a Report Received Image Size payload (le32).
    pub fn reported_size(&self) -> Result<u32, DecodeError> {
        ensure_len(&self.payload, 4).map_err(|_| DecodeError::Truncated {
            len: RESPONSE_HEADER_LEN + self.payload.len(),
            needed: RESPONSE_HEADER_LEN + 4,
        })?;
        Ok(read_u32_le(&self.payload, 0))
    }
}

/// Any frame a legacy bootloader may notify on its control point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyNotification {
    Response(LegacyResponse),
    /// Flow-control frame `[0x11, bytes_received_le32]`. Not a response to anything.
    Receipt { bytes_received: u32 },
}

/// Decode a legacy control point notification without insisting it is a response.
///
/// Receipt notifications do not follow the request/response shape and are
/// returned as [`LegacyNotification::Receipt`] for the flow-control logic.
pub fn decode_legacy_notification(raw: &[u8]) -> Result<LegacyNotification, DecodeError> {
    ensure_len(raw, 1)?;

    if raw[0] == LegacyOpcode::PacketReceiptNotification as u8 {
        ensure_len(raw, RECEIPT_LEN)?;
        return Ok(LegacyNotification::Receipt {
            bytes_received: read_u32_le(raw, 1),
        });
    }

    LegacyResponse::decode(raw).map(LegacyNotification::Response)
}

// ============================================================================
// Generation-agnostic entry point
// ============================================================================

/// A response frame from either protocol generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseFrame {
    Secure(SecureResponse),
    Legacy(LegacyResponse),
}

impl ResponseFrame {
    /// Raw opcode of the request being acknowledged.
    pub fn response_to(&self) -> u8 {
        match self {
            ResponseFrame::Secure(response) => response.request as u8,
            ResponseFrame::Legacy(response) => response.procedure as u8,
        }
    }

    pub fn is_success(&self) -> bool {
        match self {
            ResponseFrame::Secure(response) => response.is_success(),
            ResponseFrame::Legacy(response) => response.is_success(),
        }
    }
}

/// Decode a control point response for the given protocol generation.
pub fn decode(raw: &[u8], generation: ProtocolGeneration) -> Result<ResponseFrame, DecodeError> {
    match generation {
        ProtocolGeneration::Secure => SecureResponse::decode(raw).map(ResponseFrame::Secure),
        ProtocolGeneration::Legacy => LegacyResponse::decode(raw).map(ResponseFrame::Legacy),
    }
}
