//! Transfer session state shared by both protocol generations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::error::{DfuError, DfuResult};
use super::firmware_reader::FirmwarePackage;
use super::legacy::LegacyState;
use super::packet::ObjectType;
use super::secure::SecureState;

/// Cooperative cancellation flag.
///
/// Checked between chunk writes and while waiting for responses. Clones share
/// the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every session holding this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Return [`DfuError::Cancelled`] if cancellation was requested.
    pub fn check(&self) -> DfuResult<()> {
        if self.is_cancelled() {
            Err(DfuError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Where a session currently is in its protocol state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Secure(SecureState),
    Legacy(LegacyState),
}

impl From<SecureState> for SessionState {
    fn from(state: SecureState) -> Self {
        SessionState::Secure(state)
    }
}

impl From<LegacyState> for SessionState {
    fn from(state: LegacyState) -> Self {
        SessionState::Legacy(state)
    }
}

/// One firmware transfer over one connection.
///
/// Owns the cursor into the active buffer and the running CRC-32 over every
/// byte sent for the selected object type since the last Select.
pub struct TransferSession<'a> {
    package: &'a FirmwarePackage,
    state: SessionState,
    selected: Option<ObjectType>,
    cursor: usize,
    crc: crc32fast::Hasher,
    cancel: CancelToken,
}

impl<'a> TransferSession<'a> {
    pub fn new(package: &'a FirmwarePackage, cancel: CancelToken) -> Self {
        Self {
            package,
            state: SessionState::Idle,
            selected: None,
            cursor: 0,
            crc: crc32fast::Hasher::new(),
            cancel,
        }
    }

    pub fn package(&self) -> &'a FirmwarePackage {
        self.package
    }

    pub fn init_packet(&self) -> &'a [u8] {
        let package: &'a FirmwarePackage = self.package;
        package.init_packet.as_bytes()
    }

    pub fn image(&self) -> &'a [u8] {
        let package: &'a FirmwarePackage = self.package;
        package.image.as_bytes()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Move to a new state, logging the transition.
    pub fn transition(&mut self, to: impl Into<SessionState>) {
        let to = to.into();
        tracing::info!(from = ?self.state, to = ?to, "DFU state changed");
        self.state = to;
    }

    pub fn selected(&self) -> Option<ObjectType> {
        self.selected
    }

    /// Start tracking a freshly selected object type from zero.
    pub fn select(&mut self, object_type: ObjectType) {
        self.selected = Some(object_type);
        self.cursor = 0;
        self.crc = crc32fast::Hasher::new();
    }

    /// Account for bytes the transport accepted for the active buffer.
    pub fn record_sent(&mut self, bytes: &[u8]) {
        self.cursor += bytes.len();
        self.crc.update(bytes);
    }

    /// Bytes transmitted for the active buffer since the last select.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// CRC-32 of every byte recorded since the last select.
    pub fn crc(&self) -> u32 {
        self.crc.clone().finalize()
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }
}
