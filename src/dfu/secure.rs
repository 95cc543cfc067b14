//! Secure DFU client (nRF5 SDK 12 and later bootloaders).
//!
//! Transfers the init packet as one command object and the firmware image as
//! a series of data objects. Every object follows the same cycle:
//! 1. Create - Allocate an object of at most `max_size` bytes
//! 2. Write - Stream the object on the data characteristic
//! 3. CRC Get - Compare offset and CRC-32 with what was sent
//! 4. Execute - Commit the object

use std::time::Duration;

use super::chunked::{object_sizes, ChunkedWriter};
use super::config::{SECURE_DFU_CONTROL, SECURE_DFU_DATA};
use super::error::{DfuError, DfuResult};
use super::link::{Deadline, GattLink};
use super::packet::{
    build_abort, build_crc_get, build_create, build_execute, build_ping, build_receipt_notif_set,
    build_select, wire_len, ObjectType, SecureOpcode,
};
use super::protocol::{DfuClient, DfuStage};
use super::response::{ObjectInfo, SecureResponse};
use super::session::{CancelToken, TransferSession};
use super::transport::BleTransport;
use crate::settings::DfuSettings;

/// Secure DFU state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecureState {
    SelectingInit,
    CreatingInit,
    TransferringInit,
    CrcCheckingInit,
    ExecutingInit,
    SelectingData,
    CreatingData,
    TransferringData,
    CrcCheckingData,
    ExecutingData,
    Done,
}

/// Drives a Secure DFU transfer over a connected link.
pub struct SecureDfuClient<'l, T: BleTransport> {
    link: &'l mut GattLink<T>,
    writer: ChunkedWriter,
    response_timeout: Option<Duration>,
    disable_receipts: bool,
}

impl<'l, T: BleTransport> SecureDfuClient<'l, T> {
    pub fn new(link: &'l mut GattLink<T>, settings: &DfuSettings) -> Self {
        let writer = ChunkedWriter::new(settings.chunk_size, settings.pacing())
            .limited_to(link.max_write_size());
        Self {
            link,
            writer,
            response_timeout: settings.response_timeout(),
            disable_receipts: settings.disable_receipt_notifications,
        }
    }

    /// Enable notifications on the control point.
    pub fn subscribe(&mut self) -> DfuResult<()> {
        self.link.subscribe(SECURE_DFU_CONTROL)
    }

    /// Set the packet receipt notification interval. Zero disables receipts.
    pub fn set_receipt_notification(&mut self, prn: u16, cancel: &CancelToken) -> DfuResult<()> {
        self.request(
            SecureOpcode::ReceiptNotifSet,
            &build_receipt_notif_set(prn),
            cancel,
        )?;
        Ok(())
    }

    /// Round-trip an identifier through the bootloader.
    pub fn ping(&mut self, id: u8, cancel: &CancelToken) -> DfuResult<()> {
        let response = self.request(SecureOpcode::Ping, &build_ping(id), cancel)?;
        match response.payload.first() {
            Some(echoed) if *echoed == id => Ok(()),
            _ => Err(DfuError::transport(
                "ping",
                format!("expected id {id}, got {:02X?}", response.payload),
            )),
        }
    }

    /// Ask the bootloader to drop the current transfer. The device does not
    /// reliably answer before resetting, so no response is awaited.
    pub fn abort(&mut self) -> DfuResult<()> {
        tracing::info!("Aborting Secure DFU transfer");
        self.link.write(SECURE_DFU_CONTROL, &build_abort())
    }

    fn select(
        &mut self,
        object_type: ObjectType,
        session: &mut TransferSession<'_>,
    ) -> DfuResult<ObjectInfo> {
        let cancel = session.cancel_token().clone();
        let response = self.request(SecureOpcode::ObjectSelect, &build_select(object_type), &cancel)?;
        let info = response
            .object_info()
            .map_err(|e| DfuError::decode(e, &response.payload))?;
        session.select(object_type);

        tracing::debug!(
            %object_type,
            max_size = info.max_size,
            offset = info.offset,
            crc = format_args!("0x{:08X}", info.crc),
            "Object selected"
        );
        Ok(info)
    }

    fn transfer_init(&mut self, session: &mut TransferSession<'_>) -> DfuResult<()> {
        let init = session.init_packet();
        let cancel = session.cancel_token().clone();

        session.transition(SecureState::SelectingInit);
        let info = self.select(ObjectType::Command, session)?;

        if init_already_received(&info, init) {
            tracing::info!(len = init.len(), "Init packet already on device, skipping");
            return Ok(());
        }
        if info.max_size == 0 {
            return Err(DfuError::InvalidObjectSize { max_size: 0 });
        }

        session.transition(SecureState::CreatingInit);
        self.request(
            SecureOpcode::ObjectCreate,
            &build_create(ObjectType::Command, wire_len(init.len())?),
            &cancel,
        )?;

        session.transition(SecureState::TransferringInit);
        self.writer
            .send(self.link, SECURE_DFU_DATA, init, &cancel, |chunk| {
                session.record_sent(chunk)
            })?;

        session.transition(SecureState::CrcCheckingInit);
        self.verify_crc(session)?;

        session.transition(SecureState::ExecutingInit);
        self.request(SecureOpcode::ObjectExecute, &build_execute(), &cancel)?;
        Ok(())
    }

    fn transfer_image(
        &mut self,
        session: &mut TransferSession<'_>,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()> {
        let image = session.image();
        let total = image.len();
        let cancel = session.cancel_token().clone();

        session.transition(SecureState::SelectingData);
        let info = self.select(ObjectType::Data, session)?;
        if info.offset != 0 {
            return Err(DfuError::ResumeNotSupported {
                offset: info.offset,
            });
        }
        if info.max_size == 0 {
            return Err(DfuError::InvalidObjectSize { max_size: 0 });
        }

        let sizes = object_sizes(total, info.max_size as usize);
        tracing::info!(
            total,
            max_size = info.max_size,
            objects = sizes.len(),
            "Sending firmware image"
        );
        on_progress(DfuStage::Uploading { sent: 0, total });

        let mut start = 0;
        for size in sizes {
            let object = &image[start..start + size];

            session.transition(SecureState::CreatingData);
            self.request(
                SecureOpcode::ObjectCreate,
                &build_create(ObjectType::Data, wire_len(size)?),
                &cancel,
            )?;

            session.transition(SecureState::TransferringData);
            self.writer
                .send(self.link, SECURE_DFU_DATA, object, &cancel, |chunk| {
                    session.record_sent(chunk);
                    on_progress(DfuStage::Uploading {
                        sent: session.cursor(),
                        total,
                    });
                })?;

            session.transition(SecureState::CrcCheckingData);
            self.verify_crc(session)?;

            session.transition(SecureState::ExecutingData);
            self.request(SecureOpcode::ObjectExecute, &build_execute(), &cancel)?;

            start += size;
        }

        Ok(())
    }

    /// Check the device's offset and CRC against everything sent since the last select.
    fn verify_crc(&mut self, session: &TransferSession<'_>) -> DfuResult<()> {
        let response = self.request(SecureOpcode::CrcGet, &build_crc_get(), session.cancel_token())?;
        let info = response
            .crc_info()
            .map_err(|e| DfuError::decode(e, &response.payload))?;

        let expected_offset = wire_len(session.cursor())?;
        if info.offset != expected_offset {
            return Err(DfuError::OffsetMismatch {
                expected: expected_offset,
                actual: info.offset,
            });
        }

        let expected_crc = session.crc();
        if info.crc != expected_crc {
            return Err(DfuError::CrcMismatch {
                expected: expected_crc,
                actual: info.crc,
            });
        }

        tracing::debug!(
            offset = info.offset,
            crc = format_args!("0x{:08X}", info.crc),
            "CRC verified"
        );
        Ok(())
    }

    /// Write a control request and wait for its response.
    fn request(
        &mut self,
        request: SecureOpcode,
        payload: &[u8],
        cancel: &CancelToken,
    ) -> DfuResult<SecureResponse> {
        cancel.check()?;
        tracing::debug!(%request, payload = ?payload, "Control write");
        self.link.write(SECURE_DFU_CONTROL, payload)?;
        self.await_response(request, cancel)
    }

    fn await_response(
        &mut self,
        request: SecureOpcode,
        cancel: &CancelToken,
    ) -> DfuResult<SecureResponse> {
        let operation = format!("{request:?}");
        let deadline = Deadline::from_timeout(self.response_timeout);
        loop {
            let notification = self
                .link
                .next_notification_until(&operation, deadline, cancel)?;

            if notification.characteristic != SECURE_DFU_CONTROL {
                tracing::debug!(
                    characteristic = %notification.characteristic,
                    "Skipping notification from other characteristic"
                );
                continue;
            }

            let response = SecureResponse::decode(&notification.value)
                .map_err(|e| DfuError::decode(e, &notification.value))?;

            if response.request != request {
                tracing::debug!(
                    expected = %request,
                    got = %response.request,
                    "Skipping stale response"
                );
                continue;
            }

            tracing::debug!(%request, result = ?response.result, "Control response");
            return response.into_success();
        }
    }
}

/// True when the device already holds the complete init packet.
pub fn init_already_received(info: &ObjectInfo, init: &[u8]) -> bool {
    wire_len(init.len()).is_ok_and(|len| info.offset == len)
        && info.crc == crc32fast::hash(init)
}

impl<T: BleTransport> DfuClient for SecureDfuClient<'_, T> {
    fn drive_transfer(
        &mut self,
        session: &mut TransferSession<'_>,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()> {
        self.subscribe()?;

        if self.disable_receipts {
            let cancel = session.cancel_token().clone();
            self.set_receipt_notification(0, &cancel)?;
        }

        on_progress(DfuStage::SendingInit);
        self.transfer_init(session)?;

        self.transfer_image(session, on_progress)?;

        session.transition(SecureState::Done);
        tracing::info!(bytes = session.image().len(), "Secure DFU transfer complete");
        Ok(())
    }
}
