//! Legacy DFU client (nRF5 SDK 11 and earlier bootloaders).
//!
//! Sequence:
//! 1. Start DFU - Image type on the control point, sizes on the packet characteristic
//! 2. Init DFU Params - Init packet framed by begin/complete markers
//! 3. Receipt request - Ask for a receipt every N slices
//! 4. Receive image - Stream 20-byte slices, checking receipts every K slices
//! 5. Validate
//! 6. Activate and reset

use std::time::Duration;

use super::chunked::ChunkedWriter;
use super::config::{LEGACY_DFU_CONTROL, LEGACY_DFU_DATA, LEGACY_SLICE_SIZE};
use super::error::{DfuError, DfuResult};
use super::link::{Deadline, GattLink};
use super::packet::{
    build_legacy_activate, build_legacy_image_sizes, build_legacy_init,
    build_legacy_receipt_request, build_legacy_receive_image, build_legacy_report_size,
    build_legacy_start, build_legacy_validate, LegacyOpcode, ObjectType,
};
use super::protocol::{DfuClient, DfuStage};
use super::response::{decode_legacy_notification, LegacyNotification, LegacyResponse};
use super::session::{CancelToken, TransferSession};
use super::transport::BleTransport;
use crate::settings::DfuSettings;

/// Legacy DFU state machine positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyState {
    Starting,
    SendingInit,
    ConfiguringReceipts,
    ReceivingImage,
    Validating,
    Activating,
    Done,
}

/// Drives a Legacy DFU transfer over a connected link.
pub struct LegacyDfuClient<'l, T: BleTransport> {
    link: &'l mut GattLink<T>,
    writer: ChunkedWriter,
    response_timeout: Option<Duration>,
    receipt_interval: u16,
    receipt_check_interval: usize,
}

impl<'l, T: BleTransport> LegacyDfuClient<'l, T> {
    pub fn new(link: &'l mut GattLink<T>, settings: &DfuSettings) -> Self {
        let writer = ChunkedWriter::new(LEGACY_SLICE_SIZE, settings.legacy_pacing())
            .limited_to(link.max_write_size());
        Self {
            link,
            writer,
            response_timeout: settings.response_timeout(),
            receipt_interval: settings.legacy_receipt_interval.max(1),
            receipt_check_interval: settings.legacy_receipt_check_interval.max(1),
        }
    }

    fn start(&mut self, session: &mut TransferSession<'_>) -> DfuResult<()> {
        let package = session.package();
        let cancel = session.cancel_token().clone();

        session.transition(LegacyState::Starting);
        self.control(&build_legacy_start(package.image_type))?;

        let sizes = package.image_sizes()?;
        tracing::debug!(?sizes, "Writing image size header");
        self.link
            .write(LEGACY_DFU_DATA, &build_legacy_image_sizes(&sizes))?;

        self.await_response(LegacyOpcode::StartDfu, &cancel)?;
        Ok(())
    }

    fn send_init(&mut self, session: &mut TransferSession<'_>) -> DfuResult<()> {
        let init = session.init_packet();
        let cancel = session.cancel_token().clone();

        session.transition(LegacyState::SendingInit);
        session.select(ObjectType::Command);
        self.control(&build_legacy_init(false))?;
        self.writer
            .send(self.link, LEGACY_DFU_DATA, init, &cancel, |chunk| {
                session.record_sent(chunk)
            })?;
        self.control(&build_legacy_init(true))?;

        self.await_response(LegacyOpcode::InitDfuParams, &cancel)?;
        Ok(())
    }

    fn send_image(
        &mut self,
        session: &mut TransferSession<'_>,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()> {
        let image = session.image();
        let total = image.len();
        let cancel = session.cancel_token().clone();

        session.transition(LegacyState::ConfiguringReceipts);
        self.control(&build_legacy_receipt_request(self.receipt_interval))?;

        session.transition(LegacyState::ReceivingImage);
        session.select(ObjectType::Data);
        self.control(&build_legacy_receive_image())?;
        on_progress(DfuStage::Uploading { sent: 0, total });

        let batch_len = self
            .receipt_check_interval
            .saturating_mul(self.writer.chunk_size());
        for batch in image.chunks(batch_len) {
            self.writer
                .send(self.link, LEGACY_DFU_DATA, batch, &cancel, |chunk| {
                    session.record_sent(chunk);
                    on_progress(DfuStage::Uploading {
                        sent: session.cursor(),
                        total,
                    });
                })?;

            let sent = session.cursor();
            if sent < total {
                self.check_receipt(sent, &cancel, on_progress)?;
            }
        }

        self.await_response(LegacyOpcode::ReceiveFirmwareImage, &cancel)?;
        tracing::info!(bytes = total, "Firmware image received by device");
        Ok(())
    }

    /// Wait for a receipt, then probe the device with Report Received Image Size.
    fn check_receipt(
        &mut self,
        sent: usize,
        cancel: &CancelToken,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()> {
        let received = self.await_receipt(cancel)?;
        if received as usize != sent {
            tracing::warn!(
                sent,
                received,
                "Receipt does not match bytes sent; bootloader cadence differs from requested interval"
            );
            on_progress(DfuStage::Log {
                message: format!("Receipt reported {} of {} bytes sent", received, sent),
            });
        }

        self.control(&build_legacy_report_size())?;
        let response = self.await_response(LegacyOpcode::ReportReceivedImageSize, cancel)?;
        let reported = response
            .reported_size()
            .map_err(|e| DfuError::decode(e, &response.payload))?;
        tracing::debug!(sent, reported, "Device reported received image size");
        Ok(())
    }

    fn control(&mut self, payload: &[u8]) -> DfuResult<()> {
        tracing::debug!(payload = ?payload, "Control write");
        self.link.write(LEGACY_DFU_CONTROL, payload)
    }

    /// Next control point frame, skipping notifications from other characteristics.
    fn next_frame(
        &mut self,
        operation: &str,
        deadline: Option<Deadline>,
        cancel: &CancelToken,
    ) -> DfuResult<LegacyNotification> {
        loop {
            let notification = self
                .link
                .next_notification_until(operation, deadline, cancel)?;

            if notification.characteristic != LEGACY_DFU_CONTROL {
                tracing::debug!(
                    characteristic = %notification.characteristic,
                    "Skipping notification from other characteristic"
                );
                continue;
            }

            return decode_legacy_notification(&notification.value)
                .map_err(|e| DfuError::decode(e, &notification.value));
        }
    }

    fn await_response(
        &mut self,
        procedure: LegacyOpcode,
        cancel: &CancelToken,
    ) -> DfuResult<LegacyResponse> {
        let operation = format!("{procedure:?}");
        let deadline = Deadline::from_timeout(self.response_timeout);
        loop {
            match self.next_frame(&operation, deadline, cancel)? {
                LegacyNotification::Receipt { bytes_received } => {
                    tracing::debug!(bytes_received, "Skipping receipt while awaiting response");
                }
                LegacyNotification::Response(response) if response.procedure != procedure => {
                    tracing::debug!(
                        expected = %procedure,
                        got = %response.procedure,
                        "Skipping stale response"
                    );
                }
                LegacyNotification::Response(response) => {
                    tracing::debug!(%procedure, result = ?response.result, "Control response");
                    return response.into_success();
                }
            }
        }
    }

    fn await_receipt(&mut self, cancel: &CancelToken) -> DfuResult<u32> {
        let deadline = Deadline::from_timeout(self.response_timeout);
        loop {
            match self.next_frame("PacketReceiptNotification", deadline, cancel)? {
                LegacyNotification::Receipt { bytes_received } => {
                    tracing::trace!(bytes_received, "Receipt");
                    return Ok(bytes_received);
                }
                LegacyNotification::Response(response) if !response.is_success() => {
                    response.into_success()?;
                }
                LegacyNotification::Response(response) => {
                    tracing::debug!(
                        procedure = %response.procedure,
                        "Skipping response while awaiting receipt"
                    );
                }
            }
        }
    }
}

impl<T: BleTransport> DfuClient for LegacyDfuClient<'_, T> {
    fn drive_transfer(
        &mut self,
        session: &mut TransferSession<'_>,
        on_progress: &dyn Fn(DfuStage),
    ) -> DfuResult<()> {
        self.link.subscribe(LEGACY_DFU_CONTROL)?;

        on_progress(DfuStage::Starting);
        self.start(session)?;

        on_progress(DfuStage::SendingInit);
        self.send_init(session)?;

        self.send_image(session, on_progress)?;

        let cancel = session.cancel_token().clone();
        session.transition(LegacyState::Validating);
        on_progress(DfuStage::Validating);
        self.control(&build_legacy_validate())?;
        self.await_response(LegacyOpcode::ValidateFirmware, &cancel)?;

        session.transition(LegacyState::Activating);
        on_progress(DfuStage::Activating);
        self.control(&build_legacy_activate())?;

        session.transition(LegacyState::Done);
        tracing::info!("Legacy DFU transfer complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::packet::{ImageType, LegacyStatus};
    use crate::dfu::session::SessionState;
    use crate::dfu::config::LEGACY_DFU_SERVICE;
    use crate::test_helpers::fixtures::{
        connected_legacy_link, fast_settings, package_with, silent_link, LegacyDeviceBehavior,
        NotificationFlood,
    };
    use std::time::Instant;

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 13 % 256) as u8).collect()
    }

    #[test]
    fn test_small_image_with_receipt_drift() {
        let image = patterned(300);
        let package = package_with(vec![0x11; 14], image.clone());
        let (mut link, device) = connected_legacy_link(LegacyDeviceBehavior::default());

        let mut session = TransferSession::new(&package, CancelToken::new());
        LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|_| {})
            .unwrap();

        let record = device.record();
        assert_eq!(record.image_type, Some(ImageType::Application as u8));
        assert_eq!(record.size_header, [0, 0, 0, 0, 0, 0, 0, 0, 44, 1, 0, 0]);
        assert_eq!(record.received_init, vec![0x11; 14]);
        assert_eq!(record.receipt_interval, Some(12));
        assert_eq!(record.slice_count, 15);
        assert_eq!(record.received_image, image);
        assert_eq!(record.report_size_requests, 1);
        assert!(record.validated);
        assert!(record.activated);
        assert_eq!(session.state(), SessionState::Legacy(LegacyState::Done));
    }

    #[test]
    fn test_drift_reported_as_log_stage() {
        let package = package_with(vec![0x11; 14], patterned(300));
        let (mut link, _device) = connected_legacy_link(LegacyDeviceBehavior::default());
        let logs = std::cell::RefCell::new(Vec::new());

        let mut session = TransferSession::new(&package, CancelToken::new());
        LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|stage| {
                if let DfuStage::Log { message } = stage {
                    logs.borrow_mut().push(message);
                }
            })
            .unwrap();

        assert_eq!(logs.borrow().as_slice(), ["Receipt reported 240 of 280 bytes sent"]);
    }

    #[test]
    fn test_longer_image_skips_queued_receipts() {
        let image = patterned(1000);
        let package = package_with(vec![0x22; 20], image.clone());
        let (mut link, device) = connected_legacy_link(LegacyDeviceBehavior::default());

        let mut session = TransferSession::new(&package, CancelToken::new());
        LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|_| {})
            .unwrap();

        let record = device.record();
        assert_eq!(record.slice_count, 50);
        assert_eq!(record.received_image, image);
        assert_eq!(record.report_size_requests, 3);
    }

    #[test]
    fn test_image_ending_on_check_boundary() {
        let image = patterned(280);
        let package = package_with(vec![0x11; 4], image.clone());
        let (mut link, device) = connected_legacy_link(LegacyDeviceBehavior::default());

        let mut session = TransferSession::new(&package, CancelToken::new());
        LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|_| {})
            .unwrap();

        let record = device.record();
        assert_eq!(record.received_image, image);
        assert_eq!(record.report_size_requests, 0);
    }

    #[test]
    fn test_validation_failure_is_reported() {
        let package = package_with(vec![0x11; 14], patterned(100));
        let behavior = LegacyDeviceBehavior {
            validate_status: LegacyStatus::CrcError,
            ..Default::default()
        };
        let (mut link, device) = connected_legacy_link(behavior);

        let mut session = TransferSession::new(&package, CancelToken::new());
        let result = LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|_| {});

        assert!(matches!(
            result,
            Err(DfuError::LegacyProtocol {
                procedure: LegacyOpcode::ValidateFirmware,
                status: LegacyStatus::CrcError,
            })
        ));
        assert!(!device.record().activated);
    }

    #[test]
    fn test_start_rejected() {
        let package = package_with(vec![0x11; 14], patterned(100));
        let behavior = LegacyDeviceBehavior {
            start_status: LegacyStatus::NotSupported,
            ..Default::default()
        };
        let (mut link, _device) = connected_legacy_link(behavior);

        let mut session = TransferSession::new(&package, CancelToken::new());
        let result = LegacyDfuClient::new(&mut link, &fast_settings())
            .drive_transfer(&mut session, &|_| {});

        assert!(matches!(
            result,
            Err(DfuError::LegacyProtocol {
                procedure: LegacyOpcode::StartDfu,
                status: LegacyStatus::NotSupported,
            })
        ));
        assert_eq!(session.state(), SessionState::Legacy(LegacyState::Starting));
    }

    #[test]
    fn test_missing_receipt_times_out() {
        let package = package_with(vec![0x11; 14], patterned(300));
        let behavior = LegacyDeviceBehavior {
            send_receipts: false,
            ..Default::default()
        };
        let (mut link, _device) = connected_legacy_link(behavior);
        let settings = DfuSettings {
            response_timeout_ms: Some(50),
            ..fast_settings()
        };

        let mut session = TransferSession::new(&package, CancelToken::new());
        let result = LegacyDfuClient::new(&mut link, &settings).drive_transfer(&mut session, &|_| {});

        assert!(matches!(result, Err(DfuError::Timeout { .. })));
    }

    #[test]
    fn test_oversized_check_interval_sends_single_batch() {
        let image = patterned(300);
        let package = package_with(vec![0x11; 14], image.clone());
        let (mut link, device) = connected_legacy_link(LegacyDeviceBehavior::default());
        let settings = DfuSettings {
            legacy_receipt_check_interval: usize::MAX / 4,
            ..fast_settings()
        };

        let mut session = TransferSession::new(&package, CancelToken::new());
        LegacyDfuClient::new(&mut link, &settings)
            .drive_transfer(&mut session, &|_| {})
            .unwrap();

        let record = device.record();
        assert_eq!(record.received_image, image);
        assert_eq!(record.report_size_requests, 0);
    }

    #[test]
    fn test_receipt_flood_does_not_extend_timeout() {
        let package = package_with(vec![0x11; 14], patterned(300));
        let (mut link, events) =
            silent_link(LEGACY_DFU_SERVICE, &[LEGACY_DFU_CONTROL, LEGACY_DFU_DATA]);
        let _flood = NotificationFlood::start(
            events,
            LEGACY_DFU_CONTROL,
            vec![0x11, 0x00, 0x00, 0x00, 0x00],
            Duration::from_millis(10),
        );
        let settings = DfuSettings {
            response_timeout_ms: Some(100),
            ..fast_settings()
        };

        let started = Instant::now();
        let mut session = TransferSession::new(&package, CancelToken::new());
        let result = LegacyDfuClient::new(&mut link, &settings).drive_transfer(&mut session, &|_| {});

        assert!(matches!(
            result,
            Err(DfuError::Timeout { operation, timeout_ms: 100 }) if operation == "StartDfu"
        ));
        assert!(started.elapsed() < Duration::from_millis(600));
    }
}
