use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use uuid::Uuid;

use crate::dfu::config::{
    LEGACY_DFU_CONTROL, LEGACY_DFU_DATA, LEGACY_DFU_SERVICE, SECURE_DFU_CONTROL, SECURE_DFU_DATA,
    SECURE_DFU_SERVICE,
};
use crate::dfu::packet::{ExtendedError, ImageType, LegacyStatus, ResultCode};
use crate::dfu::{
    event_channel, BleTransport, CancelToken, ConnectionEvent, DfuResult, EventSender,
    FirmwarePackage, GattLink, ManifestData, MockBleTransport, Notification, TransportEvent,
};
use crate::settings::DfuSettings;

/// Build an application package from raw buffers.
pub fn package_with(init: Vec<u8>, image: Vec<u8>) -> FirmwarePackage {
    FirmwarePackage {
        init_packet: init.into(),
        image: image.into(),
        image_type: ImageType::Application,
        manifest: ManifestData::default(),
    }
}

/// Settings with pacing disabled and a short response timeout.
pub fn fast_settings() -> DfuSettings {
    DfuSettings {
        pacing_ms: 0,
        legacy_pacing_ms: 0,
        response_timeout_ms: Some(1_000),
        ..Default::default()
    }
}

/// Announce connection plus discovery of the given service's characteristics.
fn announce(events: &EventSender, service: Uuid, characteristics: &[Uuid]) -> DfuResult<()> {
    events.send(TransportEvent::Connection(ConnectionEvent::Connected))?;
    for characteristic in characteristics {
        events.send(TransportEvent::CharacteristicDiscovered {
            service,
            characteristic: *characteristic,
        })?;
    }
    events.send(TransportEvent::DiscoveryComplete)
}

// ============================================================================
// Simulated Secure DFU bootloader
// ============================================================================

/// Scripted deviations from a well-behaved Secure DFU bootloader.
#[derive(Debug, Clone)]
pub struct SecureDeviceBehavior {
    pub command_max_size: u32,
    pub data_max_size: u32,
    /// Command object contents left over from an earlier session.
    pub preloaded_init: Vec<u8>,
    /// Offset reported by the data select.
    pub data_offset: u32,
    pub corrupt_data_crc: bool,
    /// Report one byte fewer than received on data CRC responses.
    pub short_data_offset: bool,
    pub reject_init_execute: Option<ExtendedError>,
    pub reject_data_create: Option<ResultCode>,
    /// Notify an Execute response ahead of every CRC response.
    pub stale_before_crc: bool,
}

impl Default for SecureDeviceBehavior {
    fn default() -> Self {
        Self {
            command_max_size: 512,
            data_max_size: 4096,
            preloaded_init: Vec::new(),
            data_offset: 0,
            corrupt_data_crc: false,
            short_data_offset: false,
            reject_init_execute: None,
            reject_data_create: None,
            stale_before_crc: false,
        }
    }
}

/// What the simulated Secure DFU bootloader observed.
#[derive(Debug, Clone, Default)]
pub struct SecureRecord {
    pub control_opcodes: Vec<u8>,
    pub command_creates: usize,
    pub data_objects: Vec<usize>,
    pub data_crcs: Vec<(u32, u32)>,
    pub received_init: Vec<u8>,
    pub received_image: Vec<u8>,
    pub executed: usize,
}

pub struct SimulatedSecureDevice {
    events: EventSender,
    behavior: SecureDeviceBehavior,
    record: Arc<Mutex<SecureRecord>>,
    command_object: Vec<u8>,
    selected: u8,
}

/// Test-side view of a simulated device.
pub struct DeviceHandle<R> {
    record: Arc<Mutex<R>>,
}

impl<R: Clone> DeviceHandle<R> {
    pub fn record(&self) -> R {
        self.record.lock().unwrap().clone()
    }
}

impl SimulatedSecureDevice {
    fn respond(&self, request: u8, result: u8, payload: &[u8]) {
        let mut frame = vec![0x60, request, result];
        frame.extend_from_slice(payload);
        self.events.notify(SECURE_DFU_CONTROL, &frame).unwrap();
    }

    fn handle_control(&mut self, data: &[u8]) {
        let mut record = self.record.lock().unwrap();
        record.control_opcodes.push(data[0]);

        match data[0] {
            // Receipt Notification Set
            0x02 => self.respond(0x02, 0x01, &[]),
            // Select
            0x06 => {
                self.selected = data[1];
                let (max_size, offset, crc) = if data[1] == 0x01 {
                    (
                        self.behavior.command_max_size,
                        self.command_object.len() as u32,
                        crc32fast::hash(&self.command_object),
                    )
                } else {
                    (self.behavior.data_max_size, self.behavior.data_offset, 0)
                };
                let mut payload = Vec::new();
                payload.extend_from_slice(&max_size.to_le_bytes());
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(0x06, 0x01, &payload);
            }
            // Create
            0x01 => {
                self.selected = data[1];
                let size = u32::from_le_bytes([data[2], data[3], data[4], data[5]]) as usize;
                if data[1] == 0x02 {
                    if let Some(code) = self.behavior.reject_data_create {
                        self.respond(0x01, code as u8, &[]);
                        return;
                    }
                    record.data_objects.push(size);
                } else {
                    self.command_object.clear();
                    record.command_creates += 1;
                }
                self.respond(0x01, 0x01, &[]);
            }
            // CRC Get
            0x03 => {
                if self.behavior.stale_before_crc {
                    self.respond(0x04, 0x01, &[]);
                }
                let (mut offset, mut crc) = if self.selected == 0x01 {
                    (
                        self.command_object.len() as u32,
                        crc32fast::hash(&self.command_object),
                    )
                } else {
                    (
                        record.received_image.len() as u32,
                        crc32fast::hash(&record.received_image),
                    )
                };
                if self.selected == 0x02 {
                    if self.behavior.corrupt_data_crc {
                        crc ^= 0xFFFF_FFFF;
                    }
                    if self.behavior.short_data_offset {
                        offset = offset.saturating_sub(1);
                    }
                    record.data_crcs.push((offset, crc));
                }
                let mut payload = Vec::new();
                payload.extend_from_slice(&offset.to_le_bytes());
                payload.extend_from_slice(&crc.to_le_bytes());
                self.respond(0x03, 0x01, &payload);
            }
            // Execute
            0x04 => match self.behavior.reject_init_execute {
                Some(error) if self.selected == 0x01 => {
                    self.respond(0x04, 0x0B, &[error as u8])
                }
                _ => {
                    record.executed += 1;
                    self.respond(0x04, 0x01, &[]);
                }
            },
            // Ping
            0x09 => self.respond(0x09, 0x01, &[data[1]]),
            // Abort
            0x0C => {}
            other => self.respond(other, ResultCode::OpCodeNotSupported as u8, &[]),
        }
    }
}

impl BleTransport for SimulatedSecureDevice {
    fn connect(&mut self, _peripheral_id: &str) -> DfuResult<()> {
        announce(
            &self.events,
            SECURE_DFU_SERVICE,
            &[SECURE_DFU_CONTROL, SECURE_DFU_DATA],
        )
    }

    fn subscribe(&mut self, _characteristic: Uuid) -> DfuResult<()> {
        Ok(())
    }

    fn write(&mut self, characteristic: Uuid, data: &[u8]) -> DfuResult<()> {
        if characteristic == SECURE_DFU_CONTROL {
            self.handle_control(data);
        } else if self.selected == 0x01 {
            self.command_object.extend_from_slice(data);
            self.record.lock().unwrap().received_init.extend_from_slice(data);
        } else {
            self.record.lock().unwrap().received_image.extend_from_slice(data);
        }
        Ok(())
    }

    fn max_write_size(&self) -> usize {
        244
    }
}

/// Connect a link to a simulated Secure DFU bootloader.
pub fn connected_secure_link(
    behavior: SecureDeviceBehavior,
) -> (GattLink<SimulatedSecureDevice>, DeviceHandle<SecureRecord>) {
    let (events, receiver) = event_channel(64);
    let record = Arc::new(Mutex::new(SecureRecord::default()));
    let device = SimulatedSecureDevice {
        events,
        command_object: behavior.preloaded_init.clone(),
        behavior,
        record: Arc::clone(&record),
        selected: 0,
    };

    let mut link = GattLink::new(device, receiver);
    link.connect("secure-sim", Some(Duration::from_secs(1)), &CancelToken::new())
        .unwrap();
    (link, DeviceHandle { record })
}

// ============================================================================
// Simulated Legacy DFU bootloader
// ============================================================================

/// Scripted deviations from a well-behaved Legacy DFU bootloader.
#[derive(Debug, Clone)]
pub struct LegacyDeviceBehavior {
    pub start_status: LegacyStatus,
    pub validate_status: LegacyStatus,
    pub send_receipts: bool,
}

impl Default for LegacyDeviceBehavior {
    fn default() -> Self {
        Self {
            start_status: LegacyStatus::Success,
            validate_status: LegacyStatus::Success,
            send_receipts: true,
        }
    }
}

/// What the simulated Legacy DFU bootloader observed.
#[derive(Debug, Clone, Default)]
pub struct LegacyRecord {
    pub image_type: Option<u8>,
    pub size_header: Vec<u8>,
    pub received_init: Vec<u8>,
    pub receipt_interval: Option<u16>,
    pub slice_count: usize,
    pub received_image: Vec<u8>,
    pub report_size_requests: usize,
    pub validated: bool,
    pub activated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LegacyPhase {
    Idle,
    AwaitingSizes,
    ReceivingInit,
    ReceivingImage,
}

pub struct SimulatedLegacyDevice {
    events: EventSender,
    behavior: LegacyDeviceBehavior,
    record: Arc<Mutex<LegacyRecord>>,
    phase: LegacyPhase,
    expected_image_len: usize,
}

impl SimulatedLegacyDevice {
    fn respond(&self, procedure: u8, status: LegacyStatus, payload: &[u8]) {
        let mut frame = vec![0x10, procedure, status as u8];
        frame.extend_from_slice(payload);
        self.events.notify(LEGACY_DFU_CONTROL, &frame).unwrap();
    }

    fn handle_control(&mut self, data: &[u8]) {
        let mut record = self.record.lock().unwrap();
        match data[0] {
            0x01 => {
                record.image_type = Some(data[1]);
                self.phase = LegacyPhase::AwaitingSizes;
            }
            0x02 if data[1] == 0x00 => self.phase = LegacyPhase::ReceivingInit,
            0x02 => {
                self.phase = LegacyPhase::Idle;
                self.respond(0x02, LegacyStatus::Success, &[]);
            }
            0x03 => self.phase = LegacyPhase::ReceivingImage,
            0x04 => {
                record.validated = self.behavior.validate_status == LegacyStatus::Success;
                self.respond(0x04, self.behavior.validate_status, &[]);
            }
            0x05 => record.activated = true,
            0x07 => {
                record.report_size_requests += 1;
                let size = record.received_image.len() as u32;
                self.respond(0x07, LegacyStatus::Success, &size.to_le_bytes());
            }
            0x08 => record.receipt_interval = Some(u16::from_le_bytes([data[1], data[2]])),
            other => self.respond(other, LegacyStatus::NotSupported, &[]),
        }
    }

    fn handle_data(&mut self, data: &[u8]) {
        let mut record = self.record.lock().unwrap();
        match self.phase {
            LegacyPhase::AwaitingSizes => {
                record.size_header = data.to_vec();
                self.expected_image_len = data
                    .chunks(4)
                    .map(|size| u32::from_le_bytes([size[0], size[1], size[2], size[3]]) as usize)
                    .sum();
                self.phase = LegacyPhase::Idle;
                self.respond(0x01, self.behavior.start_status, &[]);
            }
            LegacyPhase::ReceivingInit => record.received_init.extend_from_slice(data),
            LegacyPhase::ReceivingImage => {
                record.received_image.extend_from_slice(data);
                record.slice_count += 1;

                let interval = record.receipt_interval.unwrap_or(0) as usize;
                if self.behavior.send_receipts && interval > 0 && record.slice_count % interval == 0
                {
                    let mut frame = vec![0x11];
                    frame.extend_from_slice(&(record.received_image.len() as u32).to_le_bytes());
                    self.events.notify(LEGACY_DFU_CONTROL, &frame).unwrap();
                }

                if record.received_image.len() >= self.expected_image_len {
                    self.phase = LegacyPhase::Idle;
                    self.respond(0x03, LegacyStatus::Success, &[]);
                }
            }
            LegacyPhase::Idle => {}
        }
    }
}

impl BleTransport for SimulatedLegacyDevice {
    fn connect(&mut self, _peripheral_id: &str) -> DfuResult<()> {
        announce(
            &self.events,
            LEGACY_DFU_SERVICE,
            &[LEGACY_DFU_CONTROL, LEGACY_DFU_DATA],
        )
    }

    fn subscribe(&mut self, _characteristic: Uuid) -> DfuResult<()> {
        Ok(())
    }

    fn write(&mut self, characteristic: Uuid, data: &[u8]) -> DfuResult<()> {
        if characteristic == LEGACY_DFU_CONTROL {
            self.handle_control(data);
        } else {
            self.handle_data(data);
        }
        Ok(())
    }

    fn max_write_size(&self) -> usize {
        20
    }
}

/// Connect a link to a simulated Legacy DFU bootloader.
pub fn connected_legacy_link(
    behavior: LegacyDeviceBehavior,
) -> (GattLink<SimulatedLegacyDevice>, DeviceHandle<LegacyRecord>) {
    let (events, receiver) = event_channel(64);
    let record = Arc::new(Mutex::new(LegacyRecord::default()));
    let device = SimulatedLegacyDevice {
        events,
        behavior,
        record: Arc::clone(&record),
        phase: LegacyPhase::Idle,
        expected_image_len: 0,
    };

    let mut link = GattLink::new(device, receiver);
    link.connect("legacy-sim", Some(Duration::from_secs(1)), &CancelToken::new())
        .unwrap();
    (link, DeviceHandle { record })
}

/// Simulated devices for the full `upload_firmware` path, created before connecting.
pub fn secure_device(
    behavior: SecureDeviceBehavior,
    events: EventSender,
) -> (SimulatedSecureDevice, DeviceHandle<SecureRecord>) {
    let record = Arc::new(Mutex::new(SecureRecord::default()));
    let device = SimulatedSecureDevice {
        events,
        command_object: behavior.preloaded_init.clone(),
        behavior,
        record: Arc::clone(&record),
        selected: 0,
    };
    (device, DeviceHandle { record })
}

pub fn legacy_device(
    behavior: LegacyDeviceBehavior,
    events: EventSender,
) -> (SimulatedLegacyDevice, DeviceHandle<LegacyRecord>) {
    let record = Arc::new(Mutex::new(LegacyRecord::default()));
    let device = SimulatedLegacyDevice {
        events,
        behavior,
        record: Arc::clone(&record),
        phase: LegacyPhase::Idle,
        expected_image_len: 0,
    };
    (device, DeviceHandle { record })
}

// ============================================================================
// Unresponsive peripherals
// ============================================================================

/// Link to a peripheral that accepts every write and never answers.
pub fn silent_link(
    service: Uuid,
    characteristics: &[Uuid],
) -> (GattLink<MockBleTransport>, EventSender) {
    let (events, receiver) = event_channel(256);
    announce(&events, service, characteristics).unwrap();

    let mut mock = MockBleTransport::new();
    mock.expect_connect().returning(|_| Ok(()));
    mock.expect_subscribe().returning(|_| Ok(()));
    mock.expect_write().returning(|_, _| Ok(()));
    mock.expect_max_write_size().return_const(244usize);

    let mut link = GattLink::new(mock, receiver);
    link.connect("silent", Some(Duration::from_secs(1)), &CancelToken::new())
        .unwrap();
    (link, events)
}

/// Repeats one notification from a background thread until dropped.
pub struct NotificationFlood {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl NotificationFlood {
    pub fn start(events: EventSender, characteristic: Uuid, value: Vec<u8>, every: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !flag.load(Ordering::SeqCst) {
                events.try_send(TransportEvent::Notification(Notification {
                    characteristic,
                    value: value.clone(),
                }));
                thread::sleep(every);
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for NotificationFlood {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
