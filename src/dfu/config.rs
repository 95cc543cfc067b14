//! Configuration constants for the Nordic BLE DFU protocols.

use std::time::Duration;

use uuid::Uuid;

// ============================================================================
// Secure DFU GATT Identifiers
// ============================================================================

/// Secure DFU service (16-bit Nordic UUID 0xFE59).
pub const SECURE_DFU_SERVICE: Uuid = Uuid::from_u128(0x0000FE59_0000_1000_8000_00805F9B34FB);

/// Secure DFU control point characteristic (write + notify).
pub const SECURE_DFU_CONTROL: Uuid = Uuid::from_u128(0x8EC90001_F315_4F60_9FB8_838830DAEA50);

/// Secure DFU packet characteristic (write without response).
pub const SECURE_DFU_DATA: Uuid = Uuid::from_u128(0x8EC90002_F315_4F60_9FB8_838830DAEA50);

// ============================================================================
// Legacy DFU GATT Identifiers
// ============================================================================

/// Legacy DFU service.
pub const LEGACY_DFU_SERVICE: Uuid = Uuid::from_u128(0x00001530_1212_EFDE_1523_785FEABCD123);

/// Legacy DFU control point characteristic.
pub const LEGACY_DFU_CONTROL: Uuid = Uuid::from_u128(0x00001531_1212_EFDE_1523_785FEABCD123);

/// Legacy DFU packet characteristic.
pub const LEGACY_DFU_DATA: Uuid = Uuid::from_u128(0x00001532_1212_EFDE_1523_785FEABCD123);

// ============================================================================
// Transfer Sizing
// ============================================================================

/// Default chunk size for Secure DFU data writes (MTU 247 minus ATT header).
pub const DEFAULT_CHUNK_SIZE: usize = 244;

/// Legacy DFU slice size. Legacy bootloaders only accept the 23-byte ATT MTU.
pub const LEGACY_SLICE_SIZE: usize = 20;

/// Size of the legacy Start DFU image size header (SoftDevice, bootloader, application).
pub const LEGACY_SIZE_HEADER_LEN: usize = 12;

// ============================================================================
// Timing
// ============================================================================

/// Default pause between Secure DFU data writes.
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Default pause between legacy slice writes.
pub const DEFAULT_LEGACY_PACING: Duration = Duration::from_millis(20);

/// Default time to wait for a single control point response.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 10_000;

/// Default time to wait for connection and service discovery.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 15_000;

/// Granularity at which blocking waits re-check the cancel flag.
pub const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ============================================================================
// Flow Control
// ============================================================================

/// Receipt notification interval requested from legacy bootloaders (in slices).
pub const DEFAULT_LEGACY_RECEIPT_INTERVAL: u16 = 12;

/// Slices between receipt checks on the client side.
///
/// Reference bootloaders were observed to notify on a 14-slice cadence even
/// when 12 is requested. The cause is unknown, so both values stay separate.
pub const DEFAULT_LEGACY_RECEIPT_CHECK_INTERVAL: usize = 14;

/// Upper bound on slices sent between legacy receipt checks.
pub const MAX_LEGACY_RECEIPT_CHECK_INTERVAL: usize = 4096;

/// Default capacity of the transport event queue.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 256;
