//! BLE transport boundary for DFU communication.
//!
//! The DFU client never talks to a Bluetooth stack directly. Backends
//! implement [`BleTransport`] for the outgoing direction and push everything
//! the peripheral reports (discovered characteristics, notifications,
//! connection changes) into an [`EventSender`].

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

#[cfg(test)]
use mockall::automock;
use uuid::Uuid;

use super::error::{DfuError, DfuResult};

/// Connection status changes reported by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    ConnectFailed,
}

/// Everything a backend reports about the peripheral.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A characteristic was found during service discovery.
    CharacteristicDiscovered { service: Uuid, characteristic: Uuid },
    /// Service discovery finished; the characteristic list is complete.
    DiscoveryComplete,
    /// A subscribed characteristic changed value.
    Notification(Notification),
    Connection(ConnectionEvent),
}

/// A value notified on a subscribed characteristic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub characteristic: Uuid,
    pub value: Vec<u8>,
}

/// Trait for the outgoing half of a BLE connection.
///
/// This abstraction allows for mocking in tests and plugging in any
/// platform Bluetooth stack.
#[cfg_attr(test, automock)]
pub trait BleTransport: Send {
    /// Start connecting to a peripheral. Completion is reported as events.
    fn connect(&mut self, peripheral_id: &str) -> DfuResult<()>;

    /// Enable notifications on a characteristic.
    fn subscribe(&mut self, characteristic: Uuid) -> DfuResult<()>;

    /// Write without response. Fails if `data` exceeds the negotiated MTU.
    fn write(&mut self, characteristic: Uuid, data: &[u8]) -> DfuResult<()>;

    /// Largest payload a single write may carry.
    fn max_write_size(&self) -> usize;
}

/// Producer side of the transport event queue, held by the backend.
#[derive(Debug, Clone)]
pub struct EventSender {
    inner: SyncSender<TransportEvent>,
}

impl EventSender {
    /// Queue an event, blocking while the queue is full.
    pub fn send(&self, event: TransportEvent) -> DfuResult<()> {
        self.inner
            .send(event)
            .map_err(|_| DfuError::transport("event delivery", "event queue closed"))
    }

    /// Queue an event without blocking. Returns false if it had to be dropped.
    pub fn try_send(&self, event: TransportEvent) -> bool {
        match self.inner.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "Transport event queue full, dropping event");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    /// Convenience for backends forwarding a characteristic value update.
    pub fn notify(&self, characteristic: Uuid, value: &[u8]) -> DfuResult<()> {
        self.send(TransportEvent::Notification(Notification {
            characteristic,
            value: value.to_vec(),
        }))
    }
}

/// Create a bounded single-producer/single-consumer event queue.
pub fn event_channel(capacity: usize) -> (EventSender, Receiver<TransportEvent>) {
    let (inner, receiver) = mpsc::sync_channel(capacity);
    (EventSender { inner }, receiver)
}
