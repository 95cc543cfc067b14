//! Session-scoped owner of a BLE connection.
//!
//! Wraps a [`BleTransport`] and the receiving end of its event queue. Keeps the
//! characteristics discovered for this connection and any notifications that
//! arrived while nobody was waiting for them.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant};

use uuid::Uuid;

use super::config::CANCEL_POLL_INTERVAL;
use super::error::{DfuError, DfuResult};
use super::session::CancelToken;
use super::transport::{BleTransport, ConnectionEvent, Notification, TransportEvent};

/// Point in time a wait must finish by, with the budget it was derived from.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
        }
    }

    /// `None` means no deadline.
    pub fn from_timeout(timeout: Option<Duration>) -> Option<Self> {
        timeout.map(Self::after)
    }

    pub fn remaining(&self) -> Duration {
        self.at.saturating_duration_since(Instant::now())
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }
}

/// One connection to one peripheral.
pub struct GattLink<T: BleTransport> {
    transport: T,
    events: Receiver<TransportEvent>,
    characteristics: Vec<(Uuid, Uuid)>,
    pending: VecDeque<Notification>,
    disconnected: bool,
}

impl<T: BleTransport> GattLink<T> {
    pub fn new(transport: T, events: Receiver<TransportEvent>) -> Self {
        Self {
            transport,
            events,
            characteristics: Vec::new(),
            pending: VecDeque::new(),
            disconnected: false,
        }
    }

    /// Connect and wait until service discovery completes.
    pub fn connect(
        &mut self,
        peripheral_id: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> DfuResult<()> {
        tracing::info!(peripheral_id, "Connecting");
        self.disconnected = false;
        self.characteristics.clear();
        self.transport.connect(peripheral_id)?;

        let deadline = Deadline::from_timeout(timeout);
        let mut connected = false;
        let mut discovered = false;

        while !(connected && discovered) {
            match self.next_event("connect", deadline, cancel)? {
                TransportEvent::Connection(ConnectionEvent::Connected) => connected = true,
                TransportEvent::Connection(ConnectionEvent::ConnectFailed) => {
                    return Err(DfuError::transport("connect", "peripheral refused connection"));
                }
                TransportEvent::Connection(ConnectionEvent::Disconnected) => {
                    self.handle_disconnect();
                    return Err(DfuError::DeviceDisconnected {
                        operation: "connect".to_string(),
                    });
                }
                TransportEvent::CharacteristicDiscovered {
                    service,
                    characteristic,
                } => self.characteristics.push((service, characteristic)),
                TransportEvent::DiscoveryComplete => discovered = true,
                TransportEvent::Notification(notification) => {
                    self.pending.push_back(notification)
                }
            }
        }

        tracing::info!(
            characteristics = self.characteristics.len(),
            "Connected and discovered services"
        );
        Ok(())
    }

    /// Whether discovery reported `characteristic` on this connection.
    pub fn has_characteristic(&self, characteristic: Uuid) -> bool {
        self.characteristics
            .iter()
            .any(|(_, discovered)| *discovered == characteristic)
    }

    /// Discovered `(service, characteristic)` pairs.
    pub fn characteristics(&self) -> &[(Uuid, Uuid)] {
        &self.characteristics
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    /// Enable notifications on a discovered characteristic.
    pub fn subscribe(&mut self, characteristic: Uuid) -> DfuResult<()> {
        self.ensure_connected("subscribe")?;
        if !self.has_characteristic(characteristic) {
            return Err(DfuError::MissingCharacteristic {
                uuid: characteristic,
            });
        }
        tracing::debug!(%characteristic, "Subscribing");
        self.transport.subscribe(characteristic)
    }

    /// Write one payload. Payloads larger than the transport MTU are rejected.
    pub fn write(&mut self, characteristic: Uuid, data: &[u8]) -> DfuResult<()> {
        self.ensure_connected("write")?;
        let max_size = self.transport.max_write_size();
        if data.len() > max_size {
            return Err(DfuError::PacketTooLarge {
                size: data.len(),
                max_size,
            });
        }
        self.transport.write(characteristic, data)
    }

    pub fn max_write_size(&self) -> usize {
        self.transport.max_write_size()
    }

    /// Block until the next notification arrives.
    ///
    /// `timeout == None` waits forever. Cancellation is observed every
    /// [`CANCEL_POLL_INTERVAL`]. A disconnect fails this wait and every later one.
    pub fn next_notification(
        &mut self,
        operation: &str,
        timeout: Option<Duration>,
        cancel: &CancelToken,
    ) -> DfuResult<Notification> {
        self.next_notification_until(operation, Deadline::from_timeout(timeout), cancel)
    }

    /// Like [`next_notification`](Self::next_notification), bounded by a
    /// deadline the caller keeps across several calls.
    pub fn next_notification_until(
        &mut self,
        operation: &str,
        deadline: Option<Deadline>,
        cancel: &CancelToken,
    ) -> DfuResult<Notification> {
        self.ensure_connected(operation)?;
        if let Some(notification) = self.pending.pop_front() {
            return Ok(notification);
        }

        loop {
            match self.next_event(operation, deadline, cancel)? {
                TransportEvent::Notification(notification) => return Ok(notification),
                TransportEvent::Connection(ConnectionEvent::Disconnected) => {
                    self.handle_disconnect();
                    return Err(DfuError::DeviceDisconnected {
                        operation: operation.to_string(),
                    });
                }
                TransportEvent::CharacteristicDiscovered {
                    service,
                    characteristic,
                } => self.characteristics.push((service, characteristic)),
                other => tracing::debug!(?other, operation, "Ignoring transport event"),
            }
        }
    }

    /// Hand over notifications that were queued but never consumed.
    pub fn take_pending(&mut self) -> Vec<Notification> {
        self.pending.drain(..).collect()
    }

    fn ensure_connected(&self, operation: &str) -> DfuResult<()> {
        if self.disconnected {
            Err(DfuError::DeviceDisconnected {
                operation: operation.to_string(),
            })
        } else {
            Ok(())
        }
    }

    fn next_event(
        &mut self,
        operation: &str,
        deadline: Option<Deadline>,
        cancel: &CancelToken,
    ) -> DfuResult<TransportEvent> {
        loop {
            cancel.check()?;

            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.remaining();
                    if remaining.is_zero() {
                        return Err(DfuError::Timeout {
                            operation: operation.to_string(),
                            timeout_ms: u64::try_from(deadline.budget().as_millis())
                                .unwrap_or(u64::MAX),
                        });
                    }
                    remaining.min(CANCEL_POLL_INTERVAL)
                }
                None => CANCEL_POLL_INTERVAL,
            };

            match self.events.recv_timeout(slice) {
                Ok(event) => return Ok(event),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.handle_disconnect();
                    return Err(DfuError::DeviceDisconnected {
                        operation: operation.to_string(),
                    });
                }
            }
        }
    }

    // Keeps whatever notifications were already queued behind the disconnect.
    fn handle_disconnect(&mut self) {
        tracing::warn!("Peripheral disconnected");
        self.disconnected = true;
        self.characteristics.clear();
        for event in self.events.try_iter() {
            if let TransportEvent::Notification(notification) = event {
                self.pending.push_back(notification);
            }
        }
    }
}
