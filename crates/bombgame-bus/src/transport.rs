//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::codec::CanFrame;

/// Failures surfaced by a frame transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// The transport was shut down; no more frames will arrive.
    #[error("transport closed")]
    Closed,
    /// Operating system level failure.
    #[error("io error: {0}")]
    Io(String),
    /// Bus level fault such as an error frame or bus-off condition.
    #[error("bus fault: {0}")]
    Fault(String),
}

/// Transport abstraction for raw CAN frames.
pub trait CanTransport: Send + Sync {
    /// Queue a frame for transmission.
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError>;
    /// Wait up to `timeout` for the next frame, returning `Ok(None)` on timeout.
    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError>;
    /// Human-readable transport name for logging/metrics.
    fn name(&self) -> &'static str;
}

enum Delivery {
    Frame(CanFrame),
    Fault(String),
}

#[derive(Default)]
struct Mailbox {
    queue: Mutex<MailboxState>,
    ready: Condvar,
}

#[derive(Default)]
struct MailboxState {
    pending: VecDeque<Delivery>,
    closed: bool,
}

impl Mailbox {
    fn push(&self, delivery: Delivery) {
        let mut guard = self.queue.lock();
        if guard.closed {
            return;
        }
        guard.pending.push_back(delivery);
        self.ready.notify_all();
    }

    fn close(&self) {
        let mut guard = self.queue.lock();
        guard.closed = true;
        self.ready.notify_all();
    }
}

/// In-process CAN segment: every frame sent by one endpoint reaches all others.
#[derive(Clone, Default)]
pub struct VirtualCanNetwork {
    mailboxes: Arc<Mutex<Vec<Arc<Mailbox>>>>,
}

impl VirtualCanNetwork {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the segment.
    pub fn endpoint(&self) -> VirtualCanEndpoint {
        let mailbox = Arc::new(Mailbox::default());
        self.mailboxes.lock().push(Arc::clone(&mailbox));
        VirtualCanEndpoint {
            network: self.clone(),
            mailbox,
        }
    }

    fn deliver(&self, sender: &Arc<Mailbox>, frame: &CanFrame) {
        let mailboxes = self.mailboxes.lock();
        for mailbox in mailboxes.iter() {
            if !Arc::ptr_eq(mailbox, sender) {
                mailbox.push(Delivery::Frame(frame.clone()));
            }
        }
    }

    fn detach(&self, mailbox: &Arc<Mailbox>) {
        self.mailboxes.lock().retain(|m| !Arc::ptr_eq(m, mailbox));
    }
}

/// One node on a [`VirtualCanNetwork`].
#[derive(Clone)]
pub struct VirtualCanEndpoint {
    network: VirtualCanNetwork,
    mailbox: Arc<Mailbox>,
}

impl VirtualCanEndpoint {
    /// Make the next `recv` on this endpoint fail with a bus fault.
    pub fn inject_fault(&self, reason: impl Into<String>) {
        self.mailbox.push(Delivery::Fault(reason.into()));
    }

    /// Detach from the network and wake any pending receiver.
    pub fn close(&self) {
        self.network.detach(&self.mailbox);
        self.mailbox.close();
    }

    /// Frames queued and not yet received.
    pub fn pending(&self) -> usize {
        self.mailbox.queue.lock().pending.len()
    }
}

impl CanTransport for VirtualCanEndpoint {
    fn send(&self, frame: &CanFrame) -> Result<(), TransportError> {
        if self.mailbox.queue.lock().closed {
            return Err(TransportError::Closed);
        }
        self.network.deliver(&self.mailbox, frame);
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> Result<Option<CanFrame>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.mailbox.queue.lock();
        loop {
            if let Some(delivery) = guard.pending.pop_front() {
                return match delivery {
                    Delivery::Frame(frame) => Ok(Some(frame)),
                    Delivery::Fault(reason) => Err(TransportError::Fault(reason)),
                };
            }
            if guard.closed {
                return Err(TransportError::Closed);
            }
            if self.mailbox.ready.wait_until(&mut guard, deadline).timed_out() {
                return Ok(None);
            }
        }
    }

    fn name(&self) -> &'static str {
        "virtual_can"
    }
}
