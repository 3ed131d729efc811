//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use bombgame_common::BusConfig;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::codec::BusMessage;
use crate::logging::{log_message, BusMetrics, MessageDirection};
use crate::transport::{CanTransport, TransportError};

const EVENT_CAPACITY: usize = 256;

/// Events republished by the bus for its subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A frame was received and decoded.
    Message(BusMessage),
    /// The transport failed too often; raised once per bus.
    Fatal {
        /// Errors counted in the window that tripped the limit.
        errors: u32,
    },
}

/// Errors surfaced by [`BombBus`] operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The underlying transport rejected the frame.
    #[error("transport {transport} failed: {source}")]
    Transport {
        /// Transport name.
        transport: &'static str,
        /// Underlying failure.
        #[source]
        source: TransportError,
    },
    /// `start` was called twice.
    #[error("bus receiver already running")]
    AlreadyStarted,
    /// The receiver thread could not be spawned.
    #[error("failed to spawn bus receiver: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Sliding error counter that trips exactly once.
///
/// An error more than `max_interval` after the start of the current window
/// opens a new window with a count of one.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    max_interval: Duration,
    max_count: u32,
    last_error: Instant,
    count: u32,
    limit_exceeded: bool,
}

impl ErrorWindow {
    /// Window starting now.
    pub fn new(max_interval: Duration, max_count: u32) -> Self {
        Self::starting_at(Instant::now(), max_interval, max_count)
    }

    /// Window starting at `start`.
    pub fn starting_at(start: Instant, max_interval: Duration, max_count: u32) -> Self {
        Self {
            max_interval,
            max_count,
            last_error: start,
            count: 0,
            limit_exceeded: false,
        }
    }

    /// Count one error at `now`; returns the window count the first time the limit is reached.
    pub fn record(&mut self, now: Instant) -> Option<u32> {
        if now > self.last_error + self.max_interval {
            self.count = 1;
            self.last_error = now;
        } else {
            self.count = self.count.saturating_add(1);
        }
        if self.count >= self.max_count && !self.limit_exceeded {
            self.limit_exceeded = true;
            return Some(self.count);
        }
        None
    }

    /// Errors in the current window.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether the limit has ever been reached.
    pub fn limit_exceeded(&self) -> bool {
        self.limit_exceeded
    }
}

struct Inner {
    transport: Arc<dyn CanTransport>,
    events: broadcast::Sender<BusEvent>,
    window: Mutex<ErrorWindow>,
    metrics: Option<BusMetrics>,
    recv_poll: Duration,
    running: AtomicBool,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

/// Shared bus: decodes incoming frames, serializes outgoing messages and
/// watches the transport error rate.
///
/// Cloning yields another handle to the same bus. `send` may be called from
/// any thread without external locking.
#[derive(Clone)]
pub struct BombBus {
    inner: Arc<Inner>,
}

impl BombBus {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn CanTransport>, config: &BusConfig) -> Self {
        Self::build(transport, config, None)
    }

    /// Wrap a transport and record traffic into `metrics`.
    pub fn with_metrics(
        transport: Arc<dyn CanTransport>,
        config: &BusConfig,
        metrics: BusMetrics,
    ) -> Self {
        Self::build(transport, config, Some(metrics))
    }

    fn build(
        transport: Arc<dyn CanTransport>,
        config: &BusConfig,
        metrics: Option<BusMetrics>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                transport,
                events,
                window: Mutex::new(ErrorWindow::new(
                    config.error_max_interval,
                    config.error_max_count,
                )),
                metrics,
                recv_poll: config.recv_poll,
                running: AtomicBool::new(false),
                receiver: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to decoded messages and fatal notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.inner.events.subscribe()
    }

    /// Name of the underlying transport.
    pub fn transport_name(&self) -> &'static str {
        self.inner.transport.name()
    }

    /// Spawn the receiver thread.
    pub fn start(&self) -> Result<(), BusError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Err(BusError::AlreadyStarted);
        }
        let inner = Arc::clone(&self.inner);
        let handle = std::thread::Builder::new()
            .name("bus-receiver".into())
            .spawn(move || receive_loop(&inner));
        match handle {
            Ok(handle) => {
                *self.inner.receiver.lock() = Some(handle);
                info!(transport = self.transport_name(), "bus receiver started");
                Ok(())
            }
            Err(err) => {
                self.inner.running.store(false, Ordering::SeqCst);
                Err(err.into())
            }
        }
    }

    /// Stop the receiver thread and wait for it to exit.
    ///
    /// Blocks for at most one receive poll period.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        let handle = self.inner.receiver.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("bus receiver panicked");
            }
            info!(transport = self.transport_name(), "bus receiver stopped");
        }
    }

    /// Encode and transmit a message; failures count toward escalation.
    pub fn send(&self, message: &BusMessage) -> Result<(), BusError> {
        log_message(MessageDirection::Outbound, message);
        let frame = message.encode();
        match self.inner.transport.send(&frame) {
            Ok(()) => {
                if let Some(metrics) = &self.inner.metrics {
                    metrics.observe_sent(message);
                }
                Ok(())
            }
            Err(source) => {
                self.inner.record_error(&source);
                Err(BusError::Transport {
                    transport: self.inner.transport.name(),
                    source,
                })
            }
        }
    }

    /// Errors counted in the current escalation window.
    pub fn error_count(&self) -> u32 {
        self.inner.window.lock().count()
    }
}

impl Inner {
    fn record_error(&self, err: &dyn std::fmt::Display) {
        let tripped = {
            let mut window = self.window.lock();
            let tripped = window.record(Instant::now());
            if let Some(metrics) = &self.metrics {
                metrics.observe_error(window.count());
            }
            tripped
        };
        warn!(error = %err, "bus error");
        if let Some(errors) = tripped {
            error!(errors, "too many bus errors, raising fatal condition");
            let _ = self.events.send(BusEvent::Fatal { errors });
        }
    }

    fn publish(&self, message: BusMessage) {
        log_message(MessageDirection::Inbound, &message);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received(&message);
        }
        // No subscribers is not an error.
        let _ = self.events.send(BusEvent::Message(message));
    }
}

fn receive_loop(inner: &Inner) {
    while inner.running.load(Ordering::SeqCst) {
        match inner.transport.recv(inner.recv_poll) {
            Ok(Some(frame)) => match BusMessage::decode(&frame) {
                Ok(message) => inner.publish(message),
                Err(err) => {
                    debug!(
                        arbitration_id = frame.arbitration_id,
                        data = ?frame.data,
                        "dropping undecodable frame"
                    );
                    inner.record_error(&err);
                }
            },
            Ok(None) => {}
            Err(TransportError::Closed) => {
                info!(transport = inner.transport.name(), "transport closed");
                break;
            }
            Err(err) => inner.record_error(&err),
        }
    }
    inner.running.store(false, Ordering::SeqCst);
}
