//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use tracing::{debug, trace};

use crate::codec::BusMessage;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Frame written to the transport.
    Outbound,
    /// Frame decoded from the transport.
    Inbound,
}

/// Emit a structured log entry for bus traffic. Keepalive frames only show at trace level.
pub fn log_message(direction: MessageDirection, message: &BusMessage) {
    if message.is_noisy() {
        trace!(
            module = %message.module(),
            kind = message.payload().name(),
            direction = ?direction,
            "bus activity"
        );
    } else {
        debug!(
            module = %message.module(),
            kind = message.payload().name(),
            direction = ?direction,
            message = %message,
            "bus activity"
        );
    }
}

/// Prometheus metric handles for bus activity.
#[derive(Clone)]
pub struct BusMetrics {
    sent: IntCounterVec,
    received: IntCounterVec,
    errors: IntCounter,
    window_errors: IntGauge,
}

impl BusMetrics {
    /// Register bus metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.sent.clone()))?;
        registry.register(Box::new(metrics.received.clone()))?;
        registry.register(Box::new(metrics.errors.clone()))?;
        registry.register(Box::new(metrics.window_errors.clone()))?;
        Ok(metrics)
    }

    /// Metric handles that are not exported anywhere.
    pub fn unregistered() -> Result<Self, prometheus::Error> {
        Ok(Self {
            sent: IntCounterVec::new(
                Opts::new("bus_frames_sent_total", "Frames written to the bus"),
                &["message"],
            )?,
            received: IntCounterVec::new(
                Opts::new("bus_frames_received_total", "Frames decoded from the bus"),
                &["message"],
            )?,
            errors: IntCounter::with_opts(Opts::new(
                "bus_errors_total",
                "Transport and decode errors observed on the bus",
            ))?,
            window_errors: IntGauge::with_opts(Opts::new(
                "bus_errors_in_window",
                "Errors counted in the current escalation window",
            ))?,
        })
    }

    /// Record a sent frame.
    pub fn observe_sent(&self, message: &BusMessage) {
        self.sent
            .with_label_values(&[message.payload().name()])
            .inc();
    }

    /// Record a received frame.
    pub fn observe_received(&self, message: &BusMessage) {
        self.received
            .with_label_values(&[message.payload().name()])
            .inc();
    }

    /// Record a bus error and the resulting window count.
    pub fn observe_error(&self, window_count: u32) {
        self.errors.inc();
        self.window_errors.set(i64::from(window_count));
    }

    /// Total errors recorded so far.
    pub fn error_total(&self) -> u64 {
        self.errors.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::Payload;

    #[test]
    fn metrics_are_exported_per_message_name() {
        let registry = Registry::new();
        let metrics = BusMetrics::register(&registry).expect("register metrics");
        let message = BusMessage::broadcast(Payload::Reset).expect("valid message");
        metrics.observe_sent(&message);
        metrics.observe_sent(&message);
        metrics.observe_error(3);

        let families = registry.gather();
        let sent = families
            .iter()
            .find(|f| f.get_name() == "bus_frames_sent_total")
            .expect("sent family");
        assert_eq!(sent.get_metric()[0].get_counter().get_value(), 2.0);
        assert_eq!(metrics.error_total(), 1);
        assert!(families.iter().any(|f| f.get_name() == "bus_errors_in_window"));
    }
}
