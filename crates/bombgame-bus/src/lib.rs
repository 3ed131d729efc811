//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Bus protocol for the bomb: the bit-packed frame codec, the transports
//! frames travel over, and the shared [`BombBus`] that decodes and republishes
//! incoming traffic.

pub mod bus;
pub mod codec;
pub mod kind;
pub mod logging;
pub mod transport;

pub use bus::{BombBus, BusError, BusEvent, ErrorWindow};
pub use codec::{
    ids, Announce, ArbitrationId, BusMessage, CanFrame, CodecError, Direction, ErrorReport,
    ErrorSeverity, ModuleId, Payload, TimerState, Version,
};
pub use kind::ModuleKind;
pub use logging::{log_message, BusMetrics, MessageDirection};
pub use transport::{CanTransport, TransportError, VirtualCanEndpoint, VirtualCanNetwork};
