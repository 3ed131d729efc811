//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

use crate::kind::ModuleKind;

/// Width of the module type field.
pub const MODULE_TYPE_BITS: u32 = 12;
/// Width of the module serial field.
pub const MODULE_SERIAL_BITS: u32 = 10;
/// Largest valid module type.
pub const MODULE_TYPE_MAX: u16 = (1 << MODULE_TYPE_BITS) - 1;
/// Largest valid module serial.
pub const MODULE_SERIAL_MAX: u16 = (1 << MODULE_SERIAL_BITS) - 1;
/// Largest message id representable in an arbitration id.
pub const MESSAGE_ID_MAX: u8 = (1 << 6) - 1;
/// Maximum payload of a single frame.
pub const MAX_FRAME_DATA: usize = 8;
/// Maximum detail bytes following the code byte of an error report.
pub const MAX_ERROR_DETAILS: usize = MAX_FRAME_DATA - 1;

const DIRECTION_OFFSET: u32 = 28;
const MODULE_TYPE_OFFSET: u32 = 16;
const MODULE_SERIAL_OFFSET: u32 = 6;
const MESSAGE_ID_OFFSET: u32 = 0;
const EXTENDED_ID_MAX: u32 = (1 << 29) - 1;

const ANNOUNCE_FLAG_INIT_COMPLETE: u8 = 0x01;

/// Numeric message identifiers.
pub mod ids {
    /// Reset every module.
    pub const RESET: u8 = 0x00;
    /// Module identity declaration.
    pub const ANNOUNCE: u8 = 0x01;
    /// Module finished its own initialization.
    pub const INIT_COMPLETE: u8 = 0x02;
    /// Keepalive probe and its echo.
    pub const PING: u8 = 0x03;
    /// Game is about to begin.
    pub const LAUNCH_GAME: u8 = 0x10;
    /// Countdown started.
    pub const START_TIMER: u8 = 0x11;
    /// Bomb exploded.
    pub const EXPLODE: u8 = 0x12;
    /// Bomb defused.
    pub const DEFUSE: u8 = 0x13;
    /// Strike on one module.
    pub const STRIKE: u8 = 0x14;
    /// One module solved.
    pub const SOLVE: u8 = 0x15;
    /// Needy module wakes up.
    pub const NEEDY_ACTIVATE: u8 = 0x16;
    /// Needy module goes to sleep.
    pub const NEEDY_DEACTIVATE: u8 = 0x17;
    /// Recoverable module error.
    pub const RECOVERABLE_ERROR: u8 = 0x20;
    /// A previous module error recovered.
    pub const RECOVERED_ERROR: u8 = 0x21;
    /// Minor unrecoverable module error.
    pub const MINOR_UNRECOVERABLE_ERROR: u8 = 0x22;
    /// Major unrecoverable module error.
    pub const MAJOR_UNRECOVERABLE_ERROR: u8 = 0x23;
    /// First id of the module-specific range.
    pub const MODULE_SPECIFIC_0: u8 = 0x30;
    /// Last id of the module-specific range.
    pub const MODULE_SPECIFIC_F: u8 = 0x3F;
}

/// Codec failures, raised both when building and when decoding messages.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    /// Only extended (29-bit) frames carry bus messages.
    #[error("non-extended arbitration id {0:#x}")]
    NotExtended(u32),
    /// Arbitration id does not fit in 29 bits.
    #[error("arbitration id {0:#x} exceeds 29 bits")]
    IdOutOfRange(u32),
    /// Module type does not fit in 12 bits.
    #[error("module type must be between 0 and {max}, got {0}", max = MODULE_TYPE_MAX)]
    ModuleTypeOutOfRange(u16),
    /// Module serial does not fit in 10 bits.
    #[error("module serial must be between 0 and {max}, got {0}", max = MODULE_SERIAL_MAX)]
    SerialOutOfRange(u16),
    /// Type 0 is the broadcast id and only exists with serial 0.
    #[error("serial must be 0 if type is 0, got {0}")]
    BroadcastSerial(u16),
    /// Message id does not fit in 6 bits.
    #[error("message id {0:#04x} exceeds 6 bits")]
    MessageIdOutOfRange(u8),
    /// Broadcast messages can only travel from the controller outwards.
    #[error("broadcast messages must be outward")]
    InboundBroadcast,
    /// Global id without a message shape.
    #[error("unknown message id {0:#04x}")]
    UnknownMessageId(u8),
    /// Module-specific id for a module type with no catalog entry.
    #[error("unknown module type {0:#x}")]
    UnknownModuleType(u16),
    /// Module-specific id the module kind does not define.
    #[error("unknown message id {id:#04x} for {kind} modules")]
    UnknownModuleMessage {
        /// Kind that was addressed.
        kind: ModuleKind,
        /// Offending id.
        id: u8,
    },
    /// Payload length does not match the message shape.
    #[error("{message} must have {expected} bytes of data, got {actual}")]
    PayloadLength {
        /// Message shape name.
        message: &'static str,
        /// Accepted length(s).
        expected: &'static str,
        /// Received length.
        actual: usize,
    },
    /// More than eight bytes of frame data.
    #[error("frame data of {0} bytes exceeds {max}", max = MAX_FRAME_DATA)]
    FrameTooLong(usize),
    /// Module-specific payload sent to a module of another kind.
    #[error("{message} belongs to {kind} modules, not {module}")]
    WrongModuleKind {
        /// Message shape name.
        message: &'static str,
        /// Kind owning the message shape.
        kind: ModuleKind,
        /// Addressed module.
        module: ModuleId,
    },
}

/// Address of a module on the bus.
#[derive(Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleId {
    module_type: u16,
    serial: u16,
}

impl ModuleId {
    /// Reserved broadcast address.
    pub const BROADCAST: ModuleId = ModuleId {
        module_type: 0,
        serial: 0,
    };

    /// Build a module id, rejecting out-of-range fields and non-zero broadcast serials.
    pub fn new(module_type: u16, serial: u16) -> Result<Self, CodecError> {
        if module_type > MODULE_TYPE_MAX {
            return Err(CodecError::ModuleTypeOutOfRange(module_type));
        }
        if serial > MODULE_SERIAL_MAX {
            return Err(CodecError::SerialOutOfRange(serial));
        }
        if module_type == 0 && serial != 0 {
            return Err(CodecError::BroadcastSerial(serial));
        }
        Ok(Self {
            module_type,
            serial,
        })
    }

    /// Module type number.
    pub const fn module_type(&self) -> u16 {
        self.module_type
    }

    /// Module serial number.
    pub const fn serial(&self) -> u16 {
        self.serial
    }

    /// Whether this is the broadcast address.
    pub const fn is_broadcast(&self) -> bool {
        self.module_type == 0
    }

    /// Catalog kind of the module type, if registered.
    pub fn kind(&self) -> Option<ModuleKind> {
        ModuleKind::from_type(self.module_type)
    }

    /// Packed `type << 10 | serial` representation.
    pub const fn packed(&self) -> u32 {
        ((self.module_type as u32) << MODULE_SERIAL_BITS) | self.serial as u32
    }
}

impl Hash for ModuleId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u32(self.packed());
    }
}

impl fmt::Debug for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ModuleId({}, {})", self.module_type, self.serial)
    }
}

impl fmt::Display for ModuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_broadcast() {
            return f.write_str("broadcast");
        }
        match self.kind() {
            Some(kind) => write!(f, "{}#{}", kind, self.serial),
            None => write!(f, "{}#{}", self.module_type, self.serial),
        }
    }
}

/// Travel direction of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum Direction {
    /// Controller to module.
    Out = 0,
    /// Module to controller.
    In = 1,
}

/// The four fields packed into a 29-bit extended arbitration id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArbitrationId {
    /// Frame direction.
    pub direction: Direction,
    /// Recipient or originator.
    pub module: ModuleId,
    /// 6-bit message id.
    pub message_id: u8,
}

impl ArbitrationId {
    /// Pack the fields, most significant first.
    pub fn encode(&self) -> Result<u32, CodecError> {
        if self.message_id > MESSAGE_ID_MAX {
            return Err(CodecError::MessageIdOutOfRange(self.message_id));
        }
        Ok(((self.direction as u32) << DIRECTION_OFFSET)
            | (u32::from(self.module.module_type) << MODULE_TYPE_OFFSET)
            | (u32::from(self.module.serial) << MODULE_SERIAL_OFFSET)
            | (u32::from(self.message_id) << MESSAGE_ID_OFFSET))
    }

    /// Unpack a raw 29-bit id.
    pub fn decode(raw: u32) -> Result<Self, CodecError> {
        if raw > EXTENDED_ID_MAX {
            return Err(CodecError::IdOutOfRange(raw));
        }
        let direction = if (raw >> DIRECTION_OFFSET) & 1 == 1 {
            Direction::In
        } else {
            Direction::Out
        };
        let module_type = ((raw >> MODULE_TYPE_OFFSET) & u32::from(MODULE_TYPE_MAX)) as u16;
        let serial = ((raw >> MODULE_SERIAL_OFFSET) & u32::from(MODULE_SERIAL_MAX)) as u16;
        let message_id = ((raw >> MESSAGE_ID_OFFSET) & u32::from(MESSAGE_ID_MAX)) as u8;
        Ok(Self {
            direction,
            module: ModuleId::new(module_type, serial)?,
            message_id,
        })
    }
}

/// A raw frame as it appears on the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanFrame {
    /// Arbitration id, 11 or 29 bits.
    pub arbitration_id: u32,
    /// Whether the id is in extended format.
    pub extended: bool,
    /// Up to eight data bytes.
    pub data: Vec<u8>,
}

impl CanFrame {
    /// Build an extended frame.
    pub fn extended(arbitration_id: u32, data: Vec<u8>) -> Result<Self, CodecError> {
        if arbitration_id > EXTENDED_ID_MAX {
            return Err(CodecError::IdOutOfRange(arbitration_id));
        }
        if data.len() > MAX_FRAME_DATA {
            return Err(CodecError::FrameTooLong(data.len()));
        }
        Ok(Self {
            arbitration_id,
            extended: true,
            data,
        })
    }
}

/// Hardware or software version as `major.minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Version {
    /// Major component.
    pub major: u8,
    /// Minor component.
    pub minor: u8,
}

impl Version {
    /// Build a version.
    pub const fn new(major: u8, minor: u8) -> Self {
        Self { major, minor }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Identity a module declares when its enable line rises.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announce {
    /// Hardware revision.
    pub hw_version: Version,
    /// Firmware revision.
    pub sw_version: Version,
    /// Module needs no separate `InitComplete`.
    pub init_complete: bool,
}

/// Severity carried by the error message family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorSeverity {
    /// 0x20
    Recoverable,
    /// 0x21, clears an earlier report with the same code.
    Recovered,
    /// 0x22
    Minor,
    /// 0x23
    Major,
}

impl ErrorSeverity {
    fn message_id(self) -> u8 {
        match self {
            Self::Recoverable => ids::RECOVERABLE_ERROR,
            Self::Recovered => ids::RECOVERED_ERROR,
            Self::Minor => ids::MINOR_UNRECOVERABLE_ERROR,
            Self::Major => ids::MAJOR_UNRECOVERABLE_ERROR,
        }
    }
}

/// Error reported by a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorReport {
    /// Severity, from the message id.
    pub severity: ErrorSeverity,
    /// Module-defined error code.
    pub code: u8,
    /// Up to seven bytes of detail.
    pub details: Vec<u8>,
}

/// Runtime parameters pushed to the timer module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerState {
    /// Whole seconds left.
    pub seconds: u16,
    /// Speed multiplier in 8.8 fixed point.
    pub speed: u16,
    /// Strikes so far.
    pub strikes: u8,
    /// Strikes before the bomb explodes.
    pub max_strikes: u8,
}

impl TimerState {
    /// Convert floating point bomb state into the wire representation, saturating.
    pub fn from_bomb(time_left: f64, speed: f64, strikes: u32, max_strikes: u32) -> Self {
        Self {
            seconds: time_left.round().clamp(0.0, f64::from(u16::MAX)) as u16,
            speed: (speed * 256.0).round().clamp(0.0, f64::from(u16::MAX)) as u16,
            strikes: strikes.min(u32::from(u8::MAX)) as u8,
            max_strikes: max_strikes.min(u32::from(u8::MAX)) as u8,
        }
    }

    /// Speed multiplier as a float.
    pub fn speed_multiplier(&self) -> f64 {
        f64::from(self.speed) / 256.0
    }
}

/// Payload of a bus message, one variant per message shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// 0x00
    Reset,
    /// 0x01
    Announce(Announce),
    /// 0x02
    InitComplete,
    /// 0x03, optionally carrying a sequence number.
    Ping(Option<u8>),
    /// 0x10
    LaunchGame,
    /// 0x11
    StartTimer,
    /// 0x12
    Explode,
    /// 0x13
    Defuse,
    /// 0x14
    Strike,
    /// 0x15
    Solve,
    /// 0x16
    NeedyActivate,
    /// 0x17
    NeedyDeactivate,
    /// 0x20-0x23
    Error(ErrorReport),
    /// Timer 0x30
    SetTimerState(TimerState),
}

impl Payload {
    /// Numeric message id of this shape.
    pub fn message_id(&self) -> u8 {
        match self {
            Self::Reset => ids::RESET,
            Self::Announce(_) => ids::ANNOUNCE,
            Self::InitComplete => ids::INIT_COMPLETE,
            Self::Ping(_) => ids::PING,
            Self::LaunchGame => ids::LAUNCH_GAME,
            Self::StartTimer => ids::START_TIMER,
            Self::Explode => ids::EXPLODE,
            Self::Defuse => ids::DEFUSE,
            Self::Strike => ids::STRIKE,
            Self::Solve => ids::SOLVE,
            Self::NeedyActivate => ids::NEEDY_ACTIVATE,
            Self::NeedyDeactivate => ids::NEEDY_DEACTIVATE,
            Self::Error(report) => report.severity.message_id(),
            Self::SetTimerState(_) => ids::MODULE_SPECIFIC_0,
        }
    }

    /// Kind owning a module-specific shape, `None` for global messages.
    pub fn owner(&self) -> Option<ModuleKind> {
        match self {
            Self::SetTimerState(_) => Some(ModuleKind::Timer),
            _ => None,
        }
    }

    /// Shape name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Reset => "Reset",
            Self::Announce(_) => "Announce",
            Self::InitComplete => "InitComplete",
            Self::Ping(_) => "Ping",
            Self::LaunchGame => "LaunchGame",
            Self::StartTimer => "StartTimer",
            Self::Explode => "Explode",
            Self::Defuse => "Defuse",
            Self::Strike => "Strike",
            Self::Solve => "Solve",
            Self::NeedyActivate => "NeedyActivate",
            Self::NeedyDeactivate => "NeedyDeactivate",
            Self::Error(report) => match report.severity {
                ErrorSeverity::Recoverable => "RecoverableError",
                ErrorSeverity::Recovered => "RecoveredError",
                ErrorSeverity::Minor => "MinorUnrecoverableError",
                ErrorSeverity::Major => "MajorUnrecoverableError",
            },
            Self::SetTimerState(_) => "SetTimerState",
        }
    }

    fn encode_data(&self) -> Vec<u8> {
        match self {
            Self::Announce(announce) => {
                let flags = if announce.init_complete {
                    ANNOUNCE_FLAG_INIT_COMPLETE
                } else {
                    0
                };
                vec![
                    announce.hw_version.major,
                    announce.hw_version.minor,
                    announce.sw_version.major,
                    announce.sw_version.minor,
                    flags,
                ]
            }
            Self::Ping(Some(number)) => vec![*number],
            Self::Error(report) => {
                let mut data = Vec::with_capacity(1 + report.details.len());
                data.push(report.code);
                data.extend_from_slice(&report.details);
                data
            }
            Self::SetTimerState(state) => {
                let mut data = Vec::with_capacity(6);
                data.extend_from_slice(&state.seconds.to_le_bytes());
                data.extend_from_slice(&state.speed.to_le_bytes());
                data.push(state.strikes);
                data.push(state.max_strikes);
                data
            }
            _ => Vec::new(),
        }
    }

    fn decode_global(id: u8, data: &[u8]) -> Result<Self, CodecError> {
        let empty = |payload: Payload| -> Result<Payload, CodecError> {
            if data.is_empty() {
                Ok(payload)
            } else {
                Err(CodecError::PayloadLength {
                    message: payload.name(),
                    expected: "0",
                    actual: data.len(),
                })
            }
        };
        match id {
            ids::RESET => empty(Self::Reset),
            ids::ANNOUNCE => match *data {
                [hw_major, hw_minor, sw_major, sw_minor, flags] => Ok(Self::Announce(Announce {
                    hw_version: Version::new(hw_major, hw_minor),
                    sw_version: Version::new(sw_major, sw_minor),
                    init_complete: flags & ANNOUNCE_FLAG_INIT_COMPLETE != 0,
                })),
                _ => Err(CodecError::PayloadLength {
                    message: "Announce",
                    expected: "5",
                    actual: data.len(),
                }),
            },
            ids::INIT_COMPLETE => empty(Self::InitComplete),
            ids::PING => match *data {
                [] => Ok(Self::Ping(None)),
                [number] => Ok(Self::Ping(Some(number))),
                _ => Err(CodecError::PayloadLength {
                    message: "Ping",
                    expected: "0 or 1",
                    actual: data.len(),
                }),
            },
            ids::LAUNCH_GAME => empty(Self::LaunchGame),
            ids::START_TIMER => empty(Self::StartTimer),
            ids::EXPLODE => empty(Self::Explode),
            ids::DEFUSE => empty(Self::Defuse),
            ids::STRIKE => empty(Self::Strike),
            ids::SOLVE => empty(Self::Solve),
            ids::NEEDY_ACTIVATE => empty(Self::NeedyActivate),
            ids::NEEDY_DEACTIVATE => empty(Self::NeedyDeactivate),
            ids::RECOVERABLE_ERROR
            | ids::RECOVERED_ERROR
            | ids::MINOR_UNRECOVERABLE_ERROR
            | ids::MAJOR_UNRECOVERABLE_ERROR => {
                let severity = match id {
                    ids::RECOVERABLE_ERROR => ErrorSeverity::Recoverable,
                    ids::RECOVERED_ERROR => ErrorSeverity::Recovered,
                    ids::MINOR_UNRECOVERABLE_ERROR => ErrorSeverity::Minor,
                    _ => ErrorSeverity::Major,
                };
                let Some((&code, details)) = data.split_first() else {
                    return Err(CodecError::PayloadLength {
                        message: "Error",
                        expected: "1 to 8",
                        actual: 0,
                    });
                };
                Ok(Self::Error(ErrorReport {
                    severity,
                    code,
                    details: details.to_vec(),
                }))
            }
            other => Err(CodecError::UnknownMessageId(other)),
        }
    }

    fn decode_module_specific(kind: ModuleKind, id: u8, data: &[u8]) -> Result<Self, CodecError> {
        match (kind, id) {
            (ModuleKind::Timer, ids::MODULE_SPECIFIC_0) => match *data {
                [s0, s1, v0, v1, strikes, max_strikes] => Ok(Self::SetTimerState(TimerState {
                    seconds: u16::from_le_bytes([s0, s1]),
                    speed: u16::from_le_bytes([v0, v1]),
                    strikes,
                    max_strikes,
                })),
                _ => Err(CodecError::PayloadLength {
                    message: "SetTimerState",
                    expected: "6",
                    actual: data.len(),
                }),
            },
            (kind, id) => Err(CodecError::UnknownModuleMessage { kind, id }),
        }
    }
}

/// A typed bus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    module: ModuleId,
    direction: Direction,
    payload: Payload,
}

impl BusMessage {
    /// Build a message, validating the address against direction and payload.
    pub fn new(module: ModuleId, direction: Direction, payload: Payload) -> Result<Self, CodecError> {
        if module.is_broadcast() && direction != Direction::Out {
            return Err(CodecError::InboundBroadcast);
        }
        if let Some(kind) = payload.owner() {
            if module.module_type() != kind.module_type() {
                return Err(CodecError::WrongModuleKind {
                    message: payload.name(),
                    kind,
                    module,
                });
            }
        }
        if let Payload::Error(report) = &payload {
            if report.details.len() > MAX_ERROR_DETAILS {
                return Err(CodecError::PayloadLength {
                    message: payload.name(),
                    expected: "1 to 8",
                    actual: 1 + report.details.len(),
                });
            }
        }
        Ok(Self {
            module,
            direction,
            payload,
        })
    }

    /// Outward message addressed to every module.
    pub fn broadcast(payload: Payload) -> Result<Self, CodecError> {
        Self::new(ModuleId::BROADCAST, Direction::Out, payload)
    }

    /// Outward message addressed to one module.
    pub fn to_module(module: ModuleId, payload: Payload) -> Result<Self, CodecError> {
        Self::new(module, Direction::Out, payload)
    }

    /// Inward message originating from one module.
    pub fn from_module(module: ModuleId, payload: Payload) -> Result<Self, CodecError> {
        Self::new(module, Direction::In, payload)
    }

    /// Recipient or originator.
    pub fn module(&self) -> ModuleId {
        self.module
    }

    /// Frame direction.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Message payload.
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Numeric message id.
    pub fn message_id(&self) -> u8 {
        self.payload.message_id()
    }

    /// Keepalive traffic, logged at trace level only.
    pub fn is_noisy(&self) -> bool {
        matches!(self.payload, Payload::Ping(_))
    }

    /// Serialize into an extended frame.
    pub fn encode(&self) -> CanFrame {
        let arbitration_id = ((self.direction as u32) << DIRECTION_OFFSET)
            | (u32::from(self.module.module_type) << MODULE_TYPE_OFFSET)
            | (u32::from(self.module.serial) << MODULE_SERIAL_OFFSET)
            | (u32::from(self.message_id()) << MESSAGE_ID_OFFSET);
        CanFrame {
            arbitration_id,
            extended: true,
            data: self.payload.encode_data(),
        }
    }

    /// Parse a frame, selecting the shape from the global or per-kind table.
    pub fn decode(frame: &CanFrame) -> Result<Self, CodecError> {
        if !frame.extended {
            return Err(CodecError::NotExtended(frame.arbitration_id));
        }
        if frame.data.len() > MAX_FRAME_DATA {
            return Err(CodecError::FrameTooLong(frame.data.len()));
        }
        let id = ArbitrationId::decode(frame.arbitration_id)?;
        let payload = if id.message_id >= ids::MODULE_SPECIFIC_0 {
            let kind = id
                .module
                .kind()
                .ok_or(CodecError::UnknownModuleType(id.module.module_type()))?;
            Payload::decode_module_specific(kind, id.message_id, &frame.data)?
        } else {
            Payload::decode_global(id.message_id, &frame.data)?
        };
        Self::new(id.module, id.direction, payload)
    }
}

impl fmt::Display for BusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            Direction::Out => "to",
            Direction::In => "from",
        };
        write!(f, "<{} {} {}", self.payload.name(), direction, self.module)?;
        match &self.payload {
            Payload::Announce(announce) => write!(
                f,
                ": hardware {}, software {}, init {}",
                announce.hw_version,
                announce.sw_version,
                if announce.init_complete {
                    "complete"
                } else {
                    "incomplete"
                }
            )?,
            Payload::Ping(Some(number)) => write!(f, ": #{}", number)?,
            Payload::Error(report) => write!(f, ": code {} {:02x?}", report.code, report.details)?,
            Payload::SetTimerState(state) => write!(
                f,
                ": {}s at {:.2}x, {}/{} strikes",
                state.seconds,
                state.speed_multiplier(),
                state.strikes,
                state.max_strikes
            )?,
            _ => {}
        }
        f.write_str(">")
    }
}
