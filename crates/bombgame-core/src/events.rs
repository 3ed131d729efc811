//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use bombgame_bus::{ErrorSeverity, ModuleId, ModuleKind};
use serde::Serialize;
use strum::{Display, IntoStaticStr};

use crate::state::{BombState, ModuleState};

/// Severity of a bomb or module error, ordered from harmless to fatal.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Display,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum BombErrorLevel {
    #[default]
    None,
    Info,
    Recovered,
    Warning,
    Recoverable,
    Minor,
    Major,
    InitFailure,
    Fatal,
}

impl From<ErrorSeverity> for BombErrorLevel {
    fn from(severity: ErrorSeverity) -> Self {
        match severity {
            ErrorSeverity::Recoverable => Self::Recoverable,
            ErrorSeverity::Recovered => Self::Recovered,
            ErrorSeverity::Minor => Self::Minor,
            ErrorSeverity::Major => Self::Major,
        }
    }
}

/// Identifies a module inside events without borrowing the bomb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ModuleRef {
    pub bus_id: ModuleId,
    pub kind: ModuleKind,
    pub location: usize,
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at slot {}", self.bus_id, self.location)
    }
}

/// An error raised by the bomb or one of its modules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BombError {
    pub module: Option<ModuleRef>,
    pub level: BombErrorLevel,
    pub details: String,
}

impl BombError {
    pub fn new(module: Option<ModuleRef>, level: BombErrorLevel, details: impl Into<String>) -> Self {
        Self {
            module,
            level,
            details: details.into(),
        }
    }

    /// Slot of the affected module, if any.
    pub fn location(&self) -> Option<usize> {
        self.module.map(|module| module.location)
    }
}

impl fmt::Display for BombError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.module {
            Some(module) => write!(f, "{} in {}: {}", self.level, module, self.details),
            None => write!(f, "{}: {}", self.level, self.details),
        }
    }
}

/// Notifications published by a bomb for sound, lighting and UI collaborators.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BombEvent {
    StateChanged { state: BombState },
    ModuleAdded { module: ModuleRef },
    ModuleStateChanged { module: ModuleRef, state: ModuleState },
    ModuleStruck { module: ModuleRef, strikes: u32 },
    TimerTick { seconds: u64 },
    Error(BombError),
}

impl BombEvent {
    /// Events emitted often enough to be logged at trace level.
    pub fn is_noisy(&self) -> bool {
        matches!(self, Self::TimerTick { .. })
    }
}
