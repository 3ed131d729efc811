//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::Serialize;
use strum::{Display, IntoStaticStr};

/// Lifecycle of a bomb. The last four states are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BombState {
    Uninitialized,
    Resetting,
    Initializing,
    Initialized,
    GameStarting,
    GameStarted,
    Defused,
    Exploded,
    InitializationFailed,
    Deinitialized,
}

impl BombState {
    /// Whether no further transition except `Deinitialized` can happen.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Defused | Self::Exploded | Self::InitializationFailed | Self::Deinitialized
        )
    }

    /// Whether a game has finished one way or the other.
    pub const fn is_game_over(self) -> bool {
        matches!(self, Self::Defused | Self::Exploded)
    }
}

/// Lifecycle of a single module as seen by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display, IntoStaticStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModuleState {
    Initialization,
    Configuration,
    Game,
    Defused,
}
