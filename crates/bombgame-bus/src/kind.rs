//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus frame codec, transports, and error escalation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Module kinds known to the controller, keyed by their bus type number.
///
/// A module type that is not listed here cannot carry module-specific frames
/// and cannot be instantiated during initialization.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
#[repr(u16)]
pub enum ModuleKind {
    /// Countdown display; the only timer-capable kind.
    Timer = 1,
    /// Simple wires.
    Wires = 2,
    /// The big button.
    Button = 3,
    /// Symbol keypad.
    Keypad = 4,
    /// Simon says.
    SimonSays = 5,
    /// Complicated wires.
    ComplicatedWires = 9,
    /// Password cylinders.
    Password = 12,
    /// Venting gas, a needy module.
    VentingGas = 13,
}

impl ModuleKind {
    /// Look up the kind registered for a bus module type number.
    pub fn from_type(module_type: u16) -> Option<Self> {
        let kind = match module_type {
            1 => Self::Timer,
            2 => Self::Wires,
            3 => Self::Button,
            4 => Self::Keypad,
            5 => Self::SimonSays,
            9 => Self::ComplicatedWires,
            12 => Self::Password,
            13 => Self::VentingGas,
            _ => return None,
        };
        Some(kind)
    }

    /// Bus module type number of this kind.
    pub const fn module_type(self) -> u16 {
        self as u16
    }

    /// Needy modules never have to be solved to defuse the bomb.
    pub const fn is_needy(self) -> bool {
        matches!(self, Self::VentingGas)
    }

    /// Whether this kind drives the countdown display.
    pub const fn is_timer(self) -> bool {
        matches!(self, Self::Timer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn type_numbers_round_trip() {
        for kind in ModuleKind::iter() {
            assert_eq!(ModuleKind::from_type(kind.module_type()), Some(kind));
        }
        assert_eq!(ModuleKind::from_type(0), None);
        assert_eq!(ModuleKind::from_type(6), None);
    }

    #[test]
    fn names_parse_case_insensitively() {
        assert_eq!("timer".parse::<ModuleKind>().ok(), Some(ModuleKind::Timer));
        assert_eq!(
            "Venting_Gas".parse::<ModuleKind>().ok(),
            Some(ModuleKind::VentingGas)
        );
        assert_eq!(ModuleKind::SimonSays.to_string(), "simon_says");
    }
}
