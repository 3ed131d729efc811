//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Bomb state machine, module contract, GPIO seam and simulated hardware.

pub mod bomb;
pub mod catalog;
pub mod events;
pub mod gpio;
pub mod module;
pub mod serial;
pub mod sim;
pub mod state;
pub mod tasks;

pub use bomb::{Bomb, BombFailure, BombSnapshot};
pub use catalog::{behavior_for, PassiveModule, TimerModule};
pub use events::{BombError, BombErrorLevel, BombEvent, ModuleRef};
pub use gpio::{Gpio, GpioError, MockGpio, ModuleReadyChange};
pub use module::{
    describe_error, BombView, Module, ModuleBehavior, ModuleCtx, ModuleRequest, ModuleSnapshot,
};
pub use serial::{BombSerial, InvalidSerial};
pub use sim::{ModuleProfile, SimulatedModule, Simulator};
pub use state::{BombState, ModuleState};
