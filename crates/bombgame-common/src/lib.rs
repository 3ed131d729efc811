//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared configuration, tracing and time helpers for the bomb controller."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the bomb controller workspace.
//! This crate exposes configuration loading, tracing setup and the time
//! helpers consumed by the bus and bomb crates.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    BombConfig, BusConfig, ControllerConfig, LoadedControllerConfig, LoggingConfig,
    SimulatedSlot, SimulationConfig,
};
pub use logging::{init_tracing, LogFormat};
