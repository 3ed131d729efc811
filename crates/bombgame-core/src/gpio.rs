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

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

const READY_CHANGE_CAPACITY: usize = 64;

/// A module appeared in or disappeared from a casing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModuleReadyChange {
    pub location: usize,
    pub present: bool,
}

impl fmt::Display for ModuleReadyChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = if self.present { "present" } else { "not present" };
        write!(f, "slot {} is now {}", self.location, status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GpioError {
    #[error("module location {0} out of range")]
    LocationOutOfRange(usize),
    #[error("widget location {0} out of range")]
    WidgetOutOfRange(usize),
    #[error("gpio io error: {0}")]
    Io(String),
}

/// Enable, ready and widget lines of a casing.
#[async_trait]
pub trait Gpio: Send + Sync {
    /// Drive every enable and widget line low.
    async fn reset(&self) -> Result<(), GpioError>;
    /// Poll the ready lines and return the occupied slots in detection order.
    async fn check_ready_changes(&self) -> Result<Vec<usize>, GpioError>;
    async fn set_enable(&self, location: usize, enabled: bool) -> Result<(), GpioError>;
    async fn set_widget(&self, location: usize, value: bool) -> Result<(), GpioError>;
    /// Subscribe to ready line changes.
    fn subscribe(&self) -> broadcast::Receiver<ModuleReadyChange>;
}

#[derive(Debug)]
struct Pins {
    ready: Vec<bool>,
    enable: Vec<bool>,
    widgets: Vec<bool>,
}

/// In-memory pins for tests and the simulator.
#[derive(Debug)]
pub struct MockGpio {
    pins: Mutex<Pins>,
    changes: broadcast::Sender<ModuleReadyChange>,
}

impl MockGpio {
    pub fn new(capacity: usize, widget_capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(READY_CHANGE_CAPACITY);
        Self {
            pins: Mutex::new(Pins {
                ready: vec![false; capacity],
                enable: vec![false; capacity],
                widgets: vec![false; widget_capacity],
            }),
            changes,
        }
    }

    pub fn capacity(&self) -> usize {
        self.pins.lock().ready.len()
    }

    /// Drive a virtual ready line, publishing a change when the level flips.
    pub fn set_ready(&self, location: usize, present: bool) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        let line = pins
            .ready
            .get_mut(location)
            .ok_or(GpioError::LocationOutOfRange(location))?;
        if *line != present {
            *line = present;
            let change = ModuleReadyChange { location, present };
            debug!(%change, "mock ready line changed");
            let _ = self.changes.send(change);
        }
        Ok(())
    }

    pub fn enable_state(&self, location: usize) -> bool {
        self.pins.lock().enable.get(location).copied().unwrap_or(false)
    }

    pub fn widget_state(&self, location: usize) -> bool {
        self.pins.lock().widgets.get(location).copied().unwrap_or(false)
    }
}

#[async_trait]
impl Gpio for MockGpio {
    async fn reset(&self) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        pins.enable.iter_mut().for_each(|line| *line = false);
        pins.widgets.iter_mut().for_each(|line| *line = false);
        Ok(())
    }

    async fn check_ready_changes(&self) -> Result<Vec<usize>, GpioError> {
        let pins = self.pins.lock();
        Ok(pins
            .ready
            .iter()
            .enumerate()
            .filter_map(|(location, present)| present.then_some(location))
            .collect())
    }

    async fn set_enable(&self, location: usize, enabled: bool) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        let line = pins
            .enable
            .get_mut(location)
            .ok_or(GpioError::LocationOutOfRange(location))?;
        *line = enabled;
        Ok(())
    }

    async fn set_widget(&self, location: usize, value: bool) -> Result<(), GpioError> {
        let mut pins = self.pins.lock();
        let line = pins
            .widgets
            .get_mut(location)
            .ok_or(GpioError::WidgetOutOfRange(location))?;
        *line = value;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ModuleReadyChange> {
        self.changes.subscribe()
    }
}
