//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Virtual module firmware for running a bomb without hardware.
//!
//! Each [`SimulatedModule`] owns an endpoint on a [`VirtualCanNetwork`] and a
//! slot on a [`MockGpio`]. It announces itself when its enable line rises,
//! answers pings and can report solves and strikes on request.

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use bombgame_bus::{
    Announce, BusMessage, CanTransport, Direction, ErrorReport, ErrorSeverity, ModuleId,
    ModuleKind, Payload, TransportError, Version, VirtualCanEndpoint, VirtualCanNetwork,
};
use bombgame_common::SimulationConfig;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::gpio::MockGpio;

const POLL: Duration = Duration::from_millis(5);
const FIRMWARE_VERSION: Version = Version::new(1, 0);

/// Behaviour of one simulated module.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleProfile {
    pub location: usize,
    pub bus_id: ModuleId,
    /// Announce with `init_complete` set instead of sending `InitComplete` later.
    pub init_complete: bool,
    pub init_delay: Duration,
    /// Report a solve this long after `StartTimer`. Needy modules never do.
    pub auto_solve_after: Option<Duration>,
    /// A silent module never answers its enable line.
    pub announces: bool,
    pub answers_pings: bool,
}

impl ModuleProfile {
    pub fn new(location: usize, bus_id: ModuleId) -> Self {
        Self {
            location,
            bus_id,
            init_complete: true,
            init_delay: Duration::ZERO,
            auto_solve_after: None,
            announces: true,
            answers_pings: true,
        }
    }

    pub fn kind(&self) -> Option<ModuleKind> {
        self.bus_id.kind()
    }
}

#[derive(Debug, Default)]
struct Mailbag {
    received: Vec<BusMessage>,
}

#[derive(Debug)]
enum Phase {
    Reset,
    Announced,
}

struct Firmware {
    profile: ModuleProfile,
    endpoint: VirtualCanEndpoint,
    gpio: Arc<MockGpio>,
    mailbag: Arc<Mutex<Mailbag>>,
    stop: Arc<AtomicBool>,
    phase: Phase,
    enabled: bool,
    init_due: Option<Instant>,
    solve_due: Option<Instant>,
}

impl Firmware {
    fn run(mut self) {
        while !self.stop.load(Ordering::Acquire) {
            match self.endpoint.recv(POLL) {
                Ok(Some(frame)) => match BusMessage::decode(&frame) {
                    Ok(message) => self.handle(message),
                    Err(err) => debug!(module = %self.profile.bus_id, error = %err, "undecodable frame"),
                },
                Ok(None) => {}
                Err(TransportError::Closed) => break,
                Err(err) => warn!(module = %self.profile.bus_id, error = %err, "simulated bus fault"),
            }
            self.poll_enable();
            self.fire_timers();
        }
        debug!(module = %self.profile.bus_id, "simulated module stopped");
    }

    fn handle(&mut self, message: BusMessage) {
        let addressed = message.module() == self.profile.bus_id || message.module().is_broadcast();
        if message.direction() != Direction::Out || !addressed {
            return;
        }
        self.mailbag.lock().received.push(message.clone());
        match message.payload() {
            Payload::Reset => {
                self.phase = Phase::Reset;
                self.enabled = false;
                self.init_due = None;
                self.solve_due = None;
            }
            Payload::Ping(number) if self.profile.answers_pings => {
                self.send(Payload::Ping(*number));
            }
            Payload::StartTimer => {
                let must_solve = self.profile.kind().is_some_and(|kind| !kind.is_needy() && !kind.is_timer());
                if must_solve {
                    self.solve_due = self.profile.auto_solve_after.map(|delay| Instant::now() + delay);
                }
            }
            Payload::Explode | Payload::Defuse => self.solve_due = None,
            _ => {}
        }
    }

    fn poll_enable(&mut self) {
        let enabled = self.gpio.enable_state(self.profile.location);
        let rising = enabled && !self.enabled;
        self.enabled = enabled;
        if !rising || !matches!(self.phase, Phase::Reset) || !self.profile.announces {
            return;
        }
        self.phase = Phase::Announced;
        self.send(Payload::Announce(Announce {
            hw_version: FIRMWARE_VERSION,
            sw_version: FIRMWARE_VERSION,
            init_complete: self.profile.init_complete,
        }));
        if !self.profile.init_complete {
            self.init_due = Some(Instant::now() + self.profile.init_delay);
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        if self.init_due.is_some_and(|due| now >= due) {
            self.init_due = None;
            self.send(Payload::InitComplete);
        }
        if self.solve_due.is_some_and(|due| now >= due) {
            self.solve_due = None;
            info!(module = %self.profile.bus_id, "simulated module solved");
            self.send(Payload::Solve);
        }
    }

    fn send(&self, payload: Payload) {
        if let Err(err) = send_from(&self.endpoint, self.profile.bus_id, payload) {
            warn!(module = %self.profile.bus_id, error = %err, "simulated send failed");
        }
    }
}

fn send_from(endpoint: &VirtualCanEndpoint, bus_id: ModuleId, payload: Payload) -> Result<()> {
    let message = BusMessage::from_module(bus_id, payload)?;
    endpoint
        .send(&message.encode())
        .with_context(|| format!("sending {message}"))
}

/// A virtual module plugged into a mock casing.
pub struct SimulatedModule {
    profile: ModuleProfile,
    endpoint: VirtualCanEndpoint,
    gpio: Arc<MockGpio>,
    mailbag: Arc<Mutex<Mailbag>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl SimulatedModule {
    /// Plug the module in: raise its ready line and start its firmware thread.
    pub fn plug_in(
        profile: ModuleProfile,
        network: &VirtualCanNetwork,
        gpio: Arc<MockGpio>,
    ) -> Result<Self> {
        gpio.set_ready(profile.location, true)
            .with_context(|| format!("plugging {} into slot {}", profile.bus_id, profile.location))?;
        let endpoint = network.endpoint();
        let mailbag = Arc::new(Mutex::new(Mailbag::default()));
        let stop = Arc::new(AtomicBool::new(false));
        let firmware = Firmware {
            profile: profile.clone(),
            endpoint: endpoint.clone(),
            gpio: Arc::clone(&gpio),
            mailbag: Arc::clone(&mailbag),
            stop: Arc::clone(&stop),
            phase: Phase::Reset,
            enabled: false,
            init_due: None,
            solve_due: None,
        };
        let thread = std::thread::Builder::new()
            .name(format!("sim-{}", profile.bus_id))
            .spawn(move || firmware.run())
            .context("spawning simulated module")?;
        info!(module = %profile.bus_id, location = profile.location, "simulated module plugged in");
        Ok(Self {
            profile,
            endpoint,
            gpio,
            mailbag,
            stop,
            thread: Some(thread),
        })
    }

    pub fn profile(&self) -> &ModuleProfile {
        &self.profile
    }

    pub fn bus_id(&self) -> ModuleId {
        self.profile.bus_id
    }

    /// Frames addressed to this module or broadcast, in arrival order.
    pub fn received(&self) -> Vec<BusMessage> {
        self.mailbag.lock().received.clone()
    }

    /// How many received frames match `wanted`.
    pub fn count_received(&self, wanted: impl Fn(&Payload) -> bool) -> usize {
        self.mailbag
            .lock()
            .received
            .iter()
            .filter(|message| wanted(message.payload()))
            .count()
    }

    /// Send an arbitrary frame as this module.
    pub fn send(&self, payload: Payload) -> Result<()> {
        send_from(&self.endpoint, self.profile.bus_id, payload)
    }

    pub fn solve(&self) -> Result<()> {
        self.send(Payload::Solve)
    }

    pub fn report_strike(&self) -> Result<()> {
        self.send(Payload::Strike)
    }

    pub fn report_error(&self, severity: ErrorSeverity, code: u8) -> Result<()> {
        self.send(Payload::Error(ErrorReport {
            severity,
            code,
            details: Vec::new(),
        }))
    }

    /// Pull the module out of its slot. The firmware stops answering.
    pub fn unplug(mut self) -> Result<()> {
        self.shutdown();
        self.gpio
            .set_ready(self.profile.location, false)
            .with_context(|| format!("unplugging {}", self.profile.bus_id))
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.endpoint.close();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!(module = %self.profile.bus_id, "simulated module thread panicked");
            }
        }
    }
}

impl Drop for SimulatedModule {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for SimulatedModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulatedModule")
            .field("profile", &self.profile)
            .finish_non_exhaustive()
    }
}

/// A full casing of simulated modules built from configuration.
#[derive(Debug, Default)]
pub struct Simulator {
    modules: Vec<SimulatedModule>,
}

impl Simulator {
    pub fn from_config(
        config: &SimulationConfig,
        network: &VirtualCanNetwork,
        gpio: Arc<MockGpio>,
    ) -> Result<Self> {
        let auto_solve_after = config.auto_solve_after.map(Duration::from_secs);
        let mut modules = Vec::with_capacity(config.slots.len());
        for slot in &config.slots {
            let kind = ModuleKind::from_str(&slot.kind)
                .map_err(|_| anyhow!("unknown simulated module kind '{}'", slot.kind))?;
            let bus_id = ModuleId::new(kind.module_type(), slot.serial)
                .with_context(|| format!("simulated {} in slot {}", slot.kind, slot.location))?;
            let profile = ModuleProfile {
                init_complete: slot.init_complete,
                init_delay: slot.init_delay,
                auto_solve_after,
                ..ModuleProfile::new(slot.location, bus_id)
            };
            modules.push(SimulatedModule::plug_in(profile, network, Arc::clone(&gpio))?);
        }
        Ok(Self { modules })
    }

    pub fn modules(&self) -> &[SimulatedModule] {
        &self.modules
    }

    pub fn at(&self, location: usize) -> Option<&SimulatedModule> {
        self.modules
            .iter()
            .find(|module| module.profile.location == location)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpio::Gpio;

    fn wait_until(mut ready: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if ready() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    fn controller_send(endpoint: &VirtualCanEndpoint, message: BusMessage) {
        endpoint.send(&message.encode()).expect("controller send");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn announces_on_enable_and_answers_pings() {
        let network = VirtualCanNetwork::new();
        let controller = network.endpoint();
        let gpio = Arc::new(MockGpio::new(4, 1));
        let bus_id = ModuleId::new(ModuleKind::Wires.module_type(), 5).expect("valid id");
        let profile = ModuleProfile {
            init_complete: false,
            ..ModuleProfile::new(3, bus_id)
        };
        let module = SimulatedModule::plug_in(profile, &network, Arc::clone(&gpio)).expect("plug in");
        assert_eq!(gpio.check_ready_changes().await.expect("poll"), vec![3]);

        gpio.set_enable(3, true).await.expect("enable");
        let mut seen = Vec::new();
        assert!(wait_until(|| {
            while let Ok(Some(frame)) = controller.recv(Duration::ZERO) {
                seen.push(BusMessage::decode(&frame).expect("decodes"));
            }
            seen.len() >= 2
        }));
        assert!(matches!(seen[0].payload(), Payload::Announce(a) if !a.init_complete));
        assert_eq!(seen[1].payload(), &Payload::InitComplete);

        controller_send(
            &controller,
            BusMessage::to_module(bus_id, Payload::Ping(Some(9))).expect("ping"),
        );
        let echo = controller.recv(Duration::from_secs(1)).expect("recv").expect("echo");
        assert_eq!(
            BusMessage::decode(&echo).expect("decodes").payload(),
            &Payload::Ping(Some(9))
        );
        assert_eq!(module.count_received(|p| matches!(p, Payload::Ping(_))), 1);

        module.unplug().expect("unplug");
        assert!(gpio.check_ready_changes().await.expect("poll").is_empty());
    }

    #[test]
    fn rejects_unknown_kinds() {
        let network = VirtualCanNetwork::new();
        let gpio = Arc::new(MockGpio::new(2, 1));
        let mut config = SimulationConfig {
            slots: Vec::new(),
            auto_solve_after: None,
        };
        config.slots.push(bombgame_common::SimulatedSlot {
            location: 0,
            kind: "laser_grid".to_owned(),
            serial: 1,
            init_complete: true,
            init_delay: Duration::ZERO,
        });
        let err = Simulator::from_config(&config, &network, gpio).expect_err("unknown kind");
        assert!(err.to_string().contains("laser_grid"));
    }
}
