//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! The bomb state machine.
//!
//! All mutable state lives in one [`BombCore`] behind a single async mutex.
//! Bus frames that accompany a state change are sent while the lock is held,
//! so no observer can see the new state without the frame or the reverse.
//! Waiting during initialization uses a [`Notify`] paired with that lock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bombgame_bus::{Announce, BombBus, BusEvent, BusMessage, Direction, ModuleId, Payload};
use bombgame_common::time::{displayed_seconds, until_next_second};
use bombgame_common::BombConfig;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, MutexGuard, Notify};
use tracing::{debug, error, info, trace, warn};

use crate::catalog::behavior_for;
use crate::events::{BombError, BombErrorLevel, BombEvent, ModuleRef};
use crate::gpio::{Gpio, ModuleReadyChange};
use crate::module::{BombView, Module, ModuleCtx, ModuleRequest, ModuleSnapshot};
use crate::serial::{BombSerial, InvalidSerial};
use crate::state::{BombState, ModuleState};
use crate::tasks::{join_cancelled, TaskSet};

const EVENT_CAPACITY: usize = 256;

/// Errors returned by bomb operations.
#[derive(Debug, thiserror::Error)]
pub enum BombFailure {
    #[error("cannot {operation} while the bomb is {state}")]
    InvalidState {
        operation: &'static str,
        state: BombState,
    },
    #[error("no module with bus id {0}")]
    UnknownModule(ModuleId),
    #[error(transparent)]
    InvalidSerial(#[from] InvalidSerial),
}

/// Serializable view of the whole bomb.
#[derive(Debug, Clone, Serialize)]
pub struct BombSnapshot {
    pub state: BombState,
    pub serial_number: BombSerial,
    pub strikes: u32,
    pub max_strikes: u32,
    pub time_left: f64,
    pub timer_speed: f64,
    pub modules: Vec<ModuleSnapshot>,
}

#[derive(Debug)]
struct BombCore {
    state: BombState,
    modules: Vec<Module>,
    by_bus_id: HashMap<ModuleId, usize>,
    by_location: BTreeMap<usize, usize>,
    strikes: u32,
    max_strikes: u32,
    time_left: f64,
    timer_speed: f64,
    /// When `time_left` was last brought up to date. Set only while the
    /// countdown runs.
    settled_at: Option<Instant>,
    /// Seconds last shown by a timer tick.
    shown_seconds: u64,
    /// Slot whose enable line is currently asserted.
    init_location: Option<usize>,
}

impl BombCore {
    fn new(config: &BombConfig) -> Self {
        Self {
            state: BombState::Uninitialized,
            modules: Vec::new(),
            by_bus_id: HashMap::new(),
            by_location: BTreeMap::new(),
            strikes: 0,
            max_strikes: config.max_strikes,
            time_left: config.game_duration.as_secs_f64(),
            timer_speed: 1.0,
            settled_at: None,
            shown_seconds: displayed_seconds(config.game_duration.as_secs_f64()),
            init_location: None,
        }
    }

    /// Countdown value at `now`, without recording it.
    fn time_left_at(&self, now: Instant) -> f64 {
        match self.settled_at {
            Some(since) => {
                let elapsed = now.saturating_duration_since(since).as_secs_f64();
                (self.time_left - elapsed * self.timer_speed).max(0.0)
            }
            None => self.time_left,
        }
    }

    /// Charge the time elapsed since the last settlement at the current speed.
    fn settle(&mut self, now: Instant) {
        self.time_left = self.time_left_at(now);
        if self.settled_at.is_some() {
            self.settled_at = Some(now);
        }
    }

    fn view(&self) -> BombView {
        BombView {
            time_left: self.time_left,
            timer_speed: self.timer_speed,
            strikes: self.strikes,
            max_strikes: self.max_strikes,
        }
    }

    fn index_of(&self, bus_id: ModuleId) -> Result<usize, BombFailure> {
        self.by_bus_id
            .get(&bus_id)
            .copied()
            .ok_or(BombFailure::UnknownModule(bus_id))
    }

    fn all_configured(&self) -> bool {
        self.modules
            .iter()
            .all(|module| module.state() == ModuleState::Configuration)
    }

    fn has_timer(&self) -> bool {
        self.modules.iter().any(|module| module.kind().is_timer())
    }
}

struct Shared {
    core: Mutex<BombCore>,
    /// Woken whenever the bomb state or a module state changes.
    changed: Notify,
    bus: BombBus,
    gpio: Arc<dyn Gpio>,
    config: BombConfig,
    serial: BombSerial,
    events: broadcast::Sender<BombEvent>,
    tasks: parking_lot::Mutex<TaskSet>,
}

/// A bomb casing with its modules, timer and strike counter.
///
/// Cloning is cheap; all clones drive the same bomb.
#[derive(Clone)]
pub struct Bomb {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bomb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bomb")
            .field("serial", &self.shared.serial)
            .finish_non_exhaustive()
    }
}

impl Bomb {
    /// Create an uninitialized bomb. The serial number is taken from the
    /// config or generated at random.
    pub fn new(bus: BombBus, gpio: Arc<dyn Gpio>, config: BombConfig) -> Result<Self, BombFailure> {
        let serial = match &config.serial_number {
            Some(serial) => serial.parse()?,
            None => BombSerial::generate(&mut rand::thread_rng()),
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        info!(serial = %serial, transport = bus.transport_name(), "bomb created");
        Ok(Self {
            shared: Arc::new(Shared {
                core: Mutex::new(BombCore::new(&config)),
                changed: Notify::new(),
                bus,
                gpio,
                config,
                serial,
                events,
                tasks: parking_lot::Mutex::new(TaskSet::default()),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BombEvent> {
        self.shared.events.subscribe()
    }

    pub fn serial_number(&self) -> &BombSerial {
        &self.shared.serial
    }

    pub fn config(&self) -> &BombConfig {
        &self.shared.config
    }

    pub async fn state(&self) -> BombState {
        self.shared.core.lock().await.state
    }

    /// Occupied slots, in slot order.
    pub async fn module_locations(&self) -> Vec<usize> {
        self.shared.core.lock().await.by_location.keys().copied().collect()
    }

    pub async fn snapshot(&self) -> BombSnapshot {
        let core = self.shared.core.lock().await;
        BombSnapshot {
            state: core.state,
            serial_number: self.shared.serial.clone(),
            strikes: core.strikes,
            max_strikes: core.max_strikes,
            time_left: core.time_left_at(Instant::now()),
            timer_speed: core.timer_speed,
            modules: core.modules.iter().map(ModuleSnapshot::from).collect(),
        }
    }

    /// Wait until `ready` holds for the bomb state. Returns the state that
    /// satisfied it, or `None` once `timeout` elapses.
    pub async fn wait_for_state<F>(&self, timeout: Duration, ready: F) -> Option<BombState>
    where
        F: Fn(BombState) -> bool,
    {
        let core = self.shared.core.lock().await;
        let deadline = tokio::time::Instant::now() + timeout;
        let (core, matched) = self
            .shared
            .wait_locked(core, Some(deadline), |core| ready(core.state))
            .await;
        matched.then_some(core.state)
    }

    /// Reset the casing and enumerate its modules one slot at a time.
    ///
    /// Handshake failures are not errors: they leave the bomb in
    /// [`BombState::InitializationFailed`] and that state is returned.
    pub async fn initialize(&self) -> Result<BombState, BombFailure> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        if core.state != BombState::Uninitialized {
            return Err(BombFailure::InvalidState {
                operation: "initialize",
                state: core.state,
            });
        }
        shared.attach();

        shared.set_state(&mut core, BombState::Resetting);
        if let Err(err) = shared.gpio.reset().await {
            shared.init_fail(&mut core, format!("GPIO reset failed: {err}"));
            return Ok(core.state);
        }
        shared.broadcast(Payload::Reset);
        drop(core);

        tokio::time::sleep(shared.config.reset_period).await;

        let mut core = shared.core.lock().await;
        if core.state != BombState::Resetting {
            return Ok(core.state);
        }
        let connected = match shared.gpio.check_ready_changes().await {
            Ok(connected) => connected,
            Err(err) => {
                shared.init_fail(&mut core, format!("GPIO poll failed: {err}"));
                return Ok(core.state);
            }
        };
        info!(slots = ?connected, "enumerating modules");
        shared.set_state(&mut core, BombState::Initializing);

        for location in connected {
            if core.state != BombState::Initializing {
                return Ok(core.state);
            }
            core.init_location = Some(location);
            let enabled = EnabledSlot::new(shared, location);
            if let Err(err) = shared.gpio.set_enable(location, true).await {
                enabled.disarm();
                core.init_location = None;
                shared.init_fail(&mut core, format!("cannot enable slot {location}: {err}"));
                return Ok(core.state);
            }
            let deadline = tokio::time::Instant::now() + shared.config.announce_timeout;
            let (guard, announced) = shared
                .wait_locked(core, Some(deadline), move |core| {
                    core.by_location.contains_key(&location)
                        || core.state != BombState::Initializing
                })
                .await;
            core = guard;
            core.init_location = None;
            if let Err(err) = shared.gpio.set_enable(location, false).await {
                warn!(location, error = %err, "failed to release enable line");
            }
            enabled.disarm();
            if !announced {
                shared.init_fail(
                    &mut core,
                    format!("module at slot {location} did not announce in time"),
                );
                return Ok(core.state);
            }
        }
        if core.state != BombState::Initializing {
            return Ok(core.state);
        }
        if !core.has_timer() {
            shared.init_fail(&mut core, "no timer found on bomb");
            return Ok(core.state);
        }

        let pinger = Arc::downgrade(shared);
        shared.spawn("ping", run_pings(pinger));

        let (mut core, _) = shared
            .wait_locked(core, None, |core| {
                core.state != BombState::Initializing || core.all_configured()
            })
            .await;
        if core.state == BombState::Initializing {
            shared.set_state(&mut core, BombState::Initialized);
        }
        Ok(core.state)
    }

    /// Handle a decoded frame. Frames received through the bus subscription
    /// are routed here automatically.
    pub async fn receive(&self, message: BusMessage) {
        self.shared.receive(message).await;
    }

    /// Report a ready line change. Changes from the GPIO subscription are
    /// routed here automatically.
    pub async fn module_ready_change(&self, change: ModuleReadyChange) {
        self.shared.module_ready_change(change).await;
    }

    /// Push the game state to every module and start the pre-game countdown.
    pub async fn start_game(&self) -> Result<(), BombFailure> {
        let shared = &self.shared;
        let mut core = shared.core.lock().await;
        if core.state != BombState::Initialized {
            return Err(BombFailure::InvalidState {
                operation: "start the game",
                state: core.state,
            });
        }
        let now = Instant::now();
        for index in 0..core.modules.len() {
            let mut ctx = ModuleCtx::new(core.view(), now);
            let module = &mut core.modules[index];
            module.generate();
            module.send_state(&mut ctx);
            shared.apply(&mut core, index, ctx.into_requests());
        }
        shared.set_state(&mut core, BombState::GameStarting);
        shared.broadcast(Payload::LaunchGame);
        drop(core);

        let starter = Arc::clone(shared);
        shared.spawn("game-start", async move { starter.finish_game_start().await });
        Ok(())
    }

    /// Count a strike against the bomb. Returns `true` if it exploded.
    pub async fn strike(&self, bus_id: ModuleId) -> Result<bool, BombFailure> {
        let mut core = self.shared.core.lock().await;
        if core.state.is_terminal() {
            return Err(BombFailure::InvalidState {
                operation: "strike",
                state: core.state,
            });
        }
        let index = core.index_of(bus_id)?;
        let module = core.modules[index].reference();
        Ok(self.shared.strike_locked(&mut core, module))
    }

    /// Strike a module as if it reported a mistake. Returns `true` if the
    /// bomb is exploded afterwards.
    pub async fn strike_module(&self, bus_id: ModuleId, count: bool) -> Result<bool, BombFailure> {
        let mut core = self.shared.core.lock().await;
        let index = core.index_of(bus_id)?;
        let mut ctx = ModuleCtx::new(core.view(), Instant::now());
        core.modules[index].strike(&mut ctx, count);
        self.shared.apply(&mut core, index, ctx.into_requests());
        Ok(core.state == BombState::Exploded)
    }

    /// Mark a module solved as if it reported the solve itself.
    pub async fn defuse_module(&self, bus_id: ModuleId) -> Result<(), BombFailure> {
        let mut core = self.shared.core.lock().await;
        let index = core.index_of(bus_id)?;
        let mut ctx = ModuleCtx::new(core.view(), Instant::now());
        core.modules[index].defuse(&mut ctx);
        self.shared.apply(&mut core, index, ctx.into_requests());
        Ok(())
    }

    /// Explode the bomb. Returns `false` if the game was already over.
    pub async fn explode(&self) -> bool {
        let mut core = self.shared.core.lock().await;
        self.shared.explode_locked(&mut core)
    }

    /// Cancel every background task and shut the bomb down.
    pub async fn deinitialize(&self) -> Result<(), BombFailure> {
        {
            let core = self.shared.core.lock().await;
            if core.state == BombState::Deinitialized {
                return Err(BombFailure::InvalidState {
                    operation: "deinitialize",
                    state: core.state,
                });
            }
        }
        let tasks = self.shared.tasks.lock().close();
        join_cancelled(tasks).await;

        let mut core = self.shared.core.lock().await;
        self.shared.set_state(&mut core, BombState::Deinitialized);
        info!(serial = %self.shared.serial, "bomb deinitialized");
        Ok(())
    }
}

/// An asserted enable line during enumeration. Dropping it while still armed
/// (a cancelled `initialize`) releases the line and stops expecting an
/// announce for the slot.
struct EnabledSlot {
    shared: Arc<Shared>,
    location: usize,
    armed: bool,
}

impl EnabledSlot {
    fn new(shared: &Arc<Shared>, location: usize) -> Self {
        Self {
            shared: Arc::clone(shared),
            location,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for EnabledSlot {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let location = self.location;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(location, "enumeration abandoned outside a runtime, enable line left asserted");
            return;
        };
        let shared = Arc::clone(&self.shared);
        runtime.spawn(async move {
            {
                let mut core = shared.core.lock().await;
                if core.init_location == Some(location) {
                    core.init_location = None;
                }
            }
            match shared.gpio.set_enable(location, false).await {
                Ok(()) => debug!(location, "enable line released after abandoned enumeration"),
                Err(err) => warn!(location, error = %err, "failed to release enable line"),
            }
        });
    }
}

impl Shared {
    fn spawn<F>(&self, name: &'static str, fut: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        if !self.tasks.lock().spawn(name, fut) {
            debug!(task = name, "bomb is shutting down, task not started");
        }
    }

    /// Start routing bus frames and ready line changes into the bomb.
    fn attach(self: &Arc<Self>) {
        let mut frames = self.bus.subscribe();
        let bomb = Arc::downgrade(self);
        self.spawn("bus-listener", async move {
            loop {
                let event = frames.recv().await;
                let Some(shared) = bomb.upgrade() else { break };
                match event {
                    Ok(BusEvent::Message(message)) => shared.receive(message).await,
                    Ok(BusEvent::Fatal { errors }) => shared.bus_failed(errors),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "bomb fell behind the bus, frames dropped")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        let mut changes = self.gpio.subscribe();
        let bomb = Arc::downgrade(self);
        self.spawn("gpio-listener", async move {
            loop {
                let change = changes.recv().await;
                let Some(shared) = bomb.upgrade() else { break };
                match change {
                    Ok(change) => shared.module_ready_change(change).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "ready line changes dropped")
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });
    }

    /// Release `core`, wait for a change notification and re-check `ready`
    /// until it holds or `deadline` passes.
    async fn wait_locked<'a, F>(
        &'a self,
        mut core: MutexGuard<'a, BombCore>,
        deadline: Option<tokio::time::Instant>,
        ready: F,
    ) -> (MutexGuard<'a, BombCore>, bool)
    where
        F: Fn(&BombCore) -> bool,
    {
        loop {
            if ready(&core) {
                return (core, true);
            }
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            drop(core);
            let timed_out = match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, notified).await.is_err(),
                None => {
                    notified.await;
                    false
                }
            };
            core = self.core.lock().await;
            if timed_out {
                let matched = ready(&core);
                return (core, matched);
            }
        }
    }

    fn emit(&self, event: BombEvent) {
        if event.is_noisy() {
            trace!(?event, "bomb event");
        } else {
            debug!(?event, "bomb event");
        }
        let _ = self.events.send(event);
    }

    fn raise(&self, error: BombError) {
        warn!(%error, "bomb error");
        self.emit(BombEvent::Error(error));
    }

    fn set_state(&self, core: &mut BombCore, state: BombState) {
        if core.state == state {
            return;
        }
        info!(from = %core.state, to = %state, "bomb state changed");
        if state != BombState::GameStarted {
            core.settle(Instant::now());
            core.settled_at = None;
        }
        core.state = state;
        self.emit(BombEvent::StateChanged { state });
        self.changed.notify_waiters();
    }

    fn init_fail(&self, core: &mut BombCore, reason: impl Into<String>) {
        let reason = reason.into();
        error!(%reason, "bomb initialization failed");
        self.emit(BombEvent::Error(BombError::new(
            None,
            BombErrorLevel::InitFailure,
            reason,
        )));
        self.set_state(core, BombState::InitializationFailed);
    }

    fn broadcast(&self, payload: Payload) {
        match BusMessage::broadcast(payload) {
            Ok(message) => {
                if let Err(err) = self.bus.send(&message) {
                    error!(frame = %message, error = %err, "failed to broadcast");
                }
            }
            Err(err) => error!(error = %err, "cannot encode broadcast"),
        }
    }

    fn send_to(&self, bus_id: ModuleId, payload: Payload) {
        match BusMessage::to_module(bus_id, payload) {
            Ok(message) => {
                if let Err(err) = self.bus.send(&message) {
                    warn!(module = %bus_id, frame = %message, error = %err, "failed to send");
                }
            }
            Err(err) => error!(module = %bus_id, error = %err, "cannot encode message"),
        }
    }

    fn bus_failed(&self, errors: u32) {
        error!(errors, "bus declared fatal");
        self.emit(BombEvent::Error(BombError::new(
            None,
            BombErrorLevel::Fatal,
            format!("The bus failed {errors} times in quick succession."),
        )));
    }

    async fn receive(&self, message: BusMessage) {
        let mut core = self.core.lock().await;
        if matches!(
            core.state,
            BombState::Uninitialized | BombState::Resetting | BombState::Deinitialized
        ) {
            trace!(frame = %message, state = %core.state, "ignoring frame");
            return;
        }
        if message.direction() == Direction::Out {
            trace!(frame = %message, "ignoring controller frame");
            return;
        }
        if let Payload::Announce(announce) = message.payload() {
            self.announce(&mut core, message.module(), *announce);
            return;
        }
        let Some(index) = core.by_bus_id.get(&message.module()).copied() else {
            self.raise(BombError::new(
                None,
                BombErrorLevel::Warning,
                format!(
                    "Received {} from unannounced module {}.",
                    message.payload().name(),
                    message.module()
                ),
            ));
            return;
        };

        let now = Instant::now();
        let mut ctx = ModuleCtx::new(core.view(), now);
        let module = &mut core.modules[index];
        module.touch(now);
        if !module.handle_message(&message, &mut ctx) {
            let reference = module.reference();
            self.raise(BombError::new(
                Some(reference),
                BombErrorLevel::Warning,
                format!("Received {} in an invalid state.", message.payload().name()),
            ));
        }
        self.apply(&mut core, index, ctx.into_requests());
    }

    fn announce(&self, core: &mut BombCore, bus_id: ModuleId, announce: Announce) {
        if core.state != BombState::Initializing {
            self.raise(BombError::new(
                None,
                BombErrorLevel::Warning,
                format!("{bus_id} was announced after initialization."),
            ));
            return;
        }
        if core.by_bus_id.contains_key(&bus_id) {
            self.init_fail(core, format!("Multiple modules were announced with id {bus_id}."));
            return;
        }
        let Some(location) = core.init_location else {
            self.init_fail(core, format!("An unrequested announce was received from {bus_id}."));
            return;
        };
        let Some(kind) = bus_id.kind() else {
            self.init_fail(core, format!("{bus_id} announced an unknown module type."));
            return;
        };

        let mut module = Module::new(
            bus_id,
            location,
            announce.hw_version,
            announce.sw_version,
            behavior_for(kind),
            Instant::now(),
        );
        if announce.init_complete {
            module.mark_configured();
        }
        info!(
            module = %bus_id,
            location,
            hw = %announce.hw_version,
            sw = %announce.sw_version,
            init_complete = announce.init_complete,
            "module announced"
        );
        let reference = module.reference();
        let index = core.modules.len();
        core.modules.push(module);
        core.by_bus_id.insert(bus_id, index);
        core.by_location.insert(location, index);
        core.init_location = None;
        self.emit(BombEvent::ModuleAdded { module: reference });
        self.changed.notify_waiters();
    }

    /// Apply the requests a module queued, in order.
    fn apply(&self, core: &mut BombCore, index: usize, requests: Vec<ModuleRequest>) {
        let mut queue = VecDeque::from(requests);
        while let Some(request) = queue.pop_front() {
            match request {
                ModuleRequest::Send(payload) => {
                    self.send_to(core.modules[index].bus_id(), payload)
                }
                ModuleRequest::Event(event) => self.emit(event),
                ModuleRequest::StateChanged => {
                    let module = &core.modules[index];
                    self.emit(BombEvent::ModuleStateChanged {
                        module: module.reference(),
                        state: module.state(),
                    });
                    self.check_solve(core);
                    self.changed.notify_waiters();
                }
                ModuleRequest::Defuse => {
                    let mut ctx = ModuleCtx::new(core.view(), Instant::now());
                    core.modules[index].defuse(&mut ctx);
                    queue.extend(ctx.into_requests());
                }
                ModuleRequest::Strike => {
                    let module = core.modules[index].reference();
                    if self.strike_locked(core, module) {
                        queue.clear();
                    } else {
                        self.send_to(module.bus_id, Payload::Strike);
                    }
                }
            }
        }
    }

    /// Count a strike. Returns `true` if the game is over afterwards.
    fn strike_locked(&self, core: &mut BombCore, module: ModuleRef) -> bool {
        if core.state.is_terminal() {
            debug!(%module, state = %core.state, "strike after the game ended");
            return true;
        }
        core.settle(Instant::now());
        core.strikes += 1;
        info!(%module, strikes = core.strikes, max_strikes = core.max_strikes, "strike");
        if core.strikes >= core.max_strikes {
            self.explode_locked(core);
            return true;
        }
        if core.strikes <= self.config.strike_ramp_limit {
            core.timer_speed += self.config.strike_speedup;
        }
        self.emit(BombEvent::ModuleStruck {
            module,
            strikes: core.strikes,
        });
        self.refresh_timers(core);
        false
    }

    fn refresh_timers(&self, core: &mut BombCore) {
        for index in 0..core.modules.len() {
            if !core.modules[index].kind().is_timer() {
                continue;
            }
            let mut ctx = ModuleCtx::new(core.view(), Instant::now());
            core.modules[index].refresh_state(&mut ctx);
            self.apply(core, index, ctx.into_requests());
        }
    }

    fn explode_locked(&self, core: &mut BombCore) -> bool {
        if core.state.is_terminal() {
            return false;
        }
        self.broadcast(Payload::Explode);
        self.set_state(core, BombState::Exploded);
        true
    }

    fn check_solve(&self, core: &mut BombCore) {
        if core.state != BombState::GameStarted {
            return;
        }
        let solved = core
            .modules
            .iter()
            .all(|module| module.state() == ModuleState::Defused || !module.must_solve());
        if solved {
            self.broadcast(Payload::Defuse);
            self.set_state(core, BombState::Defused);
        }
    }

    async fn module_ready_change(&self, change: ModuleReadyChange) {
        let core = self.core.lock().await;
        if matches!(core.state, BombState::Uninitialized | BombState::Deinitialized) {
            return;
        }
        let location = change.location;
        let error = if change.present {
            BombError::new(
                None,
                BombErrorLevel::Warning,
                format!("A module was added at slot {location} after initialization."),
            )
        } else {
            match core.by_location.get(&location) {
                Some(&index) => BombError::new(
                    Some(core.modules[index].reference()),
                    BombErrorLevel::Warning,
                    "The module was removed after initialization.",
                ),
                None => BombError::new(
                    None,
                    BombErrorLevel::Warning,
                    format!("A module was removed from slot {location} after initialization."),
                ),
            }
        };
        self.raise(error);
    }

    async fn finish_game_start(self: Arc<Self>) {
        tokio::time::sleep(self.config.game_start_delay).await;
        let mut core = self.core.lock().await;
        if core.state != BombState::GameStarting {
            debug!(state = %core.state, "game start abandoned");
            return;
        }
        core.settled_at = Some(Instant::now());
        self.set_state(&mut core, BombState::GameStarted);
        self.broadcast(Payload::StartTimer);
        // modules solved during the start delay
        self.check_solve(&mut core);
        if core.state != BombState::GameStarted {
            return;
        }
        let timer = Arc::clone(&self);
        self.spawn("timer", async move { timer.run_timer().await });
    }

    async fn run_timer(self: Arc<Self>) {
        loop {
            let pause = {
                let mut core = self.core.lock().await;
                if core.state != BombState::GameStarted {
                    break;
                }
                core.settle(Instant::now());
                if core.time_left <= 0.0 {
                    info!("timer ran out");
                    self.explode_locked(&mut core);
                    break;
                }
                let shown = displayed_seconds(core.time_left);
                if shown != core.shown_seconds {
                    core.shown_seconds = shown;
                    self.emit(BombEvent::TimerTick { seconds: shown });
                }
                until_next_second(core.time_left, core.timer_speed)
            };
            tokio::time::sleep(pause).await;
        }
    }
}

/// Keepalive loop. Holds only a weak handle so a dropped bomb ends it.
async fn run_pings(bomb: Weak<Shared>) {
    loop {
        let Some(shared) = bomb.upgrade() else { break };
        let period = shared.config.ping_poll_period;
        {
            let mut core = shared.core.lock().await;
            if core.state == BombState::Deinitialized {
                break;
            }
            let now = Instant::now();
            for index in 0..core.modules.len() {
                let mut ctx = ModuleCtx::new(core.view(), now);
                core.modules[index].ping_check(
                    &mut ctx,
                    shared.config.ping_interval,
                    shared.config.ping_timeout,
                );
                shared.apply(&mut core, index, ctx.into_requests());
            }
        }
        drop(shared);
        tokio::time::sleep(period).await;
    }
}
