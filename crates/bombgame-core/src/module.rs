//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Base contract shared by every puzzle module.
//!
//! A [`Module`] never touches the bus or the bomb directly. Every side effect
//! is queued on a [`ModuleCtx`] and applied by the bomb while it still holds
//! its state lock, so frames and state flips stay in order.

use std::time::{Duration, Instant};

use bombgame_bus::{BusMessage, ErrorSeverity, ModuleId, ModuleKind, Payload, Version};
use serde::Serialize;
use tracing::{debug, warn};

use crate::events::{BombError, BombErrorLevel, BombEvent, ModuleRef};
use crate::state::ModuleState;

const DEFAULT_ERROR_DESCRIPTIONS: [&str; 3] = [
    "The module received an invalid message.",
    "The module encountered an unknown hardware error.",
    "The module encountered an unknown software error.",
];

const UNKNOWN_ERROR_DESCRIPTION: &str = "The module encountered an unknown error.";

/// Human-readable text for a module error code.
pub fn describe_error(code: u8) -> &'static str {
    DEFAULT_ERROR_DESCRIPTIONS
        .get(usize::from(code))
        .copied()
        .unwrap_or(UNKNOWN_ERROR_DESCRIPTION)
}

/// Read-only bomb parameters handed to module behaviours.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BombView {
    pub time_left: f64,
    pub timer_speed: f64,
    pub strikes: u32,
    pub max_strikes: u32,
}

/// Side effect requested by a module, applied by the bomb in order.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleRequest {
    /// Send a frame addressed to the requesting module.
    Send(Payload),
    Event(BombEvent),
    /// The module state changed; triggers the defuse check.
    StateChanged,
    /// Mark the module defused.
    Defuse,
    /// Count a strike against the bomb.
    Strike,
}

/// Collects the requests a module makes during one call.
#[derive(Debug)]
pub struct ModuleCtx {
    view: BombView,
    now: Instant,
    requests: Vec<ModuleRequest>,
}

impl ModuleCtx {
    pub fn new(view: BombView, now: Instant) -> Self {
        Self {
            view,
            now,
            requests: Vec::new(),
        }
    }

    pub fn view(&self) -> &BombView {
        &self.view
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    pub fn send(&mut self, payload: Payload) {
        self.requests.push(ModuleRequest::Send(payload));
    }

    pub fn defuse(&mut self) {
        self.requests.push(ModuleRequest::Defuse);
    }

    /// Record a strike. Uncounted strikes are ignored.
    pub fn strike(&mut self, count: bool) {
        if count {
            self.requests.push(ModuleRequest::Strike);
        }
    }

    fn emit(&mut self, event: BombEvent) {
        self.requests.push(ModuleRequest::Event(event));
    }

    fn state_changed(&mut self) {
        self.requests.push(ModuleRequest::StateChanged);
    }

    pub fn into_requests(self) -> Vec<ModuleRequest> {
        self.requests
    }
}

/// Puzzle-specific part of a module.
pub trait ModuleBehavior: Send + Sync {
    fn kind(&self) -> ModuleKind;

    /// Modules that need not be solved for the bomb to be defused return `false`.
    fn must_solve(&self) -> bool {
        !self.kind().is_needy()
    }

    /// Produce a new puzzle solution.
    fn generate(&mut self) {}

    /// Push configuration to the hardware before the game starts.
    fn send_state(&self, ctx: &mut ModuleCtx);

    /// Handle a module-specific message. Returns `false` if the message is
    /// unknown or invalid in `state`.
    fn handle_message(&mut self, state: ModuleState, message: &BusMessage, ctx: &mut ModuleCtx)
        -> bool;

    fn ui_state(&self) -> serde_json::Value;
}

/// A module instance created from an `Announce` frame.
pub struct Module {
    bus_id: ModuleId,
    location: usize,
    hw_version: Version,
    sw_version: Version,
    last_received: Instant,
    last_ping_sent: Option<Instant>,
    last_ping_id: u8,
    ping_timed_out: bool,
    state: ModuleState,
    errors: Vec<(Option<u8>, BombError)>,
    behavior: Box<dyn ModuleBehavior>,
}

impl Module {
    pub fn new(
        bus_id: ModuleId,
        location: usize,
        hw_version: Version,
        sw_version: Version,
        behavior: Box<dyn ModuleBehavior>,
        now: Instant,
    ) -> Self {
        Self {
            bus_id,
            location,
            hw_version,
            sw_version,
            last_received: now,
            last_ping_sent: None,
            last_ping_id: 0,
            ping_timed_out: false,
            state: ModuleState::Initialization,
            errors: Vec::new(),
            behavior,
        }
    }

    pub fn bus_id(&self) -> ModuleId {
        self.bus_id
    }

    pub fn location(&self) -> usize {
        self.location
    }

    pub fn kind(&self) -> ModuleKind {
        self.behavior.kind()
    }

    pub fn reference(&self) -> ModuleRef {
        ModuleRef {
            bus_id: self.bus_id,
            kind: self.kind(),
            location: self.location,
        }
    }

    pub fn state(&self) -> ModuleState {
        self.state
    }

    pub fn must_solve(&self) -> bool {
        self.behavior.must_solve()
    }

    pub fn hw_version(&self) -> Version {
        self.hw_version
    }

    pub fn sw_version(&self) -> Version {
        self.sw_version
    }

    /// Set once a ping goes unanswered and never cleared afterwards.
    pub fn ping_timed_out(&self) -> bool {
        self.ping_timed_out
    }

    pub fn ping_outstanding(&self) -> bool {
        self.last_ping_sent.is_some()
    }

    pub fn errors(&self) -> impl Iterator<Item = &BombError> {
        self.errors.iter().map(|(_, error)| error)
    }

    /// Highest level among the active errors.
    pub fn error_level(&self) -> BombErrorLevel {
        self.errors
            .iter()
            .map(|(_, error)| error.level)
            .max()
            .unwrap_or_default()
    }

    pub fn ui_state(&self) -> serde_json::Value {
        self.behavior.ui_state()
    }

    /// Record that a frame arrived from the module.
    pub fn touch(&mut self, now: Instant) {
        self.last_received = now;
    }

    /// Used for modules that announced with `init_complete` set.
    pub(crate) fn mark_configured(&mut self) {
        self.state = ModuleState::Configuration;
    }

    pub fn generate(&mut self) {
        self.behavior.generate();
    }

    /// Push runtime parameters and enter the game.
    pub fn send_state(&mut self, ctx: &mut ModuleCtx) {
        self.behavior.send_state(ctx);
        if self.state != ModuleState::Game && self.state != ModuleState::Defused {
            self.state = ModuleState::Game;
            ctx.state_changed();
        }
    }

    /// Push runtime parameters without touching the module state.
    pub fn refresh_state(&self, ctx: &mut ModuleCtx) {
        self.behavior.send_state(ctx);
    }

    /// Adds an error to this module and publishes it.
    pub fn raise_error(
        &mut self,
        ctx: &mut ModuleCtx,
        level: BombErrorLevel,
        details: impl Into<String>,
        code: Option<u8>,
    ) {
        let error = BombError::new(Some(self.reference()), level, details);
        self.errors.push((code, error.clone()));
        ctx.emit(BombEvent::Error(error));
    }

    /// Keepalive step. Returns `false` when a ping timeout was just detected.
    pub fn ping_check(
        &mut self,
        ctx: &mut ModuleCtx,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> bool {
        let now = ctx.now();
        if let Some(sent) = self.last_ping_sent {
            if !self.ping_timed_out && now > sent + ping_timeout {
                warn!(module = %self.bus_id, ping = self.last_ping_id, "module didn't respond to ping");
                self.ping_timed_out = true;
                self.raise_error(ctx, BombErrorLevel::Warning, "Ping timeout.", None);
                return false;
            }
        } else if now > self.last_received + ping_interval {
            self.last_ping_sent = Some(now);
            self.last_ping_id = self.last_ping_id.wrapping_add(1);
            debug!(module = %self.bus_id, ping = self.last_ping_id, "sending ping");
            ctx.send(Payload::Ping(Some(self.last_ping_id)));
        }
        true
    }

    /// Handle a frame from the module. Returns whether it was valid for the current state.
    pub fn handle_message(&mut self, message: &BusMessage, ctx: &mut ModuleCtx) -> bool {
        match message.payload() {
            Payload::InitComplete if self.state == ModuleState::Initialization => {
                self.state = ModuleState::Configuration;
                ctx.state_changed();
                true
            }
            Payload::Ping(number) => {
                if let Some(sent) = self.last_ping_sent {
                    if number.map_or(true, |number| number == self.last_ping_id) {
                        debug!(
                            module = %self.bus_id,
                            ping = self.last_ping_id,
                            latency_ms = ctx.now().saturating_duration_since(sent).as_millis() as u64,
                            "ping answered"
                        );
                        self.last_ping_sent = None;
                    }
                }
                true
            }
            Payload::Error(report) => {
                if report.severity == ErrorSeverity::Recovered {
                    self.errors.retain(|(code, _)| *code != Some(report.code));
                }
                self.raise_error(
                    ctx,
                    BombErrorLevel::from(report.severity),
                    describe_error(report.code),
                    Some(report.code),
                );
                true
            }
            _ => self.behavior.handle_message(self.state, message, ctx),
        }
    }

    /// Mark the module solved and acknowledge it on the bus.
    pub fn defuse(&mut self, ctx: &mut ModuleCtx) {
        if self.state == ModuleState::Defused {
            return;
        }
        self.state = ModuleState::Defused;
        ctx.send(Payload::Solve);
        ctx.state_changed();
    }

    /// Record a strike on this module.
    pub fn strike(&self, ctx: &mut ModuleCtx, count: bool) {
        ctx.strike(count);
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("bus_id", &self.bus_id)
            .field("location", &self.location)
            .field("state", &self.state)
            .field("hw_version", &self.hw_version)
            .field("sw_version", &self.sw_version)
            .finish_non_exhaustive()
    }
}

/// Serializable view of one module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub bus_id: ModuleId,
    pub kind: ModuleKind,
    pub location: usize,
    pub state: ModuleState,
    pub hw_version: String,
    pub sw_version: String,
    pub must_solve: bool,
    pub error_level: BombErrorLevel,
    pub ping_timed_out: bool,
    pub details: serde_json::Value,
}

impl From<&Module> for ModuleSnapshot {
    fn from(module: &Module) -> Self {
        Self {
            bus_id: module.bus_id,
            kind: module.kind(),
            location: module.location,
            state: module.state,
            hw_version: module.hw_version.to_string(),
            sw_version: module.sw_version.to_string(),
            must_solve: module.must_solve(),
            error_level: module.error_level(),
            ping_timed_out: module.ping_timed_out,
            details: module.ui_state(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bombgame_bus::ErrorReport;

    struct Inert;

    impl ModuleBehavior for Inert {
        fn kind(&self) -> ModuleKind {
            ModuleKind::Keypad
        }

        fn send_state(&self, _ctx: &mut ModuleCtx) {}

        fn handle_message(
            &mut self,
            _state: ModuleState,
            _message: &BusMessage,
            _ctx: &mut ModuleCtx,
        ) -> bool {
            false
        }

        fn ui_state(&self) -> serde_json::Value {
            serde_json::Value::Null
        }
    }

    const VIEW: BombView = BombView {
        time_left: 300.0,
        timer_speed: 1.0,
        strikes: 0,
        max_strikes: 3,
    };

    fn keypad(now: Instant) -> Module {
        let id = ModuleId::new(ModuleKind::Keypad.module_type(), 9).expect("valid id");
        Module::new(id, 1, Version::new(1, 0), Version::new(1, 0), Box::new(Inert), now)
    }

    fn inbound(module: &Module, payload: Payload) -> BusMessage {
        BusMessage::from_module(module.bus_id(), payload).expect("valid message")
    }

    fn sent(requests: &[ModuleRequest]) -> Vec<&Payload> {
        requests
            .iter()
            .filter_map(|request| match request {
                ModuleRequest::Send(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn init_complete_only_counts_during_initialization() {
        let now = Instant::now();
        let mut module = keypad(now);
        let message = inbound(&module, Payload::InitComplete);

        let mut ctx = ModuleCtx::new(VIEW, now);
        assert!(module.handle_message(&message, &mut ctx));
        assert_eq!(module.state(), ModuleState::Configuration);
        assert_eq!(ctx.into_requests(), vec![ModuleRequest::StateChanged]);

        let mut ctx = ModuleCtx::new(VIEW, now);
        assert!(!module.handle_message(&message, &mut ctx));
    }

    #[test]
    fn ping_sequence_numbers_increase_and_wrap() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let timeout = Duration::from_millis(100);
        let mut module = keypad(start);
        module.last_ping_id = 0xFF;

        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_millis(50));
        assert!(module.ping_check(&mut ctx, interval, timeout));
        assert!(ctx.into_requests().is_empty(), "recent traffic needs no ping");

        let later = start + Duration::from_millis(150);
        let mut ctx = ModuleCtx::new(VIEW, later);
        assert!(module.ping_check(&mut ctx, interval, timeout));
        assert_eq!(sent(&ctx.into_requests()), vec![&Payload::Ping(Some(0))]);
        assert!(module.ping_outstanding());

        let echo = inbound(&module, Payload::Ping(Some(0)));
        let mut ctx = ModuleCtx::new(VIEW, later);
        assert!(module.handle_message(&echo, &mut ctx));
        assert!(!module.ping_outstanding());
    }

    #[test]
    fn unanswered_ping_warns_once_and_stays_flagged() {
        let start = Instant::now();
        let interval = Duration::from_millis(100);
        let timeout = Duration::from_millis(100);
        let mut module = keypad(start);

        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_millis(150));
        module.ping_check(&mut ctx, interval, timeout);

        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_millis(300));
        assert!(!module.ping_check(&mut ctx, interval, timeout));
        assert!(module.ping_timed_out());
        assert_eq!(module.error_level(), BombErrorLevel::Warning);

        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_millis(600));
        assert!(module.ping_check(&mut ctx, interval, timeout));
        assert!(ctx.into_requests().is_empty());

        let echo = inbound(&module, Payload::Ping(None));
        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_millis(650));
        module.handle_message(&echo, &mut ctx);
        assert!(!module.ping_outstanding());
        assert!(module.ping_timed_out(), "the timeout flag is never cleared");
    }

    #[test]
    fn mismatched_ping_echo_keeps_ping_outstanding() {
        let start = Instant::now();
        let mut module = keypad(start);
        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_secs(2));
        module.ping_check(&mut ctx, Duration::from_secs(1), Duration::from_secs(1));

        let stale = inbound(&module, Payload::Ping(Some(42)));
        let mut ctx = ModuleCtx::new(VIEW, start + Duration::from_secs(2));
        assert!(module.handle_message(&stale, &mut ctx));
        assert!(module.ping_outstanding());
    }

    #[test]
    fn recovered_error_replaces_matching_codes() {
        let now = Instant::now();
        let mut module = keypad(now);
        let report = |severity, code| {
            Payload::Error(ErrorReport {
                severity,
                code,
                details: Vec::new(),
            })
        };

        for payload in [
            report(ErrorSeverity::Major, 1),
            report(ErrorSeverity::Minor, 1),
            report(ErrorSeverity::Recoverable, 7),
        ] {
            let mut ctx = ModuleCtx::new(VIEW, now);
            assert!(module.handle_message(&inbound(&module, payload), &mut ctx));
        }
        assert_eq!(module.error_level(), BombErrorLevel::Major);
        assert_eq!(
            module.errors().next().map(|e| e.details.as_str()),
            Some(describe_error(1))
        );

        let mut ctx = ModuleCtx::new(VIEW, now);
        module.handle_message(&inbound(&module, report(ErrorSeverity::Recovered, 1)), &mut ctx);
        let levels: Vec<_> = module.errors().map(|e| e.level).collect();
        assert_eq!(levels, vec![BombErrorLevel::Recoverable, BombErrorLevel::Recovered]);
        assert_eq!(module.error_level(), BombErrorLevel::Recoverable);
        assert_eq!(describe_error(200), UNKNOWN_ERROR_DESCRIPTION);
    }

    #[test]
    fn defuse_sends_solve_once() {
        let now = Instant::now();
        let mut module = keypad(now);
        let mut ctx = ModuleCtx::new(VIEW, now);
        module.defuse(&mut ctx);
        module.defuse(&mut ctx);
        let requests = ctx.into_requests();
        assert_eq!(sent(&requests), vec![&Payload::Solve]);
        assert_eq!(module.state(), ModuleState::Defused);
    }

    #[test]
    fn uncounted_strike_requests_nothing() {
        let now = Instant::now();
        let mut module = keypad(now);
        let mut ctx = ModuleCtx::new(VIEW, now);
        module.strike(&mut ctx, false);
        module.strike(&mut ctx, true);
        assert_eq!(ctx.into_requests(), vec![ModuleRequest::Strike]);
    }

    #[test]
    fn unknown_messages_fall_through_to_behavior() {
        let now = Instant::now();
        let mut module = keypad(now);
        let mut ctx = ModuleCtx::new(VIEW, now);
        assert!(!module.handle_message(&inbound(&module, Payload::Solve), &mut ctx));
    }
}
