//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb lifecycle, module contract, and hardware simulation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use bombgame_bus::{BusMessage, ModuleKind, Payload, TimerState};
use serde_json::json;

use crate::module::{ModuleBehavior, ModuleCtx};
use crate::state::ModuleState;

/// Behaviour for a freshly announced module of `kind`.
pub fn behavior_for(kind: ModuleKind) -> Box<dyn ModuleBehavior> {
    match kind {
        ModuleKind::Timer => Box::new(TimerModule),
        other => Box::new(PassiveModule::new(other)),
    }
}

/// The countdown display. It has nothing to solve.
#[derive(Debug, Default)]
pub struct TimerModule;

impl ModuleBehavior for TimerModule {
    fn kind(&self) -> ModuleKind {
        ModuleKind::Timer
    }

    fn must_solve(&self) -> bool {
        false
    }

    fn send_state(&self, ctx: &mut ModuleCtx) {
        let view = ctx.view();
        let state = TimerState::from_bomb(
            view.time_left,
            view.timer_speed,
            view.strikes,
            view.max_strikes,
        );
        ctx.send(Payload::SetTimerState(state));
    }

    fn handle_message(
        &mut self,
        _state: ModuleState,
        _message: &BusMessage,
        _ctx: &mut ModuleCtx,
    ) -> bool {
        false
    }

    fn ui_state(&self) -> serde_json::Value {
        json!({})
    }
}

/// A puzzle whose logic runs entirely on the module; the controller only
/// tracks the solve and strike reports it sends.
#[derive(Debug)]
pub struct PassiveModule {
    kind: ModuleKind,
    strikes: u32,
    solved: bool,
}

impl PassiveModule {
    pub fn new(kind: ModuleKind) -> Self {
        Self {
            kind,
            strikes: 0,
            solved: false,
        }
    }
}

impl ModuleBehavior for PassiveModule {
    fn kind(&self) -> ModuleKind {
        self.kind
    }

    fn generate(&mut self) {
        self.strikes = 0;
        self.solved = false;
    }

    fn send_state(&self, _ctx: &mut ModuleCtx) {}

    fn handle_message(
        &mut self,
        state: ModuleState,
        message: &BusMessage,
        ctx: &mut ModuleCtx,
    ) -> bool {
        if state != ModuleState::Game {
            return false;
        }
        match message.payload() {
            Payload::Solve if !self.kind.is_needy() => {
                self.solved = true;
                ctx.defuse();
                true
            }
            Payload::Strike => {
                self.strikes += 1;
                ctx.strike(true);
                true
            }
            _ => false,
        }
    }

    fn ui_state(&self) -> serde_json::Value {
        json!({
            "needy": self.kind.is_needy(),
            "solved": self.solved,
            "strikes": self.strikes,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::module::{BombView, ModuleRequest};
    use bombgame_bus::ModuleId;

    const VIEW: BombView = BombView {
        time_left: 299.6,
        timer_speed: 1.25,
        strikes: 1,
        max_strikes: 3,
    };

    fn from(kind: ModuleKind, payload: Payload) -> BusMessage {
        let id = ModuleId::new(kind.module_type(), 1).expect("valid id");
        BusMessage::from_module(id, payload).expect("valid message")
    }

    #[test]
    fn timer_pushes_rounded_state_and_needs_no_solve() {
        let timer = behavior_for(ModuleKind::Timer);
        assert!(!timer.must_solve());
        let mut ctx = ModuleCtx::new(VIEW, Instant::now());
        timer.send_state(&mut ctx);
        assert_eq!(
            ctx.into_requests(),
            vec![ModuleRequest::Send(Payload::SetTimerState(TimerState {
                seconds: 300,
                speed: 320,
                strikes: 1,
                max_strikes: 3,
            }))]
        );
    }

    #[test]
    fn needy_modules_are_optional() {
        assert!(!behavior_for(ModuleKind::VentingGas).must_solve());
        assert!(behavior_for(ModuleKind::Wires).must_solve());
    }

    #[test]
    fn passive_module_reports_only_during_game() {
        let mut wires = PassiveModule::new(ModuleKind::Wires);
        let solve = from(ModuleKind::Wires, Payload::Solve);

        let mut ctx = ModuleCtx::new(VIEW, Instant::now());
        assert!(!wires.handle_message(ModuleState::Configuration, &solve, &mut ctx));
        assert!(ctx.into_requests().is_empty());

        let mut ctx = ModuleCtx::new(VIEW, Instant::now());
        assert!(wires.handle_message(ModuleState::Game, &solve, &mut ctx));
        let strike = from(ModuleKind::Wires, Payload::Strike);
        assert!(wires.handle_message(ModuleState::Game, &strike, &mut ctx));
        assert_eq!(
            ctx.into_requests(),
            vec![ModuleRequest::Defuse, ModuleRequest::Strike]
        );
        assert_eq!(wires.ui_state()["strikes"], 1);
    }

    #[test]
    fn needy_module_cannot_be_solved() {
        let mut gas = PassiveModule::new(ModuleKind::VentingGas);
        let solve = from(ModuleKind::VentingGas, Payload::Solve);
        let mut ctx = ModuleCtx::new(VIEW, Instant::now());
        assert!(!gas.handle_message(ModuleState::Game, &solve, &mut ctx));
    }
}
