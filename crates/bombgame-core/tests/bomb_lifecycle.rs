//! ---
//! ems_section: "15-testing-qa-runbook"
//! ems_subsection: "integration-tests"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bomb initialization, game and shutdown against simulated modules."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bombgame_bus::{
    Announce, BombBus, BusMessage, CanTransport, Direction, ErrorSeverity, ModuleId, ModuleKind,
    Payload, Version, VirtualCanEndpoint, VirtualCanNetwork,
};
use bombgame_common::{BombConfig, BusConfig};
use bombgame_core::{
    Bomb, BombErrorLevel, BombEvent, BombSnapshot, BombState, MockGpio, ModuleProfile,
    SimulatedModule,
};
use tokio::sync::broadcast::{self, error::RecvError};

const SLOTS: usize = 6;
const WAIT: Duration = Duration::from_secs(2);

fn fast_config() -> BombConfig {
    BombConfig {
        reset_period: Duration::from_millis(10),
        announce_timeout: Duration::from_millis(200),
        ping_interval: Duration::from_secs(5),
        ping_timeout: Duration::from_secs(5),
        ping_poll_period: Duration::from_millis(10),
        game_start_delay: Duration::from_millis(20),
        game_duration: Duration::from_secs(300),
        max_strikes: 3,
        strike_speedup: 0.25,
        strike_ramp_limit: 4,
        serial_number: Some("KT4FA7".to_owned()),
    }
}

fn id(kind: ModuleKind, serial: u16) -> ModuleId {
    ModuleId::new(kind.module_type(), serial).expect("valid id")
}

fn timer(location: usize) -> ModuleProfile {
    ModuleProfile::new(location, id(ModuleKind::Timer, 1))
}

fn wires(location: usize) -> ModuleProfile {
    ModuleProfile {
        init_complete: false,
        init_delay: Duration::from_millis(20),
        ..ModuleProfile::new(location, id(ModuleKind::Wires, 7))
    }
}

struct Rig {
    network: VirtualCanNetwork,
    monitor: VirtualCanEndpoint,
    gpio: Arc<MockGpio>,
    bus: BombBus,
    bomb: Bomb,
    modules: Vec<SimulatedModule>,
}

impl Rig {
    fn new(profiles: Vec<ModuleProfile>, config: BombConfig) -> Result<Self> {
        let network = VirtualCanNetwork::new();
        let monitor = network.endpoint();
        let gpio = Arc::new(MockGpio::new(SLOTS, 2));
        let modules = profiles
            .into_iter()
            .map(|profile| SimulatedModule::plug_in(profile, &network, Arc::clone(&gpio)))
            .collect::<Result<Vec<_>>>()?;
        let bus_config = BusConfig {
            recv_poll: Duration::from_millis(5),
            ..BusConfig::default()
        };
        let bus = BombBus::new(Arc::new(network.endpoint()), &bus_config);
        bus.start()?;
        let bomb = Bomb::new(bus.clone(), gpio.clone(), config)?;
        Ok(Self {
            network,
            monitor,
            gpio,
            bus,
            bomb,
            modules,
        })
    }

    fn module(&self, bus_id: ModuleId) -> &SimulatedModule {
        self.modules
            .iter()
            .find(|module| module.bus_id() == bus_id)
            .expect("module in rig")
    }

    /// Number of `payload` frames the controller sent since the last drain.
    fn count_sent(&self, payload: &Payload) -> usize {
        self.controller_frames()
            .iter()
            .filter(|frame| frame.payload() == payload)
            .count()
    }

    /// Controller frames seen on the wire since the last call.
    fn controller_frames(&self) -> Vec<BusMessage> {
        let mut frames = Vec::new();
        while let Ok(Some(frame)) = self.monitor.recv(Duration::ZERO) {
            if let Ok(message) = BusMessage::decode(&frame) {
                if message.direction() == Direction::Out {
                    frames.push(message);
                }
            }
        }
        frames
    }

    async fn start_game(&self) -> Result<()> {
        assert_eq!(self.bomb.initialize().await?, BombState::Initialized);
        self.bomb.start_game().await?;
        let started = self
            .bomb
            .wait_for_state(WAIT, |state| state == BombState::GameStarted)
            .await;
        assert_eq!(started, Some(BombState::GameStarted));
        Ok(())
    }

    async fn shutdown(self) -> Result<()> {
        self.bomb.deinitialize().await?;
        self.bus.stop();
        Ok(())
    }
}

async fn snapshot_until(bomb: &Bomb, ready: impl Fn(&BombSnapshot) -> bool) -> BombSnapshot {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let snapshot = bomb.snapshot().await;
        if ready(&snapshot) {
            return snapshot;
        }
        assert!(tokio::time::Instant::now() < deadline, "bomb never reached expected snapshot");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

async fn next_event(
    events: &mut broadcast::Receiver<BombEvent>,
    wanted: impl Fn(&BombEvent) -> bool,
) -> Option<BombEvent> {
    let search = async {
        loop {
            match events.recv().await {
                Ok(event) if wanted(&event) => return Some(event),
                Ok(_) | Err(RecvError::Lagged(_)) => continue,
                Err(RecvError::Closed) => return None,
            }
        }
    };
    tokio::time::timeout(WAIT, search).await.ok().flatten()
}

fn is_error(level: BombErrorLevel, details: &'static str) -> impl Fn(&BombEvent) -> bool {
    move |event| matches!(event, BombEvent::Error(error) if error.level == level && error.details == details)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn initializes_every_connected_slot() -> Result<()> {
    let rig = Rig::new(vec![timer(0), wires(2)], fast_config())?;
    assert_eq!(rig.bomb.initialize().await?, BombState::Initialized);
    assert_eq!(rig.bomb.module_locations().await, vec![0, 2]);
    assert!(!rig.gpio.enable_state(0) && !rig.gpio.enable_state(2));

    let resets = rig
        .controller_frames()
        .into_iter()
        .filter(|frame| frame.payload() == &Payload::Reset && frame.module().is_broadcast())
        .count();
    assert_eq!(resets, 1);
    assert_eq!(rig.bomb.serial_number().as_str(), "KT4FA7");
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn silent_slot_fails_initialization() -> Result<()> {
    let silent = ModuleProfile {
        announces: false,
        ..wires(2)
    };
    let rig = Rig::new(vec![timer(0), silent], fast_config())?;
    let mut events = rig.bomb.subscribe();

    assert_eq!(rig.bomb.initialize().await?, BombState::InitializationFailed);
    assert_eq!(rig.bomb.module_locations().await, vec![0]);
    assert!(!rig.gpio.enable_state(2), "enable line released after timeout");
    assert!(next_event(
        &mut events,
        is_error(
            BombErrorLevel::InitFailure,
            "module at slot 2 did not announce in time"
        )
    )
    .await
    .is_some());
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bomb_without_timer_fails_initialization() -> Result<()> {
    let rig = Rig::new(vec![wires(1)], fast_config())?;
    let mut events = rig.bomb.subscribe();
    assert_eq!(rig.bomb.initialize().await?, BombState::InitializationFailed);
    assert!(next_event(
        &mut events,
        is_error(BombErrorLevel::InitFailure, "no timer found on bomb")
    )
    .await
    .is_some());
    assert!(rig.bomb.start_game().await.is_err());
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn third_strike_explodes_exactly_once() -> Result<()> {
    let rig = Rig::new(vec![timer(0), wires(1)], fast_config())?;
    rig.start_game().await?;
    let wires_id = id(ModuleKind::Wires, 7);
    let module = rig.module(wires_id);

    module.report_strike()?;
    let snapshot = snapshot_until(&rig.bomb, |s| s.strikes == 1).await;
    assert_eq!(snapshot.timer_speed, 1.25);
    module.report_strike()?;
    let snapshot = snapshot_until(&rig.bomb, |s| s.strikes == 2).await;
    assert_eq!(snapshot.timer_speed, 1.5);
    assert_eq!(snapshot.state, BombState::GameStarted);

    rig.controller_frames();
    module.report_strike()?;
    let exploded = rig
        .bomb
        .wait_for_state(WAIT, |state| state == BombState::Exploded)
        .await;
    assert_eq!(exploded, Some(BombState::Exploded));

    module.report_strike()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let explodes = rig
        .controller_frames()
        .into_iter()
        .filter(|frame| frame.payload() == &Payload::Explode)
        .count();
    assert_eq!(explodes, 1);
    assert_eq!(module.count_received(|p| p == &Payload::Strike), 2);
    assert_eq!(rig.bomb.snapshot().await.strikes, 3);
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn strikes_from_three_slots_explode_the_bomb() -> Result<()> {
    let keypad = ModuleProfile::new(2, id(ModuleKind::Keypad, 2));
    let button = ModuleProfile::new(3, id(ModuleKind::Button, 4));
    let rig = Rig::new(vec![timer(0), wires(1), keypad, button], fast_config())?;
    rig.start_game().await?;
    let strikers = [
        rig.module(id(ModuleKind::Wires, 7)),
        rig.module(id(ModuleKind::Keypad, 2)),
        rig.module(id(ModuleKind::Button, 4)),
    ];
    let timer_module = rig.module(id(ModuleKind::Timer, 1));
    let pushed_at_start = timer_module.count_received(|p| matches!(p, Payload::SetTimerState(_)));
    rig.controller_frames();

    strikers[0].report_strike()?;
    let snapshot = snapshot_until(&rig.bomb, |s| s.strikes == 1).await;
    assert_eq!(snapshot.timer_speed, 1.25);
    strikers[1].report_strike()?;
    let snapshot = snapshot_until(&rig.bomb, |s| s.strikes == 2).await;
    assert_eq!(snapshot.timer_speed, 1.5);
    strikers[2].report_strike()?;
    let exploded = rig
        .bomb
        .wait_for_state(WAIT, |state| state == BombState::Exploded)
        .await;
    assert_eq!(exploded, Some(BombState::Exploded));
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(rig.bomb.snapshot().await.strikes, 3);
    let struck: Vec<usize> = strikers
        .iter()
        .map(|module| module.count_received(|p| p == &Payload::Strike))
        .collect();
    assert_eq!(struck, vec![1, 1, 0], "only surviving strikes are echoed, once per module");
    assert_eq!(
        timer_module.count_received(|p| matches!(p, Payload::SetTimerState(_))),
        pushed_at_start + 2,
        "timer display refreshed after each surviving strike"
    );
    assert_eq!(rig.count_sent(&Payload::Explode), 1);
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn countdown_ticks_each_second_then_explodes() -> Result<()> {
    let config = BombConfig {
        game_duration: Duration::from_millis(3500),
        ..fast_config()
    };
    let rig = Rig::new(vec![timer(0), wires(1)], config)?;
    let mut events = rig.bomb.subscribe();
    rig.start_game().await?;
    rig.controller_frames();

    let exploded = rig
        .bomb
        .wait_for_state(Duration::from_secs(6), |state| state == BombState::Exploded)
        .await;
    assert_eq!(exploded, Some(BombState::Exploded));

    let mut ticks = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let BombEvent::TimerTick { seconds } = event {
            ticks.push(seconds);
        }
    }
    assert_eq!(ticks, vec![3, 2, 1]);
    let snapshot = rig.bomb.snapshot().await;
    assert_eq!(snapshot.time_left, 0.0);
    assert_eq!(snapshot.strikes, 0);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(rig.count_sent(&Payload::Explode), 1);
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_enumeration_releases_the_slot() -> Result<()> {
    let config = BombConfig {
        announce_timeout: Duration::from_secs(30),
        ..fast_config()
    };
    let silent = ModuleProfile {
        announces: false,
        ..wires(1)
    };
    let rig = Rig::new(vec![timer(0), silent], config)?;
    let mut events = rig.bomb.subscribe();

    let bomb = rig.bomb.clone();
    let enumeration = tokio::spawn(async move { bomb.initialize().await });
    let deadline = tokio::time::Instant::now() + WAIT;
    while !rig.gpio.enable_state(1) {
        assert!(tokio::time::Instant::now() < deadline, "slot 1 never enabled");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    enumeration.abort();
    assert!(enumeration.await.is_err(), "enumeration was cancelled");

    let deadline = tokio::time::Instant::now() + WAIT;
    while rig.gpio.enable_state(1) {
        assert!(tokio::time::Instant::now() < deadline, "enable line still asserted");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    rig.module(id(ModuleKind::Wires, 7))
        .send(Payload::Announce(Announce {
            hw_version: Version::new(1, 0),
            sw_version: Version::new(1, 0),
            init_complete: true,
        }))?;
    assert!(next_event(
        &mut events,
        is_error(
            BombErrorLevel::InitFailure,
            "An unrequested announce was received from wires#7."
        )
    )
    .await
    .is_some());
    assert_eq!(rig.bomb.module_locations().await, vec![0]);
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn solving_last_module_defuses_once() -> Result<()> {
    let rig = Rig::new(vec![timer(0), wires(3)], fast_config())?;
    rig.start_game().await?;
    let timer_module = rig.module(id(ModuleKind::Timer, 1));
    assert!(timer_module.count_received(|p| matches!(p, Payload::SetTimerState(_))) >= 1);

    let wires_module = rig.module(id(ModuleKind::Wires, 7));
    rig.controller_frames();
    wires_module.solve()?;
    let defused = rig
        .bomb
        .wait_for_state(WAIT, |state| state == BombState::Defused)
        .await;
    assert_eq!(defused, Some(BombState::Defused));

    wires_module.solve()?;
    tokio::time::sleep(Duration::from_millis(50)).await;
    let frames = rig.controller_frames();
    let defuses = frames
        .iter()
        .filter(|frame| frame.payload() == &Payload::Defuse)
        .count();
    assert_eq!(defuses, 1);
    assert_eq!(wires_module.count_received(|p| p == &Payload::Solve), 1);
    assert!(rig.bomb.strike(wires_module.bus_id()).await.is_err());
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unanswered_pings_raise_a_warning() -> Result<()> {
    let config = BombConfig {
        ping_interval: Duration::from_millis(30),
        ping_timeout: Duration::from_millis(30),
        ..fast_config()
    };
    let mute = ModuleProfile {
        answers_pings: false,
        ..wires(2)
    };
    let rig = Rig::new(vec![timer(0), mute], config)?;
    let mut events = rig.bomb.subscribe();
    rig.bomb.initialize().await?;

    let warning = next_event(&mut events, is_error(BombErrorLevel::Warning, "Ping timeout.")).await;
    match warning {
        Some(BombEvent::Error(error)) => assert_eq!(error.location(), Some(2)),
        other => panic!("expected ping timeout, got {other:?}"),
    }
    let snapshot = rig.bomb.snapshot().await;
    let wires = snapshot
        .modules
        .iter()
        .find(|module| module.location == 2)
        .expect("wires present");
    assert!(wires.ping_timed_out);
    assert!(!snapshot.modules.iter().any(|m| m.location == 0 && m.ping_timed_out));
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn module_errors_and_late_plug_ins_are_reported() -> Result<()> {
    let rig = Rig::new(vec![timer(0), wires(1)], fast_config())?;
    let mut events = rig.bomb.subscribe();
    rig.bomb.initialize().await?;

    rig.module(id(ModuleKind::Wires, 7))
        .report_error(ErrorSeverity::Major, 1)?;
    let error = next_event(&mut events, |event| {
        matches!(event, BombEvent::Error(error) if error.level == BombErrorLevel::Major)
    })
    .await;
    assert!(matches!(error, Some(BombEvent::Error(error)) if error.location() == Some(1)));

    let late = SimulatedModule::plug_in(
        ModuleProfile::new(4, id(ModuleKind::Keypad, 2)),
        &rig.network,
        Arc::clone(&rig.gpio),
    )?;
    assert!(next_event(
        &mut events,
        is_error(
            BombErrorLevel::Warning,
            "A module was added at slot 4 after initialization."
        )
    )
    .await
    .is_some());
    drop(late);
    rig.shutdown().await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deinitialize_stops_background_work() -> Result<()> {
    let config = BombConfig {
        ping_interval: Duration::from_millis(10),
        ..fast_config()
    };
    let rig = Rig::new(vec![timer(0)], config)?;
    rig.bomb.initialize().await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    rig.bomb.deinitialize().await?;
    assert_eq!(rig.bomb.state().await, BombState::Deinitialized);
    rig.controller_frames();
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(rig.controller_frames().is_empty(), "no pings after shutdown");
    assert!(rig.bomb.deinitialize().await.is_err());
    rig.bus.stop();
    Ok(())
}
