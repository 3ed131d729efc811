//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the bomb controller daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bombgame_bus::{BombBus, BusMetrics, VirtualCanNetwork};
use bombgame_common::{init_tracing, ControllerConfig};
use bombgame_core::{Bomb, BombEvent, BombState, MockGpio, Simulator};
use clap::{Parser, Subcommand};
use prometheus::{Encoder, Registry, TextEncoder};
use tokio::signal;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

const CASING_SLOTS: usize = 12;
const WIDGET_SLOTS: usize = 8;
const GAME_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(author, version, about = "Bomb escape room controller", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run a bomb against simulated modules")]
    Simulate {
        #[arg(long, help = "Stop after initialization instead of playing a game")]
        no_game: bool,
        #[arg(long, help = "Print bus metrics when the run ends")]
        metrics: bool,
    },
    #[command(about = "Validate the configuration and print the effective values")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/bombgame.toml"));

    let loaded = ControllerConfig::load_with_source(&candidates)?;
    let command = cli.command.unwrap_or(Commands::Simulate {
        no_game: false,
        metrics: false,
    });
    match command {
        Commands::CheckConfig => {
            loaded.config.validate()?;
            let source = loaded
                .source
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "built-in defaults".to_owned());
            println!("# source: {source}");
            println!("{}", toml::to_string_pretty(&loaded.config)?);
        }
        Commands::Simulate { no_game, metrics } => {
            init_tracing("bombgamed", &loaded.config.logging)?;
            info!(source = ?loaded.source, "configuration loaded");
            simulate(loaded.config, !no_game, metrics).await?;
        }
    }
    Ok(())
}

async fn simulate(config: ControllerConfig, play: bool, print_metrics: bool) -> Result<()> {
    let capacity = config
        .simulation
        .slots
        .iter()
        .map(|slot| slot.location + 1)
        .max()
        .unwrap_or(0)
        .max(CASING_SLOTS);
    let network = VirtualCanNetwork::new();
    let gpio = Arc::new(MockGpio::new(capacity, WIDGET_SLOTS));
    let simulator = Simulator::from_config(&config.simulation, &network, Arc::clone(&gpio))
        .context("building simulated casing")?;

    let registry = Registry::new();
    let metrics = BusMetrics::register(&registry)?;
    let bus = BombBus::with_metrics(Arc::new(network.endpoint()), &config.bus, metrics);
    bus.start()?;
    let bomb = Bomb::new(bus.clone(), gpio, config.bomb.clone())?;
    info!(
        serial = %bomb.serial_number(),
        modules = simulator.modules().len(),
        "simulated bomb ready"
    );
    let logger = tokio::spawn(log_events(bomb.subscribe()));

    let outcome = tokio::select! {
        result = run_game(&bomb, play) => result,
        signal = signal::ctrl_c() => match signal {
            Ok(()) => {
                info!("ctrl-c received; shutting down");
                Ok(bomb.state().await)
            }
            Err(err) => Err(err).context("waiting for ctrl-c"),
        },
    };

    if let Err(err) = bomb.deinitialize().await {
        warn!(error = %err, "bomb shutdown failed");
    }
    bus.stop();
    logger.abort();
    drop(simulator);

    if print_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&registry.gather(), &mut buffer)?;
        print!("{}", String::from_utf8(buffer)?);
    }

    let state = outcome?;
    info!(%state, "simulation finished");
    Ok(())
}

async fn run_game(bomb: &Bomb, play: bool) -> Result<BombState> {
    let state = bomb.initialize().await?;
    if state != BombState::Initialized {
        warn!(%state, "initialization did not succeed");
        return Ok(state);
    }
    if !play {
        return Ok(state);
    }
    bomb.start_game().await?;
    let limit = bomb.config().game_start_delay + bomb.config().game_duration + GAME_GRACE;
    match bomb.wait_for_state(limit, BombState::is_game_over).await {
        Some(state) => Ok(state),
        None => {
            warn!("game did not finish in time");
            Ok(bomb.state().await)
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<BombEvent>) {
    loop {
        match events.recv().await {
            Ok(BombEvent::Error(error)) => warn!(%error, "bomb error"),
            Ok(BombEvent::TimerTick { seconds }) => debug!(seconds, "timer"),
            Ok(event) => match serde_json::to_string(&event) {
                Ok(json) => info!(event = %json, "bomb event"),
                Err(err) => warn!(error = %err, "unserializable bomb event"),
            },
            Err(RecvError::Lagged(skipped)) => warn!(skipped, "event log fell behind"),
            Err(RecvError::Closed) => break,
        }
    }
}
