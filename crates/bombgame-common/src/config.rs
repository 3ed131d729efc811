//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Controller configuration model, discovery and validation."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use indexmap::IndexSet;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationMilliSeconds, DurationSeconds};
use tracing::debug;

use crate::logging::LogFormat;

fn default_reset_period() -> Duration {
    Duration::from_millis(600)
}

fn default_announce_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_ping_interval() -> Duration {
    Duration::from_millis(1000)
}

fn default_ping_timeout() -> Duration {
    Duration::from_millis(1000)
}

fn default_ping_poll_period() -> Duration {
    Duration::from_millis(100)
}

fn default_game_start_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_game_duration() -> Duration {
    Duration::from_secs(300)
}

fn default_max_strikes() -> u32 {
    3
}

fn default_strike_speedup() -> f64 {
    0.25
}

fn default_strike_ramp_limit() -> u32 {
    4
}

fn default_error_max_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_error_max_count() -> u32 {
    10
}

fn default_recv_poll() -> Duration {
    Duration::from_millis(100)
}

fn default_logging_directory() -> PathBuf {
    PathBuf::from("target/logs")
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}

fn default_init_complete() -> bool {
    true
}

/// Primary configuration object for the bomb controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerConfig {
    #[serde(default)]
    pub bomb: BombConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Metadata describing where a [`ControllerConfig`] was loaded from.
#[derive(Debug, Clone)]
pub struct LoadedControllerConfig {
    pub config: ControllerConfig,
    pub source: Option<PathBuf>,
}

impl ControllerConfig {
    pub const ENV_CONFIG_PATH: &'static str = "BOMBGAME_CONFIG";

    /// Load configuration from disk, respecting the `BOMBGAME_CONFIG` override.
    ///
    /// Falls back to built-in defaults when none of the candidates exist.
    pub fn load_with_source<P: AsRef<Path>>(candidates: &[P]) -> Result<LoadedControllerConfig> {
        if let Ok(env_path) = std::env::var(Self::ENV_CONFIG_PATH) {
            if !env_path.trim().is_empty() {
                let path = PathBuf::from(env_path);
                let config = Self::from_path(&path)?;
                return Ok(LoadedControllerConfig {
                    config,
                    source: Some(path),
                });
            }
        }

        for candidate in candidates {
            let path = candidate.as_ref();
            if path.exists() {
                let config = Self::from_path(path)?;
                return Ok(LoadedControllerConfig {
                    config,
                    source: Some(path.to_path_buf()),
                });
            }
        }

        debug!("no configuration file found; using defaults");
        Ok(LoadedControllerConfig {
            config: Self::default(),
            source: None,
        })
    }

    fn from_path(path: &Path) -> Result<Self> {
        debug!(config_path = %path.display(), "loading configuration");
        let contents = fs::read_to_string(path)
            .with_context(|| format!("unable to read config file {}", path.display()))?;
        contents
            .parse::<ControllerConfig>()
            .with_context(|| format!("failed to load config file {}", path.display()))
    }

    /// Validate structural invariants.
    pub fn validate(&self) -> Result<()> {
        self.bomb.validate()?;
        self.bus.validate()?;
        self.simulation.validate()?;
        Ok(())
    }
}

impl std::str::FromStr for ControllerConfig {
    type Err = anyhow::Error;

    fn from_str(content: &str) -> std::result::Result<Self, Self::Err> {
        let config: ControllerConfig =
            toml::from_str(content).with_context(|| "failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }
}

/// Timing and rule parameters of a single bomb.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BombConfig {
    /// Settle time between broadcasting `Reset` and polling the ready lines.
    #[serde(default = "default_reset_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub reset_period: Duration,
    /// How long an enabled slot may take to announce itself.
    #[serde(default = "default_announce_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub announce_timeout: Duration,
    /// Silence after which a module is pinged.
    #[serde(default = "default_ping_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_interval: Duration,
    /// How long a ping may stay unanswered.
    #[serde(default = "default_ping_timeout")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_timeout: Duration,
    #[serde(default = "default_ping_poll_period")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub ping_poll_period: Duration,
    /// Pre-game wait between `LaunchGame` and `StartTimer`.
    #[serde(default = "default_game_start_delay")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub game_start_delay: Duration,
    #[serde(default = "default_game_duration")]
    #[serde_as(as = "DurationSeconds<u64>")]
    pub game_duration: Duration,
    #[serde(default = "default_max_strikes")]
    pub max_strikes: u32,
    /// Additive timer speed increase applied per strike inside the ramp window.
    #[serde(default = "default_strike_speedup")]
    pub strike_speedup: f64,
    /// Strikes up to and including this count speed the timer up.
    #[serde(default = "default_strike_ramp_limit")]
    pub strike_ramp_limit: u32,
    #[serde(default)]
    pub serial_number: Option<String>,
}

impl Default for BombConfig {
    fn default() -> Self {
        Self {
            reset_period: default_reset_period(),
            announce_timeout: default_announce_timeout(),
            ping_interval: default_ping_interval(),
            ping_timeout: default_ping_timeout(),
            ping_poll_period: default_ping_poll_period(),
            game_start_delay: default_game_start_delay(),
            game_duration: default_game_duration(),
            max_strikes: default_max_strikes(),
            strike_speedup: default_strike_speedup(),
            strike_ramp_limit: default_strike_ramp_limit(),
            serial_number: None,
        }
    }
}

impl BombConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_strikes == 0 {
            return Err(anyhow!("bomb.max_strikes must be at least 1"));
        }
        if self.announce_timeout.is_zero() {
            return Err(anyhow!("bomb.announce_timeout must be positive"));
        }
        if self.ping_poll_period.is_zero() {
            return Err(anyhow!("bomb.ping_poll_period must be positive"));
        }
        if self.game_duration.is_zero() {
            return Err(anyhow!("bomb.game_duration must be positive"));
        }
        if !self.strike_speedup.is_finite() || self.strike_speedup < 0.0 {
            return Err(anyhow!("bomb.strike_speedup must be a non-negative number"));
        }
        if let Some(serial) = &self.serial_number {
            if !serial_pattern_matches(serial.trim()) {
                return Err(anyhow!(
                    "bomb.serial_number must match [A-Z0-9]{{2}}[0-9][A-Z]{{2}}[0-9] without O or Y, got '{}'",
                    serial
                ));
            }
        }
        Ok(())
    }
}

/// Serial layout printed on the casing: two letters or digits, a digit, two
/// letters, a digit. `O` and `Y` are never used.
fn serial_pattern_matches(serial: &str) -> bool {
    let letter = |c: char| c.is_ascii_alphabetic() && !matches!(c.to_ascii_uppercase(), 'O' | 'Y');
    let digit = |c: char| c.is_ascii_digit();
    let chars: Vec<char> = serial.chars().collect();
    chars.len() == 6
        && chars[..2].iter().all(|&c| letter(c) || digit(c))
        && digit(chars[2])
        && chars[3..5].iter().all(|&c| letter(c))
        && digit(chars[5])
}

/// Transport error escalation parameters.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Window after which the error counter starts over.
    #[serde(default = "default_error_max_interval")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub error_max_interval: Duration,
    /// Errors inside one window that escalate to a fatal condition.
    #[serde(default = "default_error_max_count")]
    pub error_max_count: u32,
    /// Blocking receive timeout of the receiver thread.
    #[serde(default = "default_recv_poll")]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub recv_poll: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            error_max_interval: default_error_max_interval(),
            error_max_count: default_error_max_count(),
            recv_poll: default_recv_poll(),
        }
    }
}

impl BusConfig {
    pub fn validate(&self) -> Result<()> {
        if self.error_max_count == 0 {
            return Err(anyhow!("bus.error_max_count must be at least 1"));
        }
        if self.recv_poll.is_zero() {
            return Err(anyhow!("bus.recv_poll must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_directory")]
    pub directory: PathBuf,
    #[serde(default = "default_log_format")]
    pub format: LogFormat,
    #[serde(default)]
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_logging_directory(),
            format: default_log_format(),
            file_prefix: None,
        }
    }
}

/// One virtual module plugged into the simulated casing.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatedSlot {
    /// Casing slot the module is plugged into.
    pub location: usize,
    /// Module kind name, e.g. `timer` or `wires`.
    pub kind: String,
    #[serde(default)]
    pub serial: u16,
    #[serde(default = "default_init_complete")]
    pub init_complete: bool,
    /// Delay before a module that announced incomplete sends `InitComplete`.
    #[serde(default)]
    #[serde_as(as = "DurationMilliSeconds<u64>")]
    pub init_delay: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationConfig {
    #[serde(default = "SimulationConfig::default_slots")]
    pub slots: Vec<SimulatedSlot>,
    /// Solve every must-solve module this many seconds after the timer starts.
    #[serde(default)]
    pub auto_solve_after: Option<u64>,
}

impl SimulationConfig {
    fn default_slots() -> Vec<SimulatedSlot> {
        vec![
            SimulatedSlot {
                location: 0,
                kind: "timer".to_owned(),
                serial: 1,
                init_complete: true,
                init_delay: Duration::ZERO,
            },
            SimulatedSlot {
                location: 2,
                kind: "wires".to_owned(),
                serial: 7,
                init_complete: false,
                init_delay: Duration::from_millis(50),
            },
        ]
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = IndexSet::new();
        for slot in &self.slots {
            if slot.kind.trim().is_empty() {
                return Err(anyhow!(
                    "simulation slot {} must name a module kind",
                    slot.location
                ));
            }
            if !seen.insert(slot.location) {
                return Err(anyhow!(
                    "simulation slot {} is declared more than once",
                    slot.location
                ));
            }
        }
        Ok(())
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            slots: Self::default_slots(),
            auto_solve_after: Some(10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_hardware_constants() {
        let config = ControllerConfig::default();
        assert_eq!(config.bomb.reset_period, Duration::from_millis(600));
        assert_eq!(config.bomb.announce_timeout, Duration::from_secs(1));
        assert_eq!(config.bomb.game_start_delay, Duration::from_secs(5));
        assert_eq!(config.bomb.max_strikes, 3);
        assert_eq!(config.bus.error_max_interval, Duration::from_secs(15));
        assert_eq!(config.bus.error_max_count, 10);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn parses_partial_toml_with_millisecond_durations() {
        let config: ControllerConfig = r#"
            [bomb]
            announce_timeout = 250
            max_strikes = 5
            game_duration = 120

            [bus]
            error_max_count = 4

            [[simulation.slots]]
            location = 3
            kind = "keypad"
            serial = 9
        "#
        .parse()
        .expect("config parses");

        assert_eq!(config.bomb.announce_timeout, Duration::from_millis(250));
        assert_eq!(config.bomb.max_strikes, 5);
        assert_eq!(config.bomb.game_duration, Duration::from_secs(120));
        assert_eq!(config.bomb.ping_interval, Duration::from_secs(1));
        assert_eq!(config.bus.error_max_count, 4);
        assert_eq!(config.simulation.slots.len(), 1);
        let slot = &config.simulation.slots[0];
        assert_eq!(slot.location, 3);
        assert_eq!(slot.kind, "keypad");
        assert!(slot.init_complete);
    }

    #[test]
    fn rejects_zero_strikes() {
        let err = "[bomb]\nmax_strikes = 0\n"
            .parse::<ControllerConfig>()
            .expect_err("zero strikes rejected");
        assert!(err.to_string().contains("max_strikes"));
    }

    #[test]
    fn rejects_duplicate_simulation_slots() {
        let err = r#"
            [[simulation.slots]]
            location = 1
            kind = "timer"

            [[simulation.slots]]
            location = 1
            kind = "wires"
        "#
        .parse::<ControllerConfig>()
        .expect_err("duplicate slot rejected");
        assert!(format!("{:#}", err).contains("more than once"));
    }

    #[test]
    fn rejects_malformed_serial_number() {
        let mut config = BombConfig::default();
        config.serial_number = Some("AB-12".into());
        assert!(config.validate().is_err());
        config.serial_number = Some("123456".into());
        assert!(config.validate().is_err());
        config.serial_number = Some("AB3OD4".into());
        assert!(config.validate().is_err());
        config.serial_number = Some("AB3CD4".into());
        assert!(config.validate().is_ok());
    }
}
