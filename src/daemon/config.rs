//! Configuration loading from `config.toml`
//!
//! One file serves both the daemon and its clients:
//! - top-level `socket_path`: control socket (default `~/.irgauge/daemon.sock`)
//! - `[daemon]`: PWM pin, carrier frequency, repeat count, tick timing, emitter
//! - `[client]`: gauge address, reconnect delay, calibration table
//! - `[commands]`: command table overrides (`Name = number`)
//!
//! Every field has a default, so an empty or missing file is valid.
//! `IRGAUGE_CONFIG` points at an alternate file and `IRGAUGE_SOCKET`
//! overrides the socket path.

use crate::calibration::CalibrationTable;
use crate::commands::CommandTable;
use crate::error::ConfigurationError;
use crate::packet::MAX_COMMAND;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PWM_PIN: u8 = 18;
pub const DEFAULT_MODULATION_FREQUENCY: u32 = 33_000;
pub const DEFAULT_REPEATS: u32 = 14;
pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 30;
pub const DEFAULT_STAGGER_MILLIS: u64 = 1_000;
pub const DEFAULT_RECONNECT_DELAY_SECS: u64 = 15;
pub const DEFAULT_ADDRESS: u8 = 1;

pub const CONFIG_ENV: &str = "IRGAUGE_CONFIG";
pub const SOCKET_ENV: &str = "IRGAUGE_SOCKET";

/// Which hardware backend the daemon drives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransmitterKind {
    /// Log frames only
    #[default]
    Log,
    /// Run `transmit_program <packet> <pin> <frequency>`
    Command,
}

/// `[daemon]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// BCM pin wired to the IR LED
    pub pwm_pin: u8,
    /// Carrier frequency in Hz
    pub modulation_frequency: u32,
    /// Repeat count for `addCmd` messages without `txCount`
    pub default_repeats: u32,
    /// Seconds between scheduler ticks
    pub tick_interval_secs: u64,
    /// Spacing between frames within one tick
    pub stagger_millis: u64,
    pub transmitter: TransmitterKind,
    pub transmit_program: PathBuf,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            pwm_pin: DEFAULT_PWM_PIN,
            modulation_frequency: DEFAULT_MODULATION_FREQUENCY,
            default_repeats: DEFAULT_REPEATS,
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            stagger_millis: DEFAULT_STAGGER_MILLIS,
            transmitter: TransmitterKind::Log,
            transmit_program: PathBuf::from("./C/irTx"),
        }
    }
}

impl DaemonSettings {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn stagger(&self) -> Duration {
        Duration::from_millis(self.stagger_millis)
    }
}

/// `[client]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Gauge address (170 = broadcast)
    pub address: u8,
    pub reconnect_delay_secs: u64,
    /// `txCount` sent with each queued command
    pub repeats: u32,
    pub calibration: CalibrationTable,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS,
            reconnect_delay_secs: DEFAULT_RECONNECT_DELAY_SECS,
            repeats: DEFAULT_REPEATS,
            calibration: CalibrationTable::default(),
        }
    }
}

impl ClientSettings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }
}

/// Complete configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: Option<PathBuf>,
    pub daemon: DaemonSettings,
    pub client: ClientSettings,
    pub commands: BTreeMap<String, u8>,
}

impl Config {
    /// Parse configuration from TOML content
    pub fn parse(content: &str) -> Result<Self, ConfigurationError> {
        let config: Config =
            toml::from_str(content).map_err(|e| ConfigurationError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigurationError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigurationError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Load from an explicit path, `$IRGAUGE_CONFIG`, or `~/.irgauge/config.toml`
    ///
    /// Only the implicit default location may be missing; an explicitly named
    /// file that does not exist is an error.
    pub fn locate(explicit: Option<&Path>) -> Result<Self, ConfigurationError> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Self::load(Path::new(&path));
        }
        let path = Self::default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// `~/.irgauge/config.toml`
    pub fn default_config_path() -> PathBuf {
        state_dir().join("config.toml")
    }

    /// Semantic checks serde cannot express
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.daemon.modulation_frequency == 0 {
            return Err(ConfigurationError::Invalid(
                "modulation_frequency must be greater than 0".to_string(),
            ));
        }
        if self.daemon.tick_interval_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "tick_interval_secs must be greater than 0".to_string(),
            ));
        }
        for (name, code) in &self.commands {
            if i64::from(*code) > MAX_COMMAND {
                return Err(ConfigurationError::Invalid(format!(
                    "command {} = {} does not fit in 4 bits",
                    name, code
                )));
            }
        }
        Ok(())
    }

    /// Command table with this config's overrides applied
    pub fn command_table(&self) -> CommandTable {
        CommandTable::with_overrides(&self.commands)
    }

    /// Control socket: `$IRGAUGE_SOCKET`, then `socket_path`, then the default
    pub fn resolve_socket_path(&self) -> Result<PathBuf, ConfigurationError> {
        self.resolve_socket_path_with(std::env::var(SOCKET_ENV).ok())
    }

    fn resolve_socket_path_with(
        &self,
        env_override: Option<String>,
    ) -> Result<PathBuf, ConfigurationError> {
        if let Some(path) = env_override.filter(|p| !p.is_empty()) {
            return Ok(PathBuf::from(path));
        }
        if let Some(ref path) = self.socket_path {
            return Ok(path.clone());
        }
        default_socket_path()
    }
}

fn state_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".irgauge")
}

/// Create `~/.irgauge` (mode 0700) and return the socket path inside it
pub fn default_socket_path() -> Result<PathBuf, ConfigurationError> {
    let dir = state_dir();
    if !dir.exists() {
        fs::create_dir_all(&dir).map_err(|source| ConfigurationError::Read {
            path: dir.clone(),
            source,
        })?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&dir, fs::Permissions::from_mode(0o700));
        }
    }
    Ok(dir.join("daemon.sock"))
}
