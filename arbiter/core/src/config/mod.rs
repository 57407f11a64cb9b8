//! TOML Configuration File Support
//!
//! Centralized configuration loading for the arbiter, supporting a TOML
//! configuration file at `~/.config/turret-arbiter/arbiter.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! Everything is fixed once the daemon starts.
//!
//! # Example Configuration
//!
//! ```toml
//! [device]
//! address = "/dev/cu.usbmodem1411"
//! left = "A"
//! right = "B"
//! aux = "C"
//!
//! [turns]
//! rotation_interval_secs = 30
//! ammo_per_turn = 1
//! max_display_name_len = 32
//! unique_origins = true
//!
//! [motion]
//! calibration_factor = 5.40
//! dance_period_ms = 500
//!
//! [server]
//! listen_addr = "0.0.0.0:3000"
//! connection_channel_capacity = 64
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::executor::DEFAULT_DANCE_PERIOD;
use crate::motion::{MotorConfig, Port, DEFAULT_CALIBRATION_FACTOR};
use crate::scheduler::DEFAULT_AMMO_PER_TURN;
use crate::session::DEFAULT_MAX_NAME_LEN;

/// Serial device the brick enumerates as on macOS
pub const DEFAULT_DEVICE_ADDRESS: &str = "/dev/cu.usbmodem1411";

/// Default rotation interval
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(30);

/// Default listen port
pub const DEFAULT_PORT: u16 = 3000;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Device section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceToml {
    /// Serial device or address of the brick
    pub address: Option<String>,

    /// Port driving the left wheel
    pub left: Option<Port>,

    /// Port driving the right wheel
    pub right: Option<Port>,

    /// Port driving the shooter
    pub aux: Option<Port>,

    /// Set to false on builds without a shooter
    pub aux_enabled: Option<bool>,
}

/// Turn section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnsToml {
    /// Seconds each holder keeps the turn
    pub rotation_interval_secs: Option<u64>,

    /// Shots granted per turn
    pub ammo_per_turn: Option<u32>,

    /// Longest accepted display name
    pub max_display_name_len: Option<usize>,

    /// Refuse a second session from the same address
    pub unique_origins: Option<bool>,
}

/// Motion section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionToml {
    /// Native units per degree of body rotation
    pub calibration_factor: Option<f64>,

    /// Milliseconds between dance steps
    pub dance_period_ms: Option<u64>,
}

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address the WebSocket listener binds to
    pub listen_addr: Option<String>,

    /// Outbound events buffered per connection
    pub connection_channel_capacity: Option<usize>,

    /// Commands buffered ahead of the arbiter task
    pub command_capacity: Option<usize>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterToml {
    /// Device section
    pub device: DeviceToml,

    /// Turn section
    pub turns: TurnsToml,

    /// Motion section
    pub motion: MotionToml,

    /// Server section
    pub server: ServerToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Startup configuration for the arbiter and its daemon
#[derive(Clone, Debug)]
pub struct ArbiterConfig {
    /// Device address handed to the motor driver
    pub device_address: String,

    /// Channel-to-port mapping
    pub motors: MotorConfig,

    /// Length of one turn
    pub rotation_interval: Duration,

    /// Shots granted per turn
    pub ammo_per_turn: u32,

    /// Native units per degree of body rotation
    pub calibration_factor: f64,

    /// Spacing between dance steps
    pub dance_period: Duration,

    /// WebSocket listen address
    pub listen_addr: SocketAddr,

    /// Outbound events buffered per connection
    pub connection_channel_capacity: usize,

    /// Commands buffered ahead of the arbiter task
    pub command_capacity: usize,

    /// Longest accepted display name
    pub max_display_name_len: usize,

    /// Refuse a second session from the same address
    pub enforce_unique_origin: bool,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ArbiterConfig {
    fn default() -> Self {
        Self {
            device_address: DEFAULT_DEVICE_ADDRESS.to_string(),
            motors: MotorConfig::default(),
            rotation_interval: DEFAULT_ROTATION_INTERVAL,
            ammo_per_turn: DEFAULT_AMMO_PER_TURN,
            calibration_factor: DEFAULT_CALIBRATION_FACTOR,
            dance_period: DEFAULT_DANCE_PERIOD,
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            connection_channel_capacity: 64,
            command_capacity: 256,
            max_display_name_len: DEFAULT_MAX_NAME_LEN,
            enforce_unique_origin: true,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ArbiterConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check the combined configuration
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] for duplicate ports, a zero
    /// interval or capacity, or a non-positive calibration factor.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.motors
            .validate()
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        if self.rotation_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "rotation interval must be greater than zero".into(),
            ));
        }
        if self.dance_period.is_zero() {
            return Err(ConfigError::ValidationError(
                "dance period must be greater than zero".into(),
            ));
        }
        if !self.calibration_factor.is_finite() || self.calibration_factor <= 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "calibration factor {} must be a positive number",
                self.calibration_factor
            )));
        }
        if self.connection_channel_capacity == 0 || self.command_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "channel capacities must be greater than zero".into(),
            ));
        }
        if self.max_display_name_len == 0 {
            return Err(ConfigError::ValidationError(
                "max display name length must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/turret-arbiter/arbiter.toml` or
/// `~/.config/turret-arbiter/arbiter.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("turret-arbiter").join("arbiter.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed.
/// A missing config file is not an error (defaults are used).
pub fn load_config() -> Result<ArbiterConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// CLI overrides are not applied here; see [`ConfigOverrides`].
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or an environment variable holds an unusable value.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ArbiterConfig, ConfigError> {
    let mut config = ArbiterConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ArbiterToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_from(&mut config, |key| std::env::var(key).ok())?;

    Ok(config)
}

fn apply_toml_config(config: &mut ArbiterConfig, toml: &ArbiterToml) -> Result<(), ConfigError> {
    // Device settings
    if let Some(ref address) = toml.device.address {
        config.device_address = address.clone();
    }
    if let Some(port) = toml.device.left {
        config.motors.left = port;
    }
    if let Some(port) = toml.device.right {
        config.motors.right = port;
    }
    if let Some(port) = toml.device.aux {
        config.motors.aux = Some(port);
    }
    if toml.device.aux_enabled == Some(false) {
        config.motors.aux = None;
    }

    // Turn settings
    if let Some(secs) = toml.turns.rotation_interval_secs {
        config.rotation_interval = Duration::from_secs(secs);
    }
    if let Some(ammo) = toml.turns.ammo_per_turn {
        config.ammo_per_turn = ammo;
    }
    if let Some(len) = toml.turns.max_display_name_len {
        config.max_display_name_len = len;
    }
    if let Some(unique) = toml.turns.unique_origins {
        config.enforce_unique_origin = unique;
    }

    // Motion settings
    if let Some(factor) = toml.motion.calibration_factor {
        config.calibration_factor = factor;
    }
    if let Some(ms) = toml.motion.dance_period_ms {
        config.dance_period = Duration::from_millis(ms);
    }

    // Server settings
    if let Some(ref addr) = toml.server.listen_addr {
        config.listen_addr = parse_listen_addr(addr)?;
    }
    if let Some(capacity) = toml.server.connection_channel_capacity {
        config.connection_channel_capacity = capacity;
    }
    if let Some(capacity) = toml.server.command_capacity {
        config.command_capacity = capacity;
    }
    Ok(())
}

/// Apply environment overrides read through `lookup`
///
/// `ARBITER_*` variables win over the legacy `NXT_DEVICE` and `PORT`.
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] for a value that cannot be parsed.
pub fn apply_env_from<F>(config: &mut ArbiterConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
        raw.trim()
            .parse()
            .map_err(|_| ConfigError::ValidationError(format!("{key}={raw} is not valid")))
    }

    // Device settings from environment
    for key in ["NXT_DEVICE", "ARBITER_DEVICE"] {
        if let Some(address) = lookup(key) {
            config.device_address = address;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(raw) = lookup("ARBITER_LEFT_PORT") {
        config.motors.left = parsed("ARBITER_LEFT_PORT", &raw)?;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_RIGHT_PORT") {
        config.motors.right = parsed("ARBITER_RIGHT_PORT", &raw)?;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_AUX_PORT") {
        config.motors.aux = if raw.trim().eq_ignore_ascii_case("none") {
            None
        } else {
            Some(parsed("ARBITER_AUX_PORT", &raw)?)
        };
        config.source = ConfigSource::Env;
    }

    // Turn settings from environment
    if let Some(raw) = lookup("ARBITER_ROTATION_SECS") {
        config.rotation_interval = Duration::from_secs(parsed("ARBITER_ROTATION_SECS", &raw)?);
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_AMMO_PER_TURN") {
        config.ammo_per_turn = parsed("ARBITER_AMMO_PER_TURN", &raw)?;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_UNIQUE_ORIGINS") {
        config.enforce_unique_origin = raw != "0" && !raw.eq_ignore_ascii_case("false");
        config.source = ConfigSource::Env;
    }

    // Motion settings from environment
    if let Some(raw) = lookup("ARBITER_CALIBRATION") {
        config.calibration_factor = parsed("ARBITER_CALIBRATION", &raw)?;
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_DANCE_PERIOD_MS") {
        config.dance_period = Duration::from_millis(parsed("ARBITER_DANCE_PERIOD_MS", &raw)?);
        config.source = ConfigSource::Env;
    }

    // Server settings from environment
    if let Some(raw) = lookup("PORT") {
        let port: u16 = parsed("PORT", &raw)?;
        config.listen_addr.set_port(port);
        config.source = ConfigSource::Env;
    }
    if let Some(raw) = lookup("ARBITER_LISTEN") {
        config.listen_addr = parse_listen_addr(&raw)?;
        config.source = ConfigSource::Env;
    }
    Ok(())
}

fn parse_listen_addr(raw: &str) -> Result<SocketAddr, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("listen address '{raw}' is not valid")))
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen_addr: Option<SocketAddr>,

    /// Device address override
    pub device_address: Option<String>,

    /// Rotation interval override (seconds)
    pub rotation_interval_secs: Option<u64>,

    /// Allow several sessions per origin
    pub allow_shared_origin: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set device address override
    #[must_use]
    pub fn with_device_address(mut self, address: String) -> Self {
        self.device_address = Some(address);
        self
    }

    /// Set rotation interval override
    #[must_use]
    pub fn with_rotation_interval_secs(mut self, secs: u64) -> Self {
        self.rotation_interval_secs = Some(secs);
        self
    }

    /// Set shared-origin override
    #[must_use]
    pub fn with_allow_shared_origin(mut self, allow: bool) -> Self {
        self.allow_shared_origin = Some(allow);
        self
    }

    /// Apply overrides to a configuration
    pub fn apply(&self, config: &mut ArbiterConfig) {
        if self.listen_addr.is_some()
            || self.device_address.is_some()
            || self.rotation_interval_secs.is_some()
            || self.allow_shared_origin.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(ref address) = self.device_address {
            config.device_address = address.clone();
        }
        if let Some(secs) = self.rotation_interval_secs {
            config.rotation_interval = Duration::from_secs(secs);
        }
        if let Some(allow) = self.allow_shared_origin {
            config.enforce_unique_origin = !allow;
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ArbiterConfig::default();

        assert_eq!(config.device_address, "/dev/cu.usbmodem1411");
        assert_eq!(config.motors, MotorConfig::default());
        assert_eq!(config.rotation_interval, Duration::from_secs(30));
        assert_eq!(config.ammo_per_turn, 1);
        assert!((config.calibration_factor - 5.40).abs() < f64::EPSILON);
        assert_eq!(config.dance_period, Duration::from_millis(500));
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.source(), ConfigSource::Default);
        config.validate().unwrap();
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[device]
address = "/dev/ttyACM0"
left = "B"
right = "A"
aux_enabled = false

[turns]
rotation_interval_secs = 10
ammo_per_turn = 3

[motion]
calibration_factor = 4.5

[server]
listen_addr = "127.0.0.1:8080"
"#
        )
        .unwrap();

        let mut config = ArbiterConfig::default();
        let toml: ArbiterToml =
            toml::from_str(&std::fs::read_to_string(file.path()).unwrap()).unwrap();
        apply_toml_config(&mut config, &toml).unwrap();

        assert_eq!(config.device_address, "/dev/ttyACM0");
        assert_eq!(config.motors.left, Port::B);
        assert_eq!(config.motors.right, Port::A);
        assert_eq!(config.motors.aux, None);
        assert_eq!(config.rotation_interval, Duration::from_secs(10));
        assert_eq!(config.ammo_per_turn, 3);
        assert!((config.calibration_factor - 4.5).abs() < f64::EPSILON);
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse::<SocketAddr>().unwrap());
        // untouched sections keep defaults
        assert_eq!(config.dance_period, Duration::from_millis(500));
    }

    #[test]
    fn test_load_config_from_path_records_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[turns]\nammo_per_turn = 2").unwrap();

        let config = load_config_from_path(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.ammo_per_turn, 2);
        assert_eq!(config.config_file_path.as_deref(), Some(file.path()));
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_config_from_path(Some(dir.path().join("absent.toml"))).unwrap();
        assert!(config.config_file_path.is_none());
        assert_eq!(config.ammo_per_turn, 1);
    }

    #[test]
    fn test_invalid_toml_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[turns\nammo_per_turn = ").unwrap();
        assert!(matches!(
            load_config_from_path(Some(file.path().to_path_buf())),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ArbiterConfig::default();
        apply_env_from(
            &mut config,
            env(&[
                ("NXT_DEVICE", "/dev/legacy"),
                ("PORT", "4000"),
                ("ARBITER_ROTATION_SECS", "5"),
                ("ARBITER_AUX_PORT", "none"),
                ("ARBITER_UNIQUE_ORIGINS", "false"),
            ]),
        )
        .unwrap();

        assert_eq!(config.device_address, "/dev/legacy");
        assert_eq!(config.listen_addr.port(), 4000);
        assert_eq!(config.rotation_interval, Duration::from_secs(5));
        assert_eq!(config.motors.aux, None);
        assert!(!config.enforce_unique_origin);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_arbiter_env_wins_over_legacy() {
        let mut config = ArbiterConfig::default();
        apply_env_from(
            &mut config,
            env(&[("NXT_DEVICE", "/dev/legacy"), ("ARBITER_DEVICE", "/dev/new")]),
        )
        .unwrap();
        assert_eq!(config.device_address, "/dev/new");
    }

    #[test]
    fn test_bad_env_value_rejected() {
        let mut config = ArbiterConfig::default();
        let result = apply_env_from(&mut config, env(&[("ARBITER_LEFT_PORT", "Z")]));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_cli_overrides_win() {
        let mut config = ArbiterConfig::default();
        apply_env_from(&mut config, env(&[("ARBITER_ROTATION_SECS", "5")])).unwrap();

        ConfigOverrides::new()
            .with_rotation_interval_secs(60)
            .with_allow_shared_origin(true)
            .apply(&mut config);

        assert_eq!(config.rotation_interval, Duration::from_secs(60));
        assert!(!config.enforce_unique_origin);
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_empty_overrides_keep_source() {
        let mut config = ArbiterConfig::default();
        ConfigOverrides::new().apply(&mut config);
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = ArbiterConfig::default();
        config.motors.right = Port::A;
        assert!(matches!(config.validate(), Err(ConfigError::ValidationError(_))));

        let mut config = ArbiterConfig::default();
        config.rotation_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = ArbiterConfig::default();
        config.calibration_factor = 0.0;
        assert!(config.validate().is_err());
    }
}
