//! Configuration loading using Figment.
//!
//! Configuration is loaded from:
//! 1. `config/energy_meter.toml` (base configuration)
//! 2. Environment variables prefixed with `ENERGY_METER_`, nested keys
//!    separated by a double underscore
//!
//! ```toml
//! [application]
//! log_level = "info"
//!
//! [meter]
//! port = "/dev/ttyUSB0"
//! baud_rate = 115200
//! timeout = "500ms"
//! retry_limit = 2
//! settle_delay = "100ms"
//! default_range = "30nJ"
//! ```
//!
//! Example override: `ENERGY_METER_METER__RETRY_LIMIT=5`

use crate::driver::DEFAULT_RETRY_LIMIT;
use crate::error::{MeterError, MeterResult};
use crate::protocol::{Range, SETTLE_DELAY};
use crate::session::{SessionConfig, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "config/energy_meter.toml";
pub const ENV_PREFIX: &str = "ENERGY_METER_";

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub application: ApplicationConfig,
    pub meter: MeterConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Energy meter connection and protocol settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeterConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM3")
    pub port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Attempts per energy read
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// Wait between commands
    #[serde(default = "default_settle_delay", with = "humantime_serde")]
    pub settle_delay: Duration,
    /// Range selected right after connecting
    #[serde(default)]
    pub default_range: Option<String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_baud_rate() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

fn default_retry_limit() -> u32 {
    DEFAULT_RETRY_LIMIT
}

fn default_settle_delay() -> Duration {
    SETTLE_DELAY
}

impl MeterConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig::new(self.port.clone(), self.baud_rate).with_timeout(self.timeout)
    }

    /// Parsed `default_range`, if set.
    pub fn default_range(&self) -> MeterResult<Option<Range>> {
        self.default_range
            .as_deref()
            .map(|name| {
                name.parse::<Range>()
                    .map_err(|e| MeterError::Configuration(e.to_string()))
            })
            .transpose()
    }
}

impl Config {
    /// Load from the default path and environment.
    pub fn load() -> MeterResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load from a specific file path plus environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> MeterResult<Self> {
        Self::figment(path).extract().map_err(MeterError::from)
    }

    /// Layered provider: defaults, then TOML file, then environment.
    pub fn figment<P: AsRef<Path>>(path: P) -> Figment {
        Figment::new()
            .merge(Serialized::default("application", ApplicationConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> MeterResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(MeterError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        self.meter.session_config().validate()?;
        self.meter.default_range()?;

        if self.meter.settle_delay > Duration::from_secs(5) {
            return Err(MeterError::Configuration(format!(
                "settle_delay {:?} is implausibly long (max 5s)",
                self.meter.settle_delay
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    fn config(port: &str) -> Config {
        Config {
            application: ApplicationConfig::default(),
            meter: MeterConfig {
                port: port.to_string(),
                baud_rate: 115200,
                timeout: DEFAULT_TIMEOUT,
                retry_limit: 2,
                settle_delay: SETTLE_DELAY,
                default_range: None,
            },
        }
    }

    #[test]
    fn test_config_validation() {
        assert!(config("/dev/ttyUSB0").validate().is_ok());
        assert!(config("").validate().is_err());

        let mut bad_level = config("/dev/ttyUSB0");
        bad_level.application.log_level = "verbose".into();
        assert!(bad_level.validate().is_err());

        let mut bad_range = config("/dev/ttyUSB0");
        bad_range.meter.default_range = Some("1uJ".into());
        assert!(bad_range.validate().is_err());

        let mut good_range = config("/dev/ttyUSB0");
        good_range.meter.default_range = Some("3nJ".into());
        assert_eq!(good_range.meter.default_range().unwrap(), Some(Range::Nj3));
    }

    #[test]
    fn test_load_with_defaults_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "meter.toml",
                r#"
                [meter]
                port = "/dev/ttyUSB3"
                timeout = "1s"
                "#,
            )?;
            jail.set_env("ENERGY_METER_METER__RETRY_LIMIT", "5");

            let cfg = Config::load_from("meter.toml").map_err(|e| e.to_string())?;
            assert_eq!(cfg.application.log_level, "info");
            assert_eq!(cfg.meter.port, "/dev/ttyUSB3");
            assert_eq!(cfg.meter.baud_rate, 115200);
            assert_eq!(cfg.meter.timeout, Duration::from_secs(1));
            assert_eq!(cfg.meter.retry_limit, 5);
            assert_eq!(cfg.meter.settle_delay, SETTLE_DELAY);
            Ok(())
        });
    }

    #[test]
    fn test_missing_port_fails() {
        Jail::expect_with(|jail| {
            jail.create_file("meter.toml", "[application]\nlog_level = \"debug\"\n")?;
            assert!(Config::load_from("meter.toml").is_err());
            Ok(())
        });
    }
}
