use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "10.3.2.115";
pub const DEFAULT_PORT: u16 = 22;
pub const DEFAULT_USER: &str = "root";
pub const DEFAULT_PASSWORD: &str = "deltatau";
pub const DEFAULT_FAST_GATHER_PORT: u16 = 2332;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub session: SessionConfig,
    pub gather: GatherPaths,
    pub logging: LoggingConfig,
}

/// Where and how to reach the controller
///
/// Defaults are taken from `PPMAC_HOST`, `PPMAC_PORT`, `PPMAC_USER`,
/// `PPMAC_PASS` and `PPMAC_GATHER_PORT`.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub fast_gather_port: u16,
    /// Use the binary gather server when it is reachable
    pub fast_gather: bool,
    pub connect_timeout_secs: f64,
}

/// Timeouts and framing for interpreter sessions
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SessionConfig {
    /// Shell prompt and interpreter banner
    pub startup_timeout_secs: f64,
    /// Single variable read
    pub variable_timeout_secs: f64,
    /// Generic pattern waits and coordinate queries
    pub wait_timeout_secs: f64,
    /// Output drain after commands sent with sync
    pub sync_timeout_secs: f64,
    /// Program/gather status polling, never below 50 ms
    pub poll_interval_ms: u64,
    pub line_delimiter: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct GatherPaths {
    pub settings_file: String,
    pub output_file: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    pub log_level: String,
}

fn env_or(name: &str, fallback: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| fallback.to_string())
}

fn env_port_or(name: &str, fallback: u16) -> u16 {
    match std::env::var(name) {
        Ok(value) => value.trim().parse().unwrap_or_else(|_| {
            log::warn!("Ignoring invalid {name}={value:?}, using {fallback}");
            fallback
        }),
        Err(_) => fallback,
    }
}

impl ConnectionConfig {
    /// Defaults resolved from the `PPMAC_*` environment variables
    pub fn from_env() -> Self {
        let config = Self {
            host: env_or("PPMAC_HOST", DEFAULT_HOST),
            port: env_port_or("PPMAC_PORT", DEFAULT_PORT),
            username: env_or("PPMAC_USER", DEFAULT_USER),
            password: env_or("PPMAC_PASS", DEFAULT_PASSWORD),
            fast_gather_port: env_port_or("PPMAC_GATHER_PORT", DEFAULT_FAST_GATHER_PORT),
            fast_gather: true,
            connect_timeout_secs: 5.0,
        };
        log::debug!("Power PMAC default host: {}:{}", config.host, config.port);
        log::debug!("Power PMAC default login: {}", config.username);
        log::debug!(
            "Power PMAC default fast gather port: {}",
            config.fast_gather_port
        );
        config
    }

    pub fn connect_timeout(&self) -> Duration {
        secs_to_duration(self.connect_timeout_secs)
    }
}

impl SessionConfig {
    pub fn startup_timeout(&self) -> Duration {
        secs_to_duration(self.startup_timeout_secs)
    }

    pub fn variable_timeout(&self) -> Duration {
        secs_to_duration(self.variable_timeout_secs)
    }

    pub fn wait_timeout(&self) -> Duration {
        secs_to_duration(self.wait_timeout_secs)
    }

    pub fn sync_timeout(&self) -> Duration {
        secs_to_duration(self.sync_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(MIN_POLL_INTERVAL_MS))
    }
}

pub const MIN_POLL_INTERVAL_MS: u64 = 50;

/// Seconds to a `Duration`, saturating instead of panicking
///
/// Negative and NaN values give zero; anything too large gives `Duration::MAX`.
fn secs_to_duration(secs: f64) -> Duration {
    if secs.is_nan() || secs <= 0.0 {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

fn check_secs(field: &str, secs: f64) -> Result<(), ConfigError> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::Message(format!(
            "{field} must be a finite, non-negative number of seconds, got {secs}"
        )))
    }
}

impl AppConfig {
    /// Reject timeouts that cannot be turned into a `Duration`
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secs(
            "connection.connect_timeout_secs",
            self.connection.connect_timeout_secs,
        )?;
        check_secs(
            "session.startup_timeout_secs",
            self.session.startup_timeout_secs,
        )?;
        check_secs(
            "session.variable_timeout_secs",
            self.session.variable_timeout_secs,
        )?;
        check_secs("session.wait_timeout_secs", self.session.wait_timeout_secs)?;
        check_secs("session.sync_timeout_secs", self.session.sync_timeout_secs)?;
        Ok(())
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 5.0,
            variable_timeout_secs: 1.0,
            wait_timeout_secs: 5.0,
            sync_timeout_secs: 0.01,
            poll_interval_ms: MIN_POLL_INTERVAL_MS,
            line_delimiter: "\r\n".to_string(),
        }
    }
}

impl Default for GatherPaths {
    fn default() -> Self {
        Self {
            settings_file: crate::gather::GATHER_SETTINGS_FILE.to_string(),
            output_file: crate::gather::GATHER_OUTPUT_FILE.to_string(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Load configuration from file with layered fallbacks
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if path.exists() {
            builder = builder.add_source(File::from(path));
        } else {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
    } else {
        let possible_paths = ["rusty_pmac.toml", "config.toml"];

        for path in &possible_paths {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
                break;
            }
        }
    }

    // Environment overrides with prefix "RUSTY_PMAC", e.g. RUSTY_PMAC_SESSION__POLL_INTERVAL_MS
    builder = builder.add_source(
        Environment::with_prefix("RUSTY_PMAC")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true),
    );

    let config = builder.build()?.try_deserialize::<AppConfig>()?;
    config.validate()?;
    Ok(config)
}

/// Load configuration, logging and falling back to defaults on failure
pub fn load_config_or_default(config_path: Option<&Path>) -> AppConfig {
    match load_config(config_path) {
        Ok(config) => {
            log::info!("Configuration loaded successfully");
            config
        }
        Err(e) => {
            log::warn!("Failed to load config ({}), using defaults", e);
            AppConfig::default()
        }
    }
}
