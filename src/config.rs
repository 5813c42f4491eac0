use std::{path::Path, str::FromStr, time::Duration};

use log::LevelFilter;

use crate::process::Isolation;

/// Largest relay chunk accepted by [`BridgeConfig::validate`]
pub const MAX_CHUNK_SIZE: usize = 4096;
/// Workers must notice cancellation within this bound, so no poll interval may exceed it
pub const MAX_POLL_INTERVAL_MS: u64 = 200;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Could not read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("Could not parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub log_path: String,
    pub log_level: String,
    pub device: DeviceConfig,
    pub decoder: DecoderConfig,
    pub driver: DriverConfig,
    pub session: SessionConfig,
    pub upload: UploadConfig,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            log_path: "bridge.log".into(),
            log_level: "info".into(),
            device: DeviceConfig::default(),
            decoder: DecoderConfig::default(),
            driver: DriverConfig::default(),
            session: SessionConfig::default(),
            upload: UploadConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeviceConfig {
    pub port: String,
    pub baudrate: u32,
    pub open_attempts: u32,
    pub open_interval_ms: u64,
    pub read_timeout_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyACM0".into(),
            baudrate: 9600,
            open_attempts: 10,
            open_interval_ms: 1000,
            read_timeout_ms: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DecoderConfig {
    pub command: Vec<String>,
    pub host: String,
    pub port: u16,
    pub connect_attempts: u32,
    pub connect_interval_ms: u64,
    pub connect_max_interval_ms: u64,
    pub read_timeout_ms: u64,
    pub isolation: Isolation,
    pub capture_output: bool,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            command: vec!["qspy".into()],
            host: "localhost".into(),
            port: 6601,
            connect_attempts: 10,
            connect_interval_ms: 500,
            connect_max_interval_ms: 2000,
            read_timeout_ms: 100,
            isolation: Isolation::OwnGroup,
            capture_output: false,
        }
    }
}

/// When the driver is launched, relative to the decoder link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DriverStartMode {
    /// A fixed delay after the relays started
    #[default]
    Eager,
    /// As soon as the device sent its first bytes
    Lazy,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverConfig {
    /// Command line of the driver, the list of test scripts is appended as one argument
    pub command: Vec<String>,
    pub test_dir: String,
    pub suite: String,
    pub file_prefix: String,
    pub file_extension: String,
    pub start: DriverStartMode,
    pub start_delay_ms: u64,
    pub ready_timeout_ms: u64,
    pub isolation: Isolation,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            command: vec!["python".into(), "-u".into(), "qutest.py".into()],
            test_dir: "test".into(),
            suite: "test_Blinky".into(),
            file_prefix: "test_".into(),
            file_extension: "py".into(),
            start: DriverStartMode::Eager,
            start_delay_ms: 2000,
            ready_timeout_ms: 10_000,
            isolation: Isolation::OwnGroup,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub settle_delay_ms: u64,
    pub poll_interval_ms: u64,
    pub chunk_size: usize,
    /// 0 disables the session timeout
    pub timeout_ms: u64,
    pub terminate_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            settle_delay_ms: 2000,
            poll_interval_ms: 50,
            chunk_size: 64,
            timeout_ms: 0,
            terminate_grace_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct UploadConfig {
    /// Empty if the firmware is uploaded by someone else
    pub command: Vec<String>,
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        text.parse()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_owned()));

        if self.decoder.command.is_empty() {
            return invalid("decoder.command must not be empty");
        }
        if self.driver.command.is_empty() {
            return invalid("driver.command must not be empty");
        }
        if !(1..=MAX_CHUNK_SIZE).contains(&self.session.chunk_size) {
            return Err(ConfigError::Invalid(format!(
                "session.chunk_size must be between 1 and {MAX_CHUNK_SIZE}"
            )));
        }
        if !(1..=MAX_POLL_INTERVAL_MS).contains(&self.session.poll_interval_ms) {
            return Err(ConfigError::Invalid(format!(
                "session.poll_interval_ms must be between 1 and {MAX_POLL_INTERVAL_MS}"
            )));
        }
        for (name, timeout) in [
            ("device.read_timeout_ms", self.device.read_timeout_ms),
            ("decoder.read_timeout_ms", self.decoder.read_timeout_ms),
        ] {
            if !(1..=MAX_POLL_INTERVAL_MS).contains(&timeout) {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be between 1 and {MAX_POLL_INTERVAL_MS}"
                )));
            }
        }
        if self.device.open_attempts == 0 || self.decoder.connect_attempts == 0 {
            return invalid("open_attempts and connect_attempts must be at least 1");
        }
        self.level_filter().map(|_| ())
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| ConfigError::Invalid(format!("unknown log_level {:?}", self.log_level)))
    }

    /// `None` if no overall session timeout is configured
    #[must_use]
    pub fn session_timeout(&self) -> Option<Duration> {
        (self.session.timeout_ms > 0).then(|| Duration::from_millis(self.session.timeout_ms))
    }
}

impl FromStr for BridgeConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let config: BridgeConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }
}
