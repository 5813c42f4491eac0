use std::time::Duration;

use crate::{
    channel::RetryPolicy,
    config::{BridgeConfig, DriverStartMode},
    process::ProcessSpec,
};

/// When to launch the driver. The driver is never launched before the decoder link is connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStart {
    /// After a fixed delay, counted from the moment both relays run
    Eager { delay: Duration },
    /// When the device sends its first bytes; the session times out if that takes longer
    /// than `ready_timeout`
    Lazy { ready_timeout: Duration },
}

/// Everything the orchestrator needs to know about one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSettings {
    pub decoder: ProcessSpec,
    /// The driver's command line, without the script list
    pub driver: ProcessSpec,
    pub driver_start: DriverStart,
    pub device_retry: RetryPolicy,
    pub decoder_retry: RetryPolicy,
    /// Pause after the upload, while the device resets
    pub settle_delay: Duration,
    pub poll_interval: Duration,
    pub chunk_size: usize,
    pub session_timeout: Option<Duration>,
    pub terminate_grace: Duration,
}

impl SessionSettings {
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        let mut decoder = ProcessSpec::new("decoder", config.decoder.command.clone());
        decoder.capture_output = config.decoder.capture_output;
        decoder.isolation = config.decoder.isolation;

        let mut driver = ProcessSpec::new("driver", config.driver.command.clone());
        driver.capture_output = true;
        driver.isolation = config.driver.isolation;

        let driver_start = match config.driver.start {
            DriverStartMode::Eager => {
                DriverStart::Eager { delay: Duration::from_millis(config.driver.start_delay_ms) }
            }
            DriverStartMode::Lazy => DriverStart::Lazy {
                ready_timeout: Duration::from_millis(config.driver.ready_timeout_ms),
            },
        };

        Self {
            decoder,
            driver,
            driver_start,
            device_retry: RetryPolicy::constant(
                config.device.open_attempts,
                Duration::from_millis(config.device.open_interval_ms),
            ),
            decoder_retry: RetryPolicy {
                attempts: config.decoder.connect_attempts,
                interval: Duration::from_millis(config.decoder.connect_interval_ms),
                max_interval: Duration::from_millis(config.decoder.connect_max_interval_ms),
            },
            settle_delay: Duration::from_millis(config.session.settle_delay_ms),
            poll_interval: Duration::from_millis(config.session.poll_interval_ms),
            chunk_size: config.session.chunk_size,
            session_timeout: config.session_timeout(),
            terminate_grace: Duration::from_millis(config.session.terminate_grace_ms),
        }
    }
}
