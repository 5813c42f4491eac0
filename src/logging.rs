use std::fs::File;

use anyhow::Context;
use simplelog as sl;

use crate::config::BridgeConfig;

/// Installs the global logger: the terminal on stderr plus a log file, both at the configured
/// level. Thread names are included, so relay and collector lines can be told apart.
pub fn init(config: &BridgeConfig) -> anyhow::Result<()> {
    let level = config.level_filter()?;
    let log_config = sl::ConfigBuilder::new()
        .set_thread_level(sl::LevelFilter::Error)
        .set_thread_mode(sl::ThreadLogMode::Names)
        .set_target_level(sl::LevelFilter::Off)
        .build();

    let file = File::create(&config.log_path)
        .with_context(|| format!("could not create log file {}", config.log_path))?;

    sl::CombinedLogger::init(vec![
        sl::TermLogger::new(
            level,
            log_config.clone(),
            sl::TerminalMode::Stderr,
            sl::ColorChoice::Auto,
        ),
        sl::WriteLogger::new(level, log_config, file),
    ])
    .context("a logger is already installed")?;

    log::info!("Logging {level} and above to {}", config.log_path);
    Ok(())
}
