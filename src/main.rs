use std::process::ExitCode;

use qutest_bridge::{
    config::BridgeConfig,
    logging,
    session::{Collaborators, Orchestrator, SessionSettings},
};

/// Exit code for an unusable config or log file
const SETUP_FAILURE: u8 = 3;

fn main() -> ExitCode {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| "config.toml".into());
    let config = match BridgeConfig::from_file(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{config_path}: {e}");
            return ExitCode::from(SETUP_FAILURE);
        }
    };
    if let Err(e) = logging::init(&config) {
        eprintln!("Could not set up logging: {e:#}");
        return ExitCode::from(SETUP_FAILURE);
    }

    let mut orchestrator =
        Orchestrator::new(SessionSettings::from_config(&config), Collaborators::from_config(&config));
    let cancel = orchestrator.cancel_token();
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        if let Err(e) = signal_hook::flag::register(signal, cancel.flag()) {
            log::warn!("Could not install handler for signal {signal}: {e}");
        }
    }

    let report = orchestrator.run();
    ExitCode::from(report.reason.exit_code())
}
