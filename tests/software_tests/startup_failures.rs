use std::time::Duration;

use crate::common::*;
use qutest_bridge::{
    channel::RetryPolicy,
    collaborators::CommandUploader,
    error::SessionError,
    process::{Exit, ProcessSpec},
    session::{Stage, TerminationReason},
};

#[test]
fn decoder_that_never_listens_prevents_the_driver() {
    let (_bench, mut collaborators) = bench();
    collaborators.decoder_link = Box::new(RefusingConnector);

    let (_, report) = start(settings("echo OK"), collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::DecoderStartup(_))));
    assert_eq!(report.spawned, ["sh -c exec sleep 30 decoder"]);
    assert!(report.output.is_empty());
    assert_eq!(report.driver_exit, None);
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
}

#[test]
fn decoder_that_exits_stops_the_retries() {
    let (_bench, mut collaborators) = bench();
    collaborators.decoder_link = Box::new(RefusingConnector);
    let mut settings = settings("echo OK");
    settings.decoder = sh("decoder", "exit 1");
    settings.decoder_retry = RetryPolicy::constant(100, Duration::from_millis(50));

    let (_, report) = start(settings, collaborators).join();

    assert!(report.duration < Duration::from_secs(3));
    assert_eq!(
        report.reason,
        TerminationReason::Error(SessionError::DecoderStartup(
            "decoder exited with exit code 1 before accepting connections".into()
        ))
    );
    assert_eq!(report.decoder_exit, Some(Exit::Code(1)));
}

#[test]
fn missing_decoder_executable() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("echo OK");
    settings.decoder = ProcessSpec::new("decoder", vec!["/nonexistent/qspy".into()]);

    let (_, report) = start(settings, collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::DecoderStartup(_))));
    assert!(report.spawned.is_empty());
    assert_eq!(report.decoder_exit, None);
}

#[test]
fn unreachable_device() {
    let (_bench, mut collaborators) = bench();
    collaborators.device = Box::new(RefusingConnector);

    let (_, report) = start(settings("echo OK"), collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::DeviceLink(_))));
    assert!(report.cause().contains("nowhere"));
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
}

#[test]
fn failed_upload() {
    let (_bench, mut collaborators) = bench();
    collaborators.uploader =
        Box::new(CommandUploader::new(vec!["sh".into(), "-c".into(), "exit 1".into()]));

    let (orchestrator, report) = start(settings("echo OK"), collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::Upload(_))));
    assert!(report.spawned.is_empty());
    assert_eq!(orchestrator.stage(), Stage::TornDown);
}

#[test]
fn missing_driver_executable() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("echo OK");
    settings.driver = ProcessSpec::new("driver", vec!["/nonexistent/qutest".into()]);

    let (_, report) = start(settings, collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::Spawn(_))));
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
}
