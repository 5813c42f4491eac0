use std::time::Duration;

use crate::common::*;
use qutest_bridge::{
    error::SessionError,
    process::Exit,
    session::{DriverStart, TerminationReason},
};
use test_case::test_case;

#[test_case("exit 0", TerminationReason::Success, 0; "passing tests")]
#[test_case("exit 3", TerminationReason::Failure { exit_code: 3 }, 1; "failing tests")]
#[test_case("kill -9 $$", TerminationReason::Error(SessionError::DriverCrash("killed by signal 9".into())), 2; "killed driver")]
fn driver_exit_decides_the_result(script: &str, reason: TerminationReason, exit_code: u8) {
    let (_bench, collaborators) = bench();
    let (_, report) = start(settings(script), collaborators).join();

    assert_eq!(report.reason, reason);
    assert_eq!(report.reason.exit_code(), exit_code);
}

#[test]
fn eager_driver_waits_for_its_delay() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("exit 0");
    settings.driver_start = DriverStart::Eager { delay: Duration::from_millis(300) };

    let (_, report) = start(settings, collaborators).join();

    assert!(report.reason.is_success());
    assert!(report.duration >= Duration::from_millis(300));
}

#[test]
fn lazy_driver_waits_for_the_device() {
    let (mut bench, collaborators) = bench();
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("started");
    let mut settings = settings(&format!("touch '{}'", marker.display()));
    settings.driver_start = DriverStart::Lazy { ready_timeout: Duration::from_secs(10) };

    let session = start(settings, collaborators);
    std::thread::sleep(Duration::from_millis(300));
    assert!(!marker.exists());

    bench.device.write(&[0x05]).unwrap();
    assert_eq!(read_bytes(&mut bench.decoder, 1, Duration::from_secs(5)), [0x05]);

    let (_, report) = session.join();
    assert!(report.reason.is_success());
    assert!(marker.exists());
}

#[test]
fn silent_device_times_out_a_lazy_driver() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("exit 0");
    settings.driver_start = DriverStart::Lazy { ready_timeout: Duration::from_millis(200) };

    let (_, report) = start(settings, collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Timeout(_)));
    assert_eq!(report.spawned.len(), 1);
    assert_eq!(report.driver_exit, None);
}

#[test]
fn broken_device_link_ends_the_session() {
    let (bench, collaborators) = bench();
    let session = start(settings("exec sleep 30"), collaborators);

    std::thread::sleep(Duration::from_millis(200));
    drop(bench.device);
    let (_, report) = session.join();

    assert!(matches!(report.reason, TerminationReason::Error(SessionError::Relay(_))));
    assert_eq!(report.driver_exit, Some(Exit::Signal(15)));
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
}

#[test]
fn decoder_exit_ends_the_session() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("exec sleep 30");
    settings.decoder = sh("decoder", "sleep 0.3");

    let (_, report) = start(settings, collaborators).join();

    match report.reason {
        TerminationReason::Error(SessionError::Relay(cause)) => {
            assert_eq!(cause, "decoder exited with exit code 0");
        }
        reason => panic!("unexpected result {reason}"),
    }
    assert_eq!(report.decoder_exit, Some(Exit::Code(0)));
}
