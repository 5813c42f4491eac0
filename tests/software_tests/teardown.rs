use std::{
    net::TcpListener,
    path::Path,
    time::{Duration, Instant},
};

use crate::common::*;
use qutest_bridge::{
    channel::tcp::TcpConnector,
    process::Exit,
    session::{Stage, TerminationReason},
};

/// Open halves left when only the test's far ends of the device and decoder link remain
const FAR_HALVES: usize = 4;

#[test]
fn repeated_teardown_reports_once() {
    let (bench, collaborators) = bench();
    let (mut orchestrator, report) = start(settings("echo OK"), collaborators).join();

    for _ in 0..3 {
        assert_eq!(orchestrator.teardown(), &report);
    }
    drop(orchestrator);

    assert_eq!(bench.reports.reports().len(), 1);
    assert_eq!(bench.link.open_halves(), FAR_HALVES);
}

#[test]
fn nothing_is_left_running() {
    let (bench, collaborators) = bench();
    let dir = tempfile::tempdir().unwrap();
    let pidfile = dir.path().join("decoder.pid");
    let mut settings = settings("sleep 0.5; echo OK");
    settings.decoder = sh("decoder", "echo $$ > \"$1\"; exec sleep 30")
        .arg(pidfile.to_string_lossy().into_owned());

    let (orchestrator, report) = start(settings, collaborators).join();

    assert!(report.reason.is_success());
    assert_eq!(report.driver_exit, Some(Exit::Code(0)));
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
    assert_eq!(orchestrator.stage(), Stage::TornDown);
    assert_eq!(bench.link.open_halves(), FAR_HALVES);

    let pid = std::fs::read_to_string(&pidfile).unwrap();
    assert!(!Path::new("/proc").join(pid.trim()).exists(), "decoder {} still exists", pid.trim());
}

#[test]
fn cancel_stops_blocked_relays() {
    let (bench, collaborators) = bench();
    let session = start(settings("exec sleep 30"), collaborators);

    // both relays are blocked on reads, nobody sends anything
    std::thread::sleep(Duration::from_millis(300));
    let cancelled = Instant::now();
    session.cancel.cancel();
    let (_, report) = session.join();

    assert!(cancelled.elapsed() < Duration::from_secs(2));
    assert_eq!(report.reason, TerminationReason::Cancelled);
    assert_eq!(report.driver_exit, Some(Exit::Signal(15)));
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
    assert_eq!(bench.link.open_halves(), FAR_HALVES);
    assert_eq!(bench.reports.reports().len(), 1);
}

#[test]
fn cancel_reaches_a_relay_stuck_on_a_stalled_decoder() {
    let (mut bench, mut collaborators) = bench();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    collaborators.decoder_link = Box::new(TcpConnector {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
        connect_timeout: Duration::from_secs(1),
        read_timeout: READ_TIMEOUT,
    });
    let mut settings = settings("exec sleep 30");
    settings.chunk_size = 4096;

    let session = start(settings, collaborators);
    // accepted but never read, so the socket buffers fill up
    let (_stalled_decoder, _) = listener.accept().unwrap();
    let chunk = vec![0x5a; 64 * 1024];
    for _ in 0..512 {
        bench.device.write(&chunk).unwrap();
    }
    std::thread::sleep(Duration::from_millis(500));

    let cancelled = Instant::now();
    session.cancel.cancel();
    let Some((_, report)) = session.join_within(Duration::from_secs(5)) else {
        panic!("session still running 5s after cancel");
    };

    assert!(cancelled.elapsed() < Duration::from_secs(5));
    assert_eq!(report.reason, TerminationReason::Cancelled);
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
    assert_eq!(bench.reports.reports().len(), 1);
}

#[test]
fn session_timeout_ends_a_hanging_driver() {
    let (_bench, collaborators) = bench();
    let mut settings = settings("exec sleep 30");
    settings.session_timeout = Some(Duration::from_millis(300));

    let (_, report) = start(settings, collaborators).join();

    assert!(matches!(report.reason, TerminationReason::Timeout(_)));
    assert!(report.duration >= Duration::from_millis(300));
    assert_eq!(report.reason.exit_code(), 2);
    assert_eq!(report.driver_exit, Some(Exit::Signal(15)));
    assert_eq!(report.decoder_exit, Some(Exit::Signal(15)));
}
