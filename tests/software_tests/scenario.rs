use std::{
    io::{Read, Write},
    net::TcpListener,
    path::PathBuf,
    time::Duration,
};

use crate::common::*;
use qutest_bridge::{
    channel::tcp::TcpConnector,
    collaborators::FixedScripts,
    process::Exit,
    session::{Stage, TerminationReason},
};

const WAIT: Duration = Duration::from_secs(5);

/// A driver that waits until the test creates `go`, then prints OK
fn gated_driver(go: &std::path::Path) -> String {
    format!("while [ ! -f '{}' ]; do sleep 0.02; done; echo OK", go.display())
}

#[test]
fn bytes_pass_both_ways_and_driver_decides() {
    let (mut bench, collaborators) = bench();
    let gate = tempfile::tempdir().unwrap();
    let go = gate.path().join("go");
    let session = start(settings(&gated_driver(&go)), collaborators);

    bench.device.write(&[0x01, 0x02, 0x03]).unwrap();
    assert_eq!(read_bytes(&mut bench.decoder, 3, WAIT), [0x01, 0x02, 0x03]);

    bench.decoder.write(&[0xAA]).unwrap();
    assert_eq!(read_bytes(&mut bench.device, 1, WAIT), [0xAA]);

    std::fs::write(&go, "").unwrap();
    let (orchestrator, report) = session.join();

    assert_eq!(report.reason, TerminationReason::Success);
    assert!(report.output.ends_with(b"OK\n"));
    assert_eq!(report.driver_exit, Some(Exit::Code(0)));
    assert_eq!(report.spawned.len(), 2);
    assert_eq!(orchestrator.stage(), Stage::TornDown);
    assert_eq!(bench.reports.reports(), [report]);
}

#[test]
fn long_streams_keep_their_order() {
    let (mut bench, collaborators) = bench();
    let gate = tempfile::tempdir().unwrap();
    let go = gate.path().join("go");
    let session = start(settings(&gated_driver(&go)), collaborators);

    let upstream: Vec<u8> = (0..=255u8).cycle().take(3000).collect();
    let downstream: Vec<u8> = upstream.iter().rev().copied().collect();
    for chunk in upstream.chunks(100) {
        bench.device.write(chunk).unwrap();
    }
    for chunk in downstream.chunks(7) {
        bench.decoder.write(chunk).unwrap();
    }

    assert_eq!(read_bytes(&mut bench.decoder, upstream.len(), WAIT), upstream);
    assert_eq!(read_bytes(&mut bench.device, downstream.len(), WAIT), downstream);

    std::fs::write(&go, "").unwrap();
    assert!(session.join().1.reason.is_success());
}

#[test]
fn decoder_is_reached_over_tcp() {
    let (mut bench, mut collaborators) = bench();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    collaborators.decoder_link = Box::new(TcpConnector {
        host: "127.0.0.1".into(),
        port: listener.local_addr().unwrap().port(),
        connect_timeout: Duration::from_secs(1),
        read_timeout: READ_TIMEOUT,
    });
    let gate = tempfile::tempdir().unwrap();
    let go = gate.path().join("go");
    let session = start(settings(&gated_driver(&go)), collaborators);

    let (mut decoder, _) = listener.accept().unwrap();
    decoder.set_read_timeout(Some(WAIT)).unwrap();

    bench.device.write(&[0x01, 0x02, 0x03]).unwrap();
    let mut received = [0; 3];
    decoder.read_exact(&mut received).unwrap();
    assert_eq!(received, [0x01, 0x02, 0x03]);

    decoder.write_all(&[0xAA]).unwrap();
    assert_eq!(read_bytes(&mut bench.device, 1, WAIT), [0xAA]);

    std::fs::write(&go, "").unwrap();
    let (_, report) = session.join();
    assert_eq!(report.reason, TerminationReason::Success);

    // the bridge closed its side of the socket
    assert_eq!(decoder.read(&mut received).unwrap(), 0);
}

#[test]
fn driver_gets_scripts_as_one_argument() {
    let (_bench, mut collaborators) = bench();
    collaborators.scripts = Box::new(FixedScripts(vec![
        PathBuf::from("/suite/test_a.py"),
        PathBuf::from("/suite/test_b.py"),
    ]));

    let (_, report) = start(settings("printf '%s|%s\\n' \"$1\" \"$#\""), collaborators).join();

    assert_eq!(report.output_text(), "/suite/test_a.py /suite/test_b.py|1\n");
    assert!(report.spawned[1].ends_with("/suite/test_a.py /suite/test_b.py"));
}
