use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use qutest_bridge::{
    channel::{
        memory::{Link, OnceConnector},
        Channel, ChannelError, ChannelResult, Connector, RetryPolicy,
    },
    collaborators::{FixedScripts, ReportSink, SkipUpload},
    events::CancelToken,
    process::ProcessSpec,
    session::{Collaborators, DriverStart, Orchestrator, SessionReport, SessionSettings},
};

pub const READ_TIMEOUT: Duration = Duration::from_millis(20);

/// Records every report it receives
#[derive(Debug, Clone, Default)]
pub struct RecordingSink(Arc<Mutex<Vec<SessionReport>>>);

impl RecordingSink {
    pub fn reports(&self) -> Vec<SessionReport> {
        self.0.lock().unwrap().clone()
    }
}

impl ReportSink for RecordingSink {
    fn report(&mut self, report: &SessionReport) {
        self.0.lock().unwrap().push(report.clone());
    }
}

/// An endpoint nobody listens on
pub struct RefusingConnector;

impl Connector for RefusingConnector {
    fn endpoint(&self) -> String {
        "nowhere".into()
    }

    fn connect(&mut self) -> ChannelResult<Channel> {
        Err(ChannelError::Connection {
            endpoint: self.endpoint(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        })
    }
}

/// The far ends of a simulated session: `device` plays the device under test, `decoder` the
/// decoder's socket
pub struct Bench {
    pub link: Link,
    pub device: Channel,
    pub decoder: Channel,
    pub reports: RecordingSink,
}

/// Sets up per-thread log files under `tests/tmp`
pub fn init_logging() {
    let _ = std::fs::create_dir_all("tests/tmp");
    file_per_thread_logger::allow_uninitialized();
    file_per_thread_logger::initialize("tests/tmp/log-");
}

/// An `sh -c` process. Arguments appended to the spec show up as `$1`, `$2`, ...
pub fn sh(name: &str, script: &str) -> ProcessSpec {
    ProcessSpec::new(name, vec!["sh".into(), "-c".into(), script.into(), name.into()])
}

/// Fast settings with a decoder that idles until it is terminated
pub fn settings(driver_script: &str) -> SessionSettings {
    SessionSettings {
        decoder: sh("decoder", "exec sleep 30"),
        driver: {
            let mut driver = sh("driver", driver_script);
            driver.capture_output = true;
            driver
        },
        driver_start: DriverStart::Eager { delay: Duration::ZERO },
        device_retry: RetryPolicy::constant(3, Duration::from_millis(10)),
        decoder_retry: RetryPolicy::constant(3, Duration::from_millis(10)),
        settle_delay: Duration::ZERO,
        poll_interval: Duration::from_millis(20),
        chunk_size: 16,
        session_timeout: Some(Duration::from_secs(20)),
        terminate_grace: Duration::from_millis(300),
    }
}

/// Memory-backed collaborators whose far ends are returned in the [`Bench`]
pub fn bench() -> (Bench, Collaborators) {
    init_logging();
    let link = Link::new(READ_TIMEOUT);
    let (device_near, device) = link.pair("device");
    let (decoder_near, decoder) = link.pair("decoder");
    let reports = RecordingSink::default();

    let collaborators = Collaborators {
        uploader: Box::new(SkipUpload),
        scripts: Box::new(FixedScripts(vec![PathBuf::from("/suite/test_a.py")])),
        device: Box::new(OnceConnector::new(device_near)),
        decoder_link: Box::new(OnceConnector::new(decoder_near)),
        reporter: Box::new(reports.clone()),
    };
    (Bench { link, device, decoder, reports }, collaborators)
}

/// A session running on its own thread
pub struct Running {
    pub cancel: CancelToken,
    handle: JoinHandle<(Orchestrator, SessionReport)>,
}

impl Running {
    pub fn join(self) -> (Orchestrator, SessionReport) {
        self.handle.join().unwrap()
    }

    /// Like [`Running::join`], `None` if the session is still running after `timeout`
    pub fn join_within(self, timeout: Duration) -> Option<(Orchestrator, SessionReport)> {
        let deadline = Instant::now() + timeout;
        while !self.handle.is_finished() {
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Some(self.join())
    }
}

pub fn start(settings: SessionSettings, collaborators: Collaborators) -> Running {
    let mut orchestrator = Orchestrator::new(settings, collaborators);
    let cancel = orchestrator.cancel_token();
    let handle = std::thread::Builder::new()
        .name("orchestrator".into())
        .spawn(move || {
            file_per_thread_logger::initialize("tests/tmp/log-");
            let report = orchestrator.run();
            (orchestrator, report)
        })
        .unwrap();
    Running { cancel, handle }
}

/// Reads from `channel` until `n` bytes arrived or `timeout` passed
pub fn read_bytes(channel: &mut Channel, n: usize, timeout: Duration) -> Vec<u8> {
    let mut received = Vec::new();
    let mut buf = [0; 64];
    let deadline = Instant::now() + timeout;
    while received.len() < n && Instant::now() < deadline {
        if let Some(read) = channel.read(&mut buf).unwrap() {
            received.extend_from_slice(&buf[..read]);
        }
    }
    received
}
