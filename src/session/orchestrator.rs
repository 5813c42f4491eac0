use std::{
    sync::mpsc,
    time::{Duration, Instant},
};

use super::{DriverStart, Session, SessionReport, SessionSettings, Stage, TerminationReason};
use crate::{
    channel::{
        connect_with_retry, serial::SerialConnector, tcp::TcpConnector, Channel, ChannelError,
        ChannelResult, Connector,
    },
    collaborators::{
        join_script_list, CommandUploader, LogReportSink, ReportSink, ScriptSource, SkipUpload,
        SuiteDirectory, Uploader,
    },
    collector::{spawn_collector, CollectorSettings},
    config::BridgeConfig,
    error::{cause_chain, SessionError},
    events::{CancelToken, EventReceiver, EventSender, SessionEvent},
    process::{self, Exit, OutputRead, ProcessHandle, ProcessStatus},
    relay::{spawn_relay, Direction},
};

/// Timeout of a single TCP connect to the decoder
const DECODER_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
/// Upper bound for reading the driver's last output after it exited
const FINAL_DRAIN: Duration = Duration::from_secs(1);
/// Captured decoder output logged per supervise tick, the rest waits for the next one
const MAX_OUTPUT_CHUNKS_PER_TICK: usize = 32;

/// The external parts a session talks to
pub struct Collaborators {
    pub uploader: Box<dyn Uploader>,
    pub scripts: Box<dyn ScriptSource>,
    /// Opens the link to the device under test
    pub device: Box<dyn Connector>,
    /// Opens the socket of the decoder process
    pub decoder_link: Box<dyn Connector>,
    pub reporter: Box<dyn ReportSink>,
}

impl Collaborators {
    /// Serial device, TCP decoder link, test suite directory and log report
    #[must_use]
    pub fn from_config(config: &BridgeConfig) -> Self {
        let uploader: Box<dyn Uploader> = if config.upload.command.is_empty() {
            Box::new(SkipUpload)
        } else {
            Box::new(CommandUploader::new(config.upload.command.clone()))
        };

        Self {
            uploader,
            scripts: Box::new(SuiteDirectory::new(
                &config.driver.test_dir,
                &config.driver.suite,
                &config.driver.file_prefix,
                &config.driver.file_extension,
            )),
            device: Box::new(SerialConnector {
                path: config.device.port.clone(),
                baudrate: config.device.baudrate,
                read_timeout: Duration::from_millis(config.device.read_timeout_ms),
            }),
            decoder_link: Box::new(TcpConnector {
                host: config.decoder.host.clone(),
                port: config.decoder.port,
                connect_timeout: DECODER_CONNECT_TIMEOUT,
                read_timeout: Duration::from_millis(config.decoder.read_timeout_ms),
            }),
            reporter: Box::new(LogReportSink),
        }
    }
}

/// Drives one test session from upload to teardown.
///
/// All stage transitions happen on the thread calling [`Orchestrator::run`]. Relays and the
/// driver output collector run on their own threads and only report back through
/// [`SessionEvent`]s; they all observe the same [`CancelToken`], which is set on entering
/// [`Stage::Finalizing`].
pub struct Orchestrator {
    settings: SessionSettings,
    collaborators: Collaborators,
    cancel: CancelToken,
    events_tx: EventSender,
    events: EventReceiver,
    session: Session,
    report: Option<SessionReport>,
}

impl Orchestrator {
    #[must_use]
    pub fn new(settings: SessionSettings, collaborators: Collaborators) -> Self {
        let (events_tx, events) = mpsc::channel();
        Self {
            settings,
            collaborators,
            cancel: CancelToken::new(),
            events_tx,
            events,
            session: Session::new(),
            report: None,
        }
    }

    /// Cancelling the returned token ends a running session with [`TerminationReason::Cancelled`]
    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    #[must_use]
    pub fn stage(&self) -> Stage {
        self.session.stage
    }

    /// Runs the whole session and tears it down. A session only runs once, later calls return
    /// the first report.
    pub fn run(&mut self) -> SessionReport {
        if self.session.stage == Stage::Idle && self.report.is_none() {
            self.session = Session::new();
            let reason = match self.prepare() {
                Ok(()) => self.supervise(),
                Err(reason) => reason,
            };
            self.finalize(reason);
        }
        self.teardown().clone()
    }

    /// Stops every task and process of the session and reports the result. Safe to call any
    /// number of times; resources are released and the report sink is called only once.
    pub fn teardown(&mut self) -> &SessionReport {
        let report = match self.report.take() {
            Some(report) => report,
            None => {
                let report = self.release();
                self.collaborators.reporter.report(&report);
                report
            }
        };
        self.report.insert(report)
    }

    fn enter(&mut self, stage: Stage) {
        log::info!("Session stage {} -> {stage}", self.session.stage);
        self.session.stage = stage;
    }

    fn check_cancelled(&self) -> Result<(), TerminationReason> {
        if self.cancel.is_cancelled() {
            return Err(TerminationReason::Cancelled);
        }
        Ok(())
    }

    /// Upload, decoder and device: everything up to the point where bytes flow
    fn prepare(&mut self) -> Result<(), TerminationReason> {
        self.upload()?;
        let decoder_link = self.start_decoder()?;
        let device = self.open_device()?;
        self.start_relays(device, decoder_link)
    }

    fn upload(&mut self) -> Result<(), TerminationReason> {
        self.check_cancelled()?;
        self.enter(Stage::Uploading);

        match self.collaborators.uploader.upload(&self.cancel) {
            Ok(()) => {}
            Err(_) if self.cancel.is_cancelled() => return Err(TerminationReason::Cancelled),
            Err(e) => return Err(SessionError::Upload(format!("{e:#}")).into()),
        }

        log::info!("Waiting {:?} for the device to settle", self.settings.settle_delay);
        if self.cancel.sleep(self.settings.settle_delay) {
            return Err(TerminationReason::Cancelled);
        }
        Ok(())
    }

    fn start_decoder(&mut self) -> Result<Channel, TerminationReason> {
        self.enter(Stage::AwaitingDecoder);

        let decoder = process::spawn(&self.settings.decoder)
            .map_err(|e| SessionError::DecoderStartup(cause_chain(&e)))?;
        self.session.spawned.push(decoder.command_line().to_owned());
        self.session.decoder = Some(decoder);

        let cancel = &self.cancel;
        let decoder = &mut self.session.decoder;
        let result = connect_with_retry(
            self.collaborators.decoder_link.as_mut(),
            self.settings.decoder_retry,
            || cancel.is_cancelled() || decoder.as_mut().is_some_and(|d| !d.is_alive()),
        );

        match result {
            Ok(link) => Ok(link),
            Err(_) if self.cancel.is_cancelled() => Err(TerminationReason::Cancelled),
            Err(ChannelError::Aborted(_)) => {
                let exit = self.session.decoder.as_ref().and_then(ProcessHandle::exit);
                Err(SessionError::DecoderStartup(format!(
                    "decoder exited with {} before accepting connections",
                    exit.unwrap_or(Exit::Unknown)
                ))
                .into())
            }
            Err(e) => Err(SessionError::DecoderStartup(cause_chain(&e)).into()),
        }
    }

    /// Opens the device link. The device may still be resetting after the upload, so opening is
    /// retried within its own budget.
    fn open_device(&mut self) -> Result<Channel, TerminationReason> {
        let cancel = &self.cancel;
        let result: ChannelResult<Channel> = connect_with_retry(
            self.collaborators.device.as_mut(),
            self.settings.device_retry,
            || cancel.is_cancelled(),
        );

        match result {
            Ok(device) => Ok(device),
            Err(_) if self.cancel.is_cancelled() => Err(TerminationReason::Cancelled),
            Err(e) => Err(SessionError::DeviceLink(cause_chain(&e)).into()),
        }
    }

    fn start_relays(&mut self, device: Channel, decoder_link: Channel) -> Result<(), TerminationReason> {
        let (from_device, to_device) = device.split();
        let (from_decoder, to_decoder) = decoder_link.split();

        for (direction, source, sink) in [
            (Direction::DeviceToDecoder, from_device, to_decoder),
            (Direction::DecoderToDevice, from_decoder, to_device),
        ] {
            let relay = spawn_relay(
                direction,
                source,
                sink,
                self.settings.chunk_size,
                self.cancel.clone(),
                self.events_tx.clone(),
            )
            .map_err(|e| SessionError::Spawn(format!("relay thread for {direction}: {e}")))?;
            self.session.relays.push(relay);
        }

        self.enter(Stage::AwaitingDriver);
        Ok(())
    }

    /// Watches the running session until something ends it
    fn supervise(&mut self) -> TerminationReason {
        let relays_started = Instant::now();
        let driver_due = match self.settings.driver_start {
            DriverStart::Eager { delay } => relays_started + delay,
            DriverStart::Lazy { ready_timeout } => relays_started + ready_timeout,
        };
        let deadline = self.settings.session_timeout.map(|t| (self.session.started + t, t));

        loop {
            if self.cancel.is_cancelled() {
                return TerminationReason::Cancelled;
            }
            if let Some((deadline, timeout)) = deadline {
                if Instant::now() >= deadline {
                    return TerminationReason::Timeout(format!("session exceeded {timeout:?}"));
                }
            }
            if let Err(reason) = self.check_decoder() {
                return reason;
            }

            if !self.session.driver_started && Instant::now() >= driver_due {
                let started = match self.settings.driver_start {
                    DriverStart::Eager { .. } => self.start_driver(),
                    DriverStart::Lazy { ready_timeout } => Err(TerminationReason::Timeout(format!(
                        "device sent nothing within {ready_timeout:?}"
                    ))),
                };
                if let Err(reason) = started {
                    return reason;
                }
            }

            // the orchestrator holds a sender itself, so receiving only ever times out
            if let Ok(event) = self.events.recv_timeout(self.settings.poll_interval) {
                if let Some(reason) = self.handle_event(event) {
                    return reason;
                }
            }
        }
    }

    fn handle_event(&mut self, event: SessionEvent) -> Option<TerminationReason> {
        match event {
            SessionEvent::FirstBytes(Direction::DeviceToDecoder) => {
                log::info!("Device is sending");
                let lazy = matches!(self.settings.driver_start, DriverStart::Lazy { .. });
                if lazy && !self.session.driver_started {
                    return self.start_driver().err();
                }
                None
            }
            SessionEvent::FirstBytes(direction) => {
                log::debug!("First bytes relayed {direction}");
                None
            }
            SessionEvent::RelayFailed { direction, cause } => {
                Some(SessionError::Relay(format!("{direction}: {cause}")).into())
            }
            SessionEvent::DriverExited(exit) => {
                self.session.driver_exit = Some(exit);
                Some(TerminationReason::from_driver_exit(exit))
            }
        }
    }

    /// Logs captured decoder output and fails the session if the decoder died
    fn check_decoder(&mut self) -> Result<(), TerminationReason> {
        let Some(decoder) = self.session.decoder.as_mut() else {
            return Ok(());
        };

        log_captured_output(decoder);
        match decoder.poll() {
            ProcessStatus::Running => Ok(()),
            ProcessStatus::Exited(exit) => {
                Err(SessionError::Relay(format!("decoder exited with {exit}")).into())
            }
        }
    }

    /// Spawns the driver and its output collector. Runs at most once per session.
    fn start_driver(&mut self) -> Result<(), TerminationReason> {
        if std::mem::replace(&mut self.session.driver_started, true) {
            return Ok(());
        }

        let scripts = self
            .collaborators
            .scripts
            .scripts()
            .map_err(|e| SessionError::Spawn(format!("test scripts unavailable: {e:#}")))?;
        if scripts.is_empty() {
            return Err(SessionError::Spawn("no test scripts found".into()).into());
        }

        let spec = self.settings.driver.clone().arg(join_script_list(&scripts));
        let driver = process::spawn(&spec).map_err(|e| SessionError::Spawn(cause_chain(&e)))?;
        self.session.spawned.push(driver.command_line().to_owned());

        let settings = CollectorSettings {
            poll_interval: self.settings.poll_interval,
            final_drain: FINAL_DRAIN,
            terminate_grace: self.settings.terminate_grace,
        };
        let collector = spawn_collector(
            driver,
            self.session.output.clone(),
            settings,
            self.cancel.clone(),
            self.events_tx.clone(),
        )
        .map_err(|e| SessionError::Spawn(format!("collector thread: {e}")))?;
        self.session.collector = Some(collector);

        self.enter(Stage::Running);
        Ok(())
    }

    fn finalize(&mut self, reason: TerminationReason) {
        if self.session.termination.is_some() {
            return;
        }
        match &reason {
            TerminationReason::Error(e) => log::error!("Session failed: {e}"),
            reason => log::info!("Session ending: {reason}"),
        }
        self.session.termination = Some(reason);
        self.enter(Stage::Finalizing);
    }

    /// Releases every resource of the session. No step can skip the ones after it.
    fn release(&mut self) -> SessionReport {
        if self.session.termination.is_none() {
            self.finalize(TerminationReason::Cancelled);
        }
        self.cancel.cancel();

        for relay in self.session.relays.drain(..) {
            let direction = relay.direction();
            match relay.join() {
                Some(stats) => log::debug!(
                    "Relay {direction} joined, {} bytes in {} chunks",
                    stats.bytes,
                    stats.chunks
                ),
                None => log::error!("Relay {direction} panicked"),
            }
        }

        if let Some(collector) = self.session.collector.take() {
            match collector.join() {
                Some(mut driver) => {
                    driver.terminate(self.settings.terminate_grace);
                    self.session.driver_exit = self.session.driver_exit.or(driver.exit());
                }
                None => log::error!("Driver output collector panicked"),
            }
        }

        if let Some(mut decoder) = self.session.decoder.take() {
            log_captured_output(&mut decoder);
            decoder.terminate(self.settings.terminate_grace);
            self.session.decoder_exit = decoder.exit();
        }

        self.enter(Stage::TornDown);
        self.build_report()
    }

    fn build_report(&self) -> SessionReport {
        SessionReport {
            reason: self.session.termination.clone().unwrap_or(TerminationReason::Cancelled),
            output: self.session.output.snapshot(),
            driver_exit: self.session.driver_exit,
            decoder_exit: self.session.decoder_exit,
            spawned: self.session.spawned.clone(),
            started_at: self.session.started_at,
            duration: self.session.started.elapsed(),
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        if self.session.stage != Stage::Idle {
            self.teardown();
        }
    }
}

/// Logs up to [`MAX_OUTPUT_CHUNKS_PER_TICK`] chunks of buffered output without waiting for more.
/// Returns the number of chunks logged.
fn log_captured_output(process: &mut ProcessHandle) -> usize {
    let mut logged = 0;
    while logged < MAX_OUTPUT_CHUNKS_PER_TICK {
        let OutputRead::Chunk(chunk) = process.read_output(Duration::ZERO) else {
            break;
        };
        log::debug!(
            "[{} {}] {}",
            process.name(),
            chunk.stream,
            String::from_utf8_lossy(&chunk.bytes).trim_end()
        );
        logged += 1;
    }
    logged
}
