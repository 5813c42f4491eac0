use std::{
    fmt::Display,
    io::Read,
    sync::mpsc,
    time::Duration,
};

use subprocess::{ExitStatus, Popen, PopenConfig, Redirection};

const OUTPUT_BUFFER_SIZE: usize = 1024;

/// Grace period used when a handle is dropped without being terminated first
const DROP_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Could not launch `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: subprocess::PopenError,
    },
    #[error("Empty command line for {0}")]
    EmptyCommand(String),
    #[error("Could not start output reader: {0}")]
    Io(#[from] std::io::Error),
}

/// Whether a spawned process gets its own process group. A process in its own group does not
/// receive signals sent to the bridge's terminal, e.g. Ctrl-C, and is only stopped through
/// [`ProcessHandle::terminate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Isolation {
    Inherit,
    #[default]
    OwnGroup,
}

/// Everything needed to launch one external process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Short name used in logs, e.g. "decoder"
    pub name: String,
    /// Executable followed by its arguments
    pub argv: Vec<String>,
    /// Pipe stdout/stderr back to the bridge instead of inheriting them
    pub capture_output: bool,
    pub isolation: Isolation,
}

impl ProcessSpec {
    pub fn new(name: &str, argv: Vec<String>) -> Self {
        Self { name: name.to_owned(), argv, capture_output: false, isolation: Isolation::default() }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    #[must_use]
    pub fn command_line(&self) -> String {
        self.argv.join(" ")
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Code(u32),
    Signal(u8),
    /// The OS did not report a usable status
    Unknown,
}

impl From<ExitStatus> for Exit {
    fn from(status: ExitStatus) -> Self {
        match status {
            ExitStatus::Exited(code) => Exit::Code(code),
            ExitStatus::Signaled(signal) => Exit::Signal(signal),
            ExitStatus::Other(_) | ExitStatus::Undetermined => Exit::Unknown,
        }
    }
}

impl Display for Exit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Exit::Code(code) => write!(f, "exit code {code}"),
            Exit::Signal(signal) => write!(f, "signal {signal}"),
            Exit::Unknown => write!(f, "unknown status"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Exited(Exit),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    pub stream: Stream,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRead {
    Chunk(OutputChunk),
    /// Nothing arrived within the wait
    Idle,
    /// All captured streams are closed, or output is not captured
    Eof,
}

/// One spawned external process. Terminated when dropped.
///
/// Captured streams are drained by one reader thread each, so reading output never blocks on a
/// pipe whose process has already exited. The readers end on EOF.
pub struct ProcessHandle {
    name: String,
    command_line: String,
    popen: Popen,
    exit: Option<Exit>,
    output: Option<mpsc::Receiver<OutputChunk>>,
}

/// Launches `spec`. The process's stdin is closed right away.
pub fn spawn(spec: &ProcessSpec) -> Result<ProcessHandle, ProcessError> {
    if spec.argv.is_empty() {
        return Err(ProcessError::EmptyCommand(spec.name.clone()));
    }
    let command_line = spec.command_line();

    let output_redirection =
        |capture: bool| if capture { Redirection::Pipe } else { Redirection::None };
    let config = PopenConfig {
        stdin: Redirection::Pipe,
        stdout: output_redirection(spec.capture_output),
        stderr: output_redirection(spec.capture_output),
        // dropping the handle terminates the process instead of waiting for it
        detached: true,
        #[cfg(unix)]
        setpgid: spec.isolation == Isolation::OwnGroup,
        ..Default::default()
    };

    let mut popen = Popen::create(spec.argv.as_slice(), config)
        .map_err(|source| ProcessError::Spawn { command: command_line.clone(), source })?;
    drop(popen.stdin.take());

    let output = if spec.capture_output {
        let (tx, rx) = mpsc::channel();
        let streams = [(Stream::Stdout, popen.stdout.take()), (Stream::Stderr, popen.stderr.take())];
        for (stream, file) in streams {
            if let Some(file) = file {
                if let Err(e) = spawn_reader(&spec.name, stream, file, tx.clone()) {
                    let _ = popen.kill();
                    return Err(e.into());
                }
            }
        }
        Some(rx)
    } else {
        None
    };

    log::info!("Started {} (pid {:?}): {command_line}", spec.name, popen.pid());
    Ok(ProcessHandle { name: spec.name.clone(), command_line, popen, exit: None, output })
}

fn spawn_reader(
    name: &str,
    stream: Stream,
    mut file: std::fs::File,
    tx: mpsc::Sender<OutputChunk>,
) -> std::io::Result<()> {
    std::thread::Builder::new().name(format!("{name}-{stream}")).spawn(move || {
        let mut buffer = [0; OUTPUT_BUFFER_SIZE];
        loop {
            match file.read(&mut buffer) {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = OutputChunk { stream, bytes: buffer[..n].to_vec() };
                    if tx.send(chunk).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::warn!("Reading {stream} failed: {e}");
                    break;
                }
            }
        }
    })?;
    Ok(())
}

impl ProcessHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn command_line(&self) -> &str {
        &self.command_line
    }

    /// The exit status, once the process has been observed to exit
    #[must_use]
    pub fn exit(&self) -> Option<Exit> {
        self.exit
    }

    pub fn poll(&mut self) -> ProcessStatus {
        if self.exit.is_none() {
            self.exit = self.popen.poll().map(Exit::from);
        }
        match self.exit {
            Some(exit) => ProcessStatus::Exited(exit),
            None => ProcessStatus::Running,
        }
    }

    pub fn is_alive(&mut self) -> bool {
        self.poll() == ProcessStatus::Running
    }

    /// Waits at most `wait` for the next chunk of captured output
    pub fn read_output(&mut self, wait: Duration) -> OutputRead {
        let Some(rx) = &self.output else {
            return OutputRead::Eof;
        };

        match rx.recv_timeout(wait) {
            Ok(chunk) => OutputRead::Chunk(chunk),
            Err(mpsc::RecvTimeoutError::Timeout) => OutputRead::Idle,
            Err(mpsc::RecvTimeoutError::Disconnected) => OutputRead::Eof,
        }
    }

    /// Sends SIGTERM and escalates to SIGKILL if the process is still alive after `grace`.
    /// Does nothing if the process already exited.
    pub fn terminate(&mut self, grace: Duration) {
        if !self.is_alive() {
            return;
        }

        log::info!("Terminating {}", self.name);
        if let Err(e) = self.popen.terminate() {
            log::warn!("Could not signal {}: {e}", self.name);
        }
        if self.wait(grace) {
            return;
        }

        log::warn!("{} ignored SIGTERM, killing it", self.name);
        if let Err(e) = self.popen.kill() {
            log::error!("Could not kill {}: {e}", self.name);
        }
        if !self.wait(grace) {
            log::error!("{} did not stop after SIGKILL", self.name);
        }
    }

    fn wait(&mut self, timeout: Duration) -> bool {
        match self.popen.wait_timeout(timeout) {
            Ok(Some(status)) => {
                self.exit = Some(status.into());
                log::info!("{} stopped with {}", self.name, Exit::from(status));
                true
            }
            Ok(None) => false,
            Err(e) => {
                log::error!("Waiting for {} failed: {e}", self.name);
                false
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.terminate(DROP_GRACE);
    }
}
