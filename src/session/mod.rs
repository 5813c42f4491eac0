mod orchestrator;
mod settings;

pub use orchestrator::{Collaborators, Orchestrator};
pub use settings::{DriverStart, SessionSettings};

use std::{
    borrow::Cow,
    fmt::Display,
    time::{Duration, Instant, SystemTime},
};

use crate::{
    collector::{CollectorTask, OutputBuffer},
    error::SessionError,
    process::{Exit, ProcessHandle},
    relay::RelayTask,
};

/// Lifecycle of a test session. `TornDown` is terminal and reachable from every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Stage {
    Idle,
    Uploading,
    AwaitingDecoder,
    AwaitingDriver,
    Running,
    Finalizing,
    TornDown,
}

/// Why a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationReason {
    /// The driver ran and exited with 0
    Success,
    /// The driver ran and reported failing tests
    Failure { exit_code: u32 },
    Timeout(String),
    /// Stopped from outside, e.g. by Ctrl-C
    Cancelled,
    Error(SessionError),
}

impl TerminationReason {
    /// Maps a driver exit to the session result. Only an orderly exit counts as a reported result.
    #[must_use]
    pub fn from_driver_exit(exit: Exit) -> Self {
        match exit {
            Exit::Code(0) => Self::Success,
            Exit::Code(exit_code) => Self::Failure { exit_code },
            Exit::Signal(signal) => {
                Self::Error(SessionError::DriverCrash(format!("killed by signal {signal}")))
            }
            Exit::Unknown => {
                Self::Error(SessionError::DriverCrash("exit status could not be determined".into()))
            }
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }

    /// Process exit code of the bridge binary for this result
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::Success => 0,
            Self::Failure { .. } => 1,
            _ => 2,
        }
    }
}

impl Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure { exit_code } => write!(f, "failure (driver exit code {exit_code})"),
            Self::Timeout(cause) => write!(f, "timeout: {cause}"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Error(e) => write!(f, "error: {e}"),
        }
    }
}

impl From<SessionError> for TerminationReason {
    fn from(e: SessionError) -> Self {
        Self::Error(e)
    }
}

/// The finalized result of one session, handed to the [`crate::collaborators::ReportSink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub reason: TerminationReason,
    /// Everything the driver wrote to stdout and stderr
    pub output: Vec<u8>,
    pub driver_exit: Option<Exit>,
    /// How the decoder process ended, `None` if it was never spawned
    pub decoder_exit: Option<Exit>,
    /// Command lines of all processes spawned during the session, in order
    pub spawned: Vec<String>,
    pub started_at: SystemTime,
    pub duration: Duration,
}

impl SessionReport {
    /// Human-readable cause of the termination
    #[must_use]
    pub fn cause(&self) -> String {
        self.reason.to_string()
    }

    #[must_use]
    pub fn output_text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.output)
    }
}

/// State of one test run, owned by the orchestrator's thread
struct Session {
    stage: Stage,
    started_at: SystemTime,
    started: Instant,
    output: OutputBuffer,
    termination: Option<TerminationReason>,
    decoder: Option<ProcessHandle>,
    /// Owns the driver's process handle while the driver runs
    collector: Option<CollectorTask>,
    relays: Vec<RelayTask>,
    driver_started: bool,
    driver_exit: Option<Exit>,
    decoder_exit: Option<Exit>,
    spawned: Vec<String>,
}

impl Session {
    fn new() -> Self {
        Self {
            stage: Stage::Idle,
            started_at: SystemTime::now(),
            started: Instant::now(),
            output: OutputBuffer::new(),
            termination: None,
            decoder: None,
            collector: None,
            relays: Vec::new(),
            driver_started: false,
            driver_exit: None,
            decoder_exit: None,
            spawned: Vec::new(),
        }
    }
}
