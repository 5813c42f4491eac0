//! Signals shared between the orchestrator and its worker threads. Workers never touch the
//! session directly; they observe the [`CancelToken`] and report through [`SessionEvent`]s.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc, Arc,
    },
    time::{Duration, Instant},
};

use crate::{process::Exit, relay::Direction};

/// Granularity of [`CancelToken::sleep`]
const SLEEP_SLICE: Duration = Duration::from_millis(10);

pub type EventSender = mpsc::Sender<SessionEvent>;
pub type EventReceiver = mpsc::Receiver<SessionEvent>;

/// Messages from worker threads to the orchestrator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The first chunk went through the given relay direction
    FirstBytes(Direction),
    /// A relay direction stopped because its source or destination failed
    RelayFailed { direction: Direction, cause: String },
    /// The driver process exited and its output has been drained
    DriverExited(Exit),
}

/// A broadcast stop signal. Cloning yields a handle to the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// The underlying flag, e.g. for registering it as a signal handler
    #[must_use]
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.0.clone()
    }

    /// Sleeps for `duration` unless cancelled earlier. Returns true if the token was cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        loop {
            if self.is_cancelled() {
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            std::thread::sleep(SLEEP_SLICE.min(deadline - now));
        }
    }
}
