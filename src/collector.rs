use std::{
    sync::{Arc, Mutex, MutexGuard},
    thread::JoinHandle,
    time::{Duration, Instant},
};

use crate::{
    events::{CancelToken, EventSender, SessionEvent},
    process::{OutputRead, ProcessHandle, ProcessStatus},
};

/// The driver's captured stdout and stderr, in arrival order. Appended to by the collector thread
/// and read by the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer(Arc<Mutex<Vec<u8>>>);

impl OutputBuffer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, bytes: &[u8]) {
        self.lock().extend_from_slice(bytes);
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.lock().clone()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // A panic while holding the lock cannot leave a byte buffer in an invalid state
    fn lock(&self) -> MutexGuard<'_, Vec<u8>> {
        self.0.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CollectorSettings {
    /// Liveness check interval, also the longest a single output read waits
    pub poll_interval: Duration,
    /// Upper bound for draining output after the driver exited
    pub final_drain: Duration,
    /// SIGTERM grace when the collector is cancelled
    pub terminate_grace: Duration,
}

/// The running collector thread. Joining hands the driver's process handle back.
pub struct CollectorTask {
    handle: JoinHandle<ProcessHandle>,
}

impl CollectorTask {
    /// Waits for the thread. Returns `None` if it panicked, in which case the driver handle was
    /// dropped, and thereby terminated, during unwinding.
    #[must_use]
    pub fn join(self) -> Option<ProcessHandle> {
        self.handle.join().ok()
    }
}

/// Starts draining `driver` into `output` until it exits or `cancel` is set. On exit, one final
/// drain picks up output written just before, then [`SessionEvent::DriverExited`] is sent.
/// On cancel the driver is terminated and no event is sent.
pub fn spawn_collector(
    mut driver: ProcessHandle,
    output: OutputBuffer,
    settings: CollectorSettings,
    cancel: CancelToken,
    events: EventSender,
) -> std::io::Result<CollectorTask> {
    let name = driver.name().to_owned();
    let handle = std::thread::Builder::new().name(format!("{name}-collector")).spawn(move || {
        let mut lines = LineLogger::new(&name);
        log::info!("Collecting output of {name}");

        loop {
            if cancel.is_cancelled() {
                driver.terminate(settings.terminate_grace);
                drain(&mut driver, &output, &mut lines, settings.poll_interval);
                lines.flush();
                log::info!("Stopped collecting {name}: session cancelled");
                return driver;
            }

            match driver.read_output(settings.poll_interval) {
                OutputRead::Chunk(chunk) => {
                    output.append(&chunk.bytes);
                    lines.push(&chunk.bytes);
                }
                OutputRead::Idle => {}
                // Streams closed before the process exited, keep polling its status
                OutputRead::Eof => std::thread::sleep(settings.poll_interval),
            }

            if let ProcessStatus::Exited(exit) = driver.poll() {
                drain(&mut driver, &output, &mut lines, settings.final_drain);
                lines.flush();
                log::info!("{name} exited with {exit}, {} bytes of output", output.len());
                let _ = events.send(SessionEvent::DriverExited(exit));
                return driver;
            }
        }
    })?;

    Ok(CollectorTask { handle })
}

/// Appends everything still buffered, waiting at most `budget` in total
fn drain(driver: &mut ProcessHandle, output: &OutputBuffer, lines: &mut LineLogger, budget: Duration) {
    let deadline = Instant::now() + budget;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            log::warn!("Output of {} still open after final drain", driver.name());
            return;
        }
        match driver.read_output(remaining) {
            OutputRead::Chunk(chunk) => {
                output.append(&chunk.bytes);
                lines.push(&chunk.bytes);
            }
            OutputRead::Idle | OutputRead::Eof => return,
        }
    }
}

/// Logs complete output lines as they arrive
struct LineLogger {
    name: String,
    partial: Vec<u8>,
}

impl LineLogger {
    fn new(name: &str) -> Self {
        Self { name: name.to_owned(), partial: Vec::new() }
    }

    fn push(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        while let Some(end) = self.partial.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=end).collect();
            log::info!("[{}] {}", self.name, String::from_utf8_lossy(&line).trim_end());
        }
    }

    fn flush(&mut self) {
        if !self.partial.is_empty() {
            log::info!("[{}] {}", self.name, String::from_utf8_lossy(&self.partial));
            self.partial.clear();
        }
    }
}
