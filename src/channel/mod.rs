mod backoff;
pub mod memory;
pub mod serial;
pub mod tcp;

pub use backoff::{Backoff, RetryPolicy};

use std::time::Instant;

pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// Signals that the endpoint could not be opened
    #[error("Could not open {endpoint}: {source}")]
    Connection {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },
    /// Signals that the underlying receive failed. Not recoverable on its own.
    #[error("Read failed: {0}")]
    Read(#[source] std::io::Error),
    /// Signals that the underlying send failed, e.g. on a broken pipe
    #[error("Write failed: {0}")]
    Write(#[source] std::io::Error),
    /// The channel, or its peer, has been closed
    #[error("Channel closed")]
    Closed,
    /// A connection attempt was abandoned before its retry budget ran out
    #[error("Connection attempt to {0} aborted")]
    Aborted(String),
}

/// The receiving side of a channel backend.
pub trait ByteSource: Send {
    /// Reads up to `buf.len()` bytes, waiting at most the backend's read timeout.
    /// `Ok(None)` signals that nothing arrived in time, an ended stream is [`ChannelError::Closed`].
    fn read_chunk(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>>;

    /// Releases the endpoint. Only called once.
    fn close(&mut self);
}

/// The sending side of a channel backend.
pub trait ByteSink: Send {
    /// Writes and flushes a prefix of `bytes`, waiting at most the backend's write timeout.
    /// Returns how many bytes were taken, `Ok(0)` if the peer accepted nothing in time.
    fn write_chunk(&mut self, bytes: &[u8]) -> ChannelResult<usize>;

    /// Releases the endpoint. Only called once.
    fn close(&mut self);
}

/// Opens a [`Channel`] to one endpoint, e.g. the device's serial port.
pub trait Connector: Send {
    /// Human-readable name of the endpoint, used for logging
    fn endpoint(&self) -> String;

    fn connect(&mut self) -> ChannelResult<Channel>;
}

/// One duplex byte stream endpoint. Split it to move each direction into its own thread.
pub struct Channel {
    reader: ReadHalf,
    writer: WriteHalf,
}

impl Channel {
    pub fn new(name: &str, source: Box<dyn ByteSource>, sink: Box<dyn ByteSink>) -> Self {
        Self { reader: ReadHalf::new(name, source), writer: WriteHalf::new(name, sink) }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.reader.name
    }

    pub fn read(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>> {
        self.reader.read(buf)
    }

    pub fn write(&mut self, bytes: &[u8]) -> ChannelResult<()> {
        self.writer.write(bytes)
    }

    pub fn close(&mut self) {
        self.reader.close();
        self.writer.close();
    }

    #[must_use]
    pub fn split(self) -> (ReadHalf, WriteHalf) {
        (self.reader, self.writer)
    }
}

/// Receiving direction of a [`Channel`]. Closed on drop.
pub struct ReadHalf {
    name: String,
    source: Box<dyn ByteSource>,
    open: bool,
    last_activity: Instant,
}

impl ReadHalf {
    fn new(name: &str, source: Box<dyn ByteSource>) -> Self {
        Self { name: name.to_owned(), source, open: true, last_activity: Instant::now() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>> {
        if !self.open {
            return Err(ChannelError::Closed);
        }

        let read = self.source.read_chunk(buf)?;
        if read.is_some() {
            self.last_activity = Instant::now();
        }
        Ok(read)
    }

    /// Time of the last successful read or write
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.source.close();
            log::debug!("Closed reading side of {}", self.name);
        }
    }
}

impl Drop for ReadHalf {
    fn drop(&mut self) {
        self.close();
    }
}

/// Sending direction of a [`Channel`]. Closed on drop.
pub struct WriteHalf {
    name: String,
    sink: Box<dyn ByteSink>,
    open: bool,
    last_activity: Instant,
}

impl WriteHalf {
    fn new(name: &str, sink: Box<dyn ByteSink>) -> Self {
        Self { name: name.to_owned(), sink, open: true, last_activity: Instant::now() }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writes as much of `bytes` as the peer takes within one write timeout
    pub fn write_some(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        if !self.open {
            return Err(ChannelError::Closed);
        }

        let written = self.sink.write_chunk(bytes)?;
        if written > 0 {
            self.last_activity = Instant::now();
        }
        Ok(written)
    }

    /// Writes all of `bytes`, however long the peer takes
    pub fn write(&mut self, mut bytes: &[u8]) -> ChannelResult<()> {
        while !bytes.is_empty() {
            let written = self.write_some(bytes)?;
            bytes = &bytes[written..];
        }
        Ok(())
    }

    /// Time of the last successful read or write
    #[must_use]
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn close(&mut self) {
        if std::mem::replace(&mut self.open, false) {
            self.sink.close();
            log::debug!("Closed writing side of {}", self.name);
        }
    }
}

impl Drop for WriteHalf {
    fn drop(&mut self) {
        self.close();
    }
}

/// Calls `connector` until it succeeds or `policy` is exhausted, sleeping with backoff in between.
/// `abort` is checked before every attempt and while sleeping, returning true gives up early
/// with [`ChannelError::Aborted`].
pub fn connect_with_retry(
    connector: &mut dyn Connector,
    policy: RetryPolicy,
    mut abort: impl FnMut() -> bool,
) -> ChannelResult<Channel> {
    let endpoint = connector.endpoint();
    let mut backoff = Backoff::new(policy);
    let mut attempt = 1;

    loop {
        if abort() {
            return Err(ChannelError::Aborted(endpoint));
        }

        log::info!("Connecting to {endpoint} (attempt {attempt}/{})", policy.attempts);
        match connector.connect() {
            Ok(channel) => {
                log::info!("{endpoint} opened");
                return Ok(channel);
            }
            Err(e) if attempt >= policy.attempts => {
                log::error!("Could not connect to {endpoint} after {attempt} attempts, giving up");
                return Err(e);
            }
            Err(e) => log::warn!("Could not connect to {endpoint}: {e}"),
        }

        let deadline = Instant::now() + backoff.next_delay();
        while Instant::now() < deadline {
            if abort() {
                return Err(ChannelError::Aborted(endpoint));
            }
            std::thread::sleep(
                backoff::ABORT_CHECK_INTERVAL.min(deadline.saturating_duration_since(Instant::now())),
            );
        }
        attempt += 1;
    }
}
