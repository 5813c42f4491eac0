//! In-process channels, used to simulate the device and the decoder without hardware.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        mpsc, Arc,
    },
    time::Duration,
};

use super::{ByteSink, ByteSource, Channel, ChannelError, ChannelResult, Connector};

/// Creates connected channel pairs and keeps count of their open halves.
#[derive(Debug, Clone)]
pub struct Link {
    read_timeout: Duration,
    open_halves: Arc<AtomicUsize>,
}

impl Link {
    #[must_use]
    pub fn new(read_timeout: Duration) -> Self {
        Self { read_timeout, open_halves: Arc::new(AtomicUsize::new(0)) }
    }

    /// Returns two channels, where bytes written to one can be read from the other
    #[must_use]
    pub fn pair(&self, name: &str) -> (Channel, Channel) {
        let (a_tx, a_rx) = mpsc::channel();
        let (b_tx, b_rx) = mpsc::channel();

        let near = Channel::new(
            &format!("{name} (near)"),
            Box::new(self.source(b_rx)),
            Box::new(self.sink(a_tx)),
        );
        let far = Channel::new(
            &format!("{name} (far)"),
            Box::new(self.source(a_rx)),
            Box::new(self.sink(b_tx)),
        );
        (near, far)
    }

    /// Number of halves of all pairs of this link that are not closed yet
    #[must_use]
    pub fn open_halves(&self) -> usize {
        self.open_halves.load(Ordering::SeqCst)
    }

    fn source(&self, rx: mpsc::Receiver<Vec<u8>>) -> MemorySource {
        self.open_halves.fetch_add(1, Ordering::SeqCst);
        MemorySource {
            rx: Some(rx),
            pending: Vec::new(),
            read_timeout: self.read_timeout,
            open_halves: self.open_halves.clone(),
        }
    }

    fn sink(&self, tx: mpsc::Sender<Vec<u8>>) -> MemorySink {
        self.open_halves.fetch_add(1, Ordering::SeqCst);
        MemorySink { tx: Some(tx), open_halves: self.open_halves.clone() }
    }
}

struct MemorySource {
    rx: Option<mpsc::Receiver<Vec<u8>>>,
    /// Bytes of a received chunk that did not fit into the last read
    pending: Vec<u8>,
    read_timeout: Duration,
    open_halves: Arc<AtomicUsize>,
}

impl ByteSource for MemorySource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>> {
        let rx = self.rx.as_ref().ok_or(ChannelError::Closed)?;

        while self.pending.is_empty() {
            match rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.pending = chunk,
                Err(mpsc::RecvTimeoutError::Timeout) => return Ok(None),
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(ChannelError::Closed),
            }
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(Some(n))
    }

    fn close(&mut self) {
        self.rx.take();
        self.open_halves.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySink {
    tx: Option<mpsc::Sender<Vec<u8>>>,
    open_halves: Arc<AtomicUsize>,
}

impl ByteSink for MemorySink {
    fn write_chunk(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        let tx = self.tx.as_ref().ok_or(ChannelError::Closed)?;
        if bytes.is_empty() {
            return Ok(0);
        }
        tx.send(bytes.to_vec())
            .map_err(|_| ChannelError::Write(std::io::ErrorKind::BrokenPipe.into()))?;
        Ok(bytes.len())
    }

    fn close(&mut self) {
        self.tx.take();
        self.open_halves.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Hands out a prepared channel on the first connect and refuses afterwards.
pub struct OnceConnector {
    name: String,
    channel: Option<Channel>,
}

impl OnceConnector {
    #[must_use]
    pub fn new(channel: Channel) -> Self {
        Self { name: channel.name().to_owned(), channel: Some(channel) }
    }
}

impl Connector for OnceConnector {
    fn endpoint(&self) -> String {
        self.name.clone()
    }

    fn connect(&mut self) -> ChannelResult<Channel> {
        self.channel.take().ok_or_else(|| ChannelError::Connection {
            endpoint: self.name.clone(),
            source: std::io::ErrorKind::ConnectionRefused.into(),
        })
    }
}
