use std::{
    io::{ErrorKind, Read, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    time::Duration,
};

use super::{ByteSink, ByteSource, Channel, ChannelError, ChannelResult, Connector};

/// Connects to the socket the decoder process listens on. No handshake is performed, the decoder's
/// own protocol is relayed unchanged.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub host: String,
    pub port: u16,
    /// Timeout of a single connect attempt
    pub connect_timeout: Duration,
    /// Bounds every read and every write on the socket
    pub read_timeout: Duration,
}

impl TcpConnector {
    fn open(&self) -> std::io::Result<TcpStream> {
        let mut last_error = std::io::Error::from(ErrorKind::AddrNotAvailable);
        for addr in (self.host.as_str(), self.port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_write_timeout(Some(self.read_timeout))?;
                    return Ok(stream);
                }
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}

impl Connector for TcpConnector {
    fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    fn connect(&mut self) -> ChannelResult<Channel> {
        let stream = self
            .open()
            .and_then(|s| s.try_clone().map(|clone| (s, clone)))
            .map_err(|source| ChannelError::Connection { endpoint: self.endpoint(), source });
        let (stream, clone) = stream?;

        Ok(Channel::new(
            &self.endpoint(),
            Box::new(TcpSource { stream: Some(stream) }),
            Box::new(TcpSink { stream: Some(clone) }),
        ))
    }
}

struct TcpSource {
    stream: Option<TcpStream>,
}

impl ByteSource for TcpSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        match stream.read(buf) {
            Ok(0) => Err(ChannelError::Closed),
            Ok(n) => Ok(Some(n)),
            Err(e) if is_idle(e.kind()) => Ok(None),
            Err(e) => Err(ChannelError::Read(e)),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Read);
        }
    }
}

struct TcpSink {
    stream: Option<TcpStream>,
}

impl ByteSink for TcpSink {
    fn write_chunk(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        let stream = self.stream.as_mut().ok_or(ChannelError::Closed)?;
        match stream.write(bytes) {
            Ok(0) if !bytes.is_empty() => Err(ChannelError::Write(ErrorKind::WriteZero.into())),
            Ok(n) => Ok(n),
            Err(e) if is_idle(e.kind()) => Ok(0),
            Err(e) => Err(ChannelError::Write(e)),
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }
}

fn is_idle(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted)
}
