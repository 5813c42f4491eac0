use std::{
    io::{ErrorKind, Read, Write},
    time::Duration,
};

use serialport::SerialPort;

use super::{ByteSink, ByteSource, Channel, ChannelError, ChannelResult, Connector};

/// Opens the device's serial link. The port is typically gone while firmware is uploaded, so it
/// is only opened once the upload finished.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    pub path: String,
    pub baudrate: u32,
    /// Upper bound for a single read, which is also how quickly a relay notices cancellation
    pub read_timeout: Duration,
}

impl Connector for SerialConnector {
    fn endpoint(&self) -> String {
        format!("serial port {}", self.path)
    }

    fn connect(&mut self) -> ChannelResult<Channel> {
        let connection_error =
            |e: serialport::Error| ChannelError::Connection { endpoint: self.endpoint(), source: e.into() };

        let port = serialport::new(&self.path, self.baudrate)
            .parity(serialport::Parity::None)
            .timeout(self.read_timeout)
            .open()
            .map_err(connection_error)?;
        let clone = port.try_clone().map_err(connection_error)?;

        Ok(Channel::new(
            &self.path,
            Box::new(SerialSource { port: Some(port) }),
            Box::new(SerialSink { port: Some(clone) }),
        ))
    }
}

struct SerialSource {
    port: Option<Box<dyn SerialPort>>,
}

impl ByteSource for SerialSource {
    fn read_chunk(&mut self, buf: &mut [u8]) -> ChannelResult<Option<usize>> {
        let port = self.port.as_mut().ok_or(ChannelError::Closed)?;
        match port.read(buf) {
            Ok(0) => Ok(None),
            Ok(n) => Ok(Some(n)),
            Err(e) if is_idle(e.kind()) => Ok(None),
            Err(e) => Err(ChannelError::Read(e)),
        }
    }

    fn close(&mut self) {
        self.port.take();
    }
}

struct SerialSink {
    port: Option<Box<dyn SerialPort>>,
}

impl ByteSink for SerialSink {
    fn write_chunk(&mut self, bytes: &[u8]) -> ChannelResult<usize> {
        let port = self.port.as_mut().ok_or(ChannelError::Closed)?;
        let written = match port.write(bytes) {
            Ok(n) => n,
            Err(e) if is_idle(e.kind()) => return Ok(0),
            Err(e) => return Err(ChannelError::Write(e)),
        };
        port.flush().map_err(ChannelError::Write)?;
        Ok(written)
    }

    fn close(&mut self) {
        self.port.take();
    }
}

fn is_idle(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted)
}
