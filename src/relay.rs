use std::thread::JoinHandle;

use crate::{
    channel::{ReadHalf, WriteHalf},
    events::{CancelToken, EventSender, SessionEvent},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum Direction {
    #[strum(to_string = "DUT->decoder")]
    DeviceToDecoder,
    #[strum(to_string = "decoder->DUT")]
    DecoderToDevice,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub bytes: u64,
    pub chunks: u64,
}

/// A running relay thread
pub struct RelayTask {
    direction: Direction,
    handle: JoinHandle<RelayStats>,
}

impl RelayTask {
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Waits for the thread to exit. Returns `None` if it panicked.
    #[must_use]
    pub fn join(self) -> Option<RelayStats> {
        self.handle.join().ok()
    }
}

/// Forwards everything read from `source` to `sink` until either side fails or `cancel` is set.
/// Each read is written out immediately, chunks are never batched. A sink that stops accepting
/// bytes is retried one write timeout at a time, so cancellation is still noticed. Both halves
/// are closed when the relay ends.
///
/// The first forwarded chunk is announced with [`SessionEvent::FirstBytes`], a failure with
/// [`SessionEvent::RelayFailed`]. Failures after cancellation are expected and not reported.
pub fn spawn_relay(
    direction: Direction,
    source: ReadHalf,
    sink: WriteHalf,
    chunk_size: usize,
    cancel: CancelToken,
    events: EventSender,
) -> std::io::Result<RelayTask> {
    let name = match direction {
        Direction::DeviceToDecoder => "relay-dut-decoder",
        Direction::DecoderToDevice => "relay-decoder-dut",
    };
    let handle = std::thread::Builder::new().name(name.into()).spawn(move || {
        relay_loop(direction, source, sink, chunk_size.max(1), &cancel, &events)
    })?;

    Ok(RelayTask { direction, handle })
}

fn relay_loop(
    direction: Direction,
    mut source: ReadHalf,
    mut sink: WriteHalf,
    chunk_size: usize,
    cancel: &CancelToken,
    events: &EventSender,
) -> RelayStats {
    let mut stats = RelayStats::default();
    let mut buffer = vec![0; chunk_size];
    log::info!("Relaying {direction}: {} -> {}", source.name(), sink.name());

    let failure = loop {
        if cancel.is_cancelled() {
            break None;
        }

        let n = match source.read(&mut buffer) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => break Some(format!("reading {} failed: {e}", source.name())),
        };

        let chunk = &buffer[..n];
        log::trace!("{direction}: {chunk:02x?}");
        match write_until_cancelled(&mut sink, chunk, cancel) {
            Ok(true) => {}
            Ok(false) => break None,
            Err(e) => break Some(format!("writing {} failed: {e}", sink.name())),
        }

        if stats.chunks == 0 {
            let _ = events.send(SessionEvent::FirstBytes(direction));
        }
        stats.chunks += 1;
        stats.bytes += n as u64;
    };

    let idle = source.last_activity().max(sink.last_activity()).elapsed();
    source.close();
    sink.close();

    match failure {
        Some(cause) if !cancel.is_cancelled() => {
            log::error!("Relay {direction} stopped, {cause}");
            let _ = events.send(SessionEvent::RelayFailed { direction, cause });
        }
        Some(cause) => log::debug!("Relay {direction} ended during shutdown, {cause}"),
        None => log::info!(
            "Relay {direction} stopped after {} bytes, idle for {idle:?}",
            stats.bytes
        ),
    }
    stats
}

/// Returns `Ok(false)` if `cancel` was set before all of `chunk` went out
fn write_until_cancelled(
    sink: &mut WriteHalf,
    mut chunk: &[u8],
    cancel: &CancelToken,
) -> crate::channel::ChannelResult<bool> {
    while !chunk.is_empty() {
        if cancel.is_cancelled() {
            return Ok(false);
        }
        let written = sink.write_some(chunk)?;
        chunk = &chunk[written..];
    }
    Ok(true)
}
