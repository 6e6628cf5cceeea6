//! Write side of the daemon: consumer channels, producer links and the
//! optional trace sink.

use std::io::Write;
use std::sync::{Mutex, MutexGuard, PoisonError};

use dltrelay_frame::{FrameError, MessageWriter};
use dltrelay_transport::{ConnectionId, IpcStream};
use tracing::{debug, error, info};

/// Why a write to a channel failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// The peer did not take the bytes within the send timeout.
    #[error("write would block")]
    WouldBlock,
    /// The peer is gone.
    #[error("channel closed")]
    Closed,
}

/// Something a whole message can be written to.
///
/// `parts` make up exactly one message and must not interleave with any
/// other message on the same channel.
pub trait Channel: Send {
    fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), ChannelError>;

    /// Tear the connection down so the peer sees end of stream.
    fn close(&mut self) {}
}

fn channel_error(err: FrameError) -> ChannelError {
    match err {
        FrameError::WouldBlock => ChannelError::WouldBlock,
        _ => ChannelError::Closed,
    }
}

impl<W: Write + Send> Channel for MessageWriter<W> {
    fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), ChannelError> {
        MessageWriter::write_parts(self, parts).map_err(channel_error)
    }
}

/// Write half of an accepted connection.
///
/// Closing shuts the socket down in both directions, which also ends the
/// reader thread holding the other half.
struct StreamChannel {
    writer: MessageWriter<IpcStream>,
}

impl Channel for StreamChannel {
    fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), ChannelError> {
        self.writer.write_parts(parts).map_err(channel_error)
    }

    fn close(&mut self) {
        if let Err(err) = self.writer.get_ref().shutdown() {
            debug!(error = %err, "socket shutdown failed");
        }
    }
}

/// Channel over an accepted stream, every write bounded by `timeout`.
pub fn stream_channel(
    stream: IpcStream,
    timeout: std::time::Duration,
) -> crate::error::Result<Box<dyn Channel>> {
    Ok(Box::new(StreamChannel {
        writer: MessageWriter::with_send_timeout(stream, timeout)?,
    }))
}

/// Result of writing one message to every consumer.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

/// The attached consumers.
///
/// A single mutex serializes every physical write, so a message written by
/// one caller can never be interleaved with another.
#[derive(Default)]
pub struct OutputChannels {
    channels: Mutex<Vec<(ConnectionId, Box<dyn Channel>)>>,
}

impl OutputChannels {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(ConnectionId, Box<dyn Channel>)>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a consumer. Returns the number of consumers afterwards.
    pub fn add(&self, id: ConnectionId, channel: Box<dyn Channel>) -> usize {
        let mut channels = self.lock();
        channels.push((id, channel));
        channels.len()
    }

    /// Drop a consumer and close its channel. Returns false if it was not
    /// registered.
    pub fn remove(&self, id: ConnectionId) -> bool {
        let mut channels = self.lock();
        let Some(pos) = channels.iter().position(|(existing, _)| *existing == id) else {
            return false;
        };
        let (_, mut channel) = channels.remove(pos);
        channel.close();
        true
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().iter().any(|(existing, _)| *existing == id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write one message to every consumer.
    ///
    /// Failing consumers are reported, not removed; the caller decides what
    /// a failure means for the delivery state.
    pub fn write_all(&self, parts: &[&[u8]]) -> WriteReport {
        let mut report = WriteReport::default();
        for (id, channel) in self.lock().iter_mut() {
            match channel.write_parts(parts) {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    info!(consumer = %id, error = %err, "consumer write failed");
                    report.failed.push(*id);
                }
            }
        }
        report
    }

    /// Write one message to a single consumer.
    pub fn write_to(&self, id: ConnectionId, parts: &[&[u8]]) -> Result<(), ChannelError> {
        let mut channels = self.lock();
        let (_, channel) = channels
            .iter_mut()
            .find(|(existing, _)| *existing == id)
            .ok_or(ChannelError::Closed)?;
        channel.write_parts(parts)
    }
}

/// Best-effort destination for every delivered message in stored form.
pub trait TraceSink: Send {
    fn write(&mut self, header: &[u8], payload: &[u8]) -> std::io::Result<()>;
}

/// Trace sink over any writer, e.g. an append-mode file.
pub struct WriterTraceSink<W> {
    inner: W,
}

impl<W: Write + Send> WriterTraceSink<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> TraceSink for WriterTraceSink<W> {
    fn write(&mut self, header: &[u8], payload: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(header)?;
        self.inner.write_all(payload)?;
        self.inner.flush()
    }
}

/// Wraps a [`TraceSink`] so that a failure is logged once per failure
/// streak, not once per message.
pub struct TraceOutput {
    sink: Box<dyn TraceSink>,
    failing: bool,
}

impl TraceOutput {
    pub fn new(sink: Box<dyn TraceSink>) -> Self {
        Self {
            sink,
            failing: false,
        }
    }

    pub fn write(&mut self, header: &[u8], payload: &[u8]) {
        match self.sink.write(header, payload) {
            Ok(()) => {
                if self.failing {
                    info!("trace sink recovered");
                }
                self.failing = false;
            }
            Err(err) => {
                if !self.failing {
                    error!(error = %err, "trace sink write failed");
                }
                self.failing = true;
            }
        }
    }

    pub fn is_failing(&self) -> bool {
        self.failing
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Channel that records every message; can be switched to fail.
    #[derive(Clone, Default)]
    pub struct RecordingChannel {
        pub messages: Arc<Mutex<Vec<Vec<u8>>>>,
        pub fail_with: Arc<Mutex<Option<ChannelError>>>,
        pub closed: Arc<AtomicBool>,
    }

    impl RecordingChannel {
        pub fn messages(&self) -> Vec<Vec<u8>> {
            self.messages.lock().expect("lock").clone()
        }

        pub fn fail(&self, err: Option<ChannelError>) {
            *self.fail_with.lock().expect("lock") = err;
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Channel for RecordingChannel {
        fn write_parts(&mut self, parts: &[&[u8]]) -> Result<(), ChannelError> {
            if let Some(err) = *self.fail_with.lock().expect("lock") {
                return Err(err);
            }
            self.messages.lock().expect("lock").push(parts.concat());
            Ok(())
        }

        fn close(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
