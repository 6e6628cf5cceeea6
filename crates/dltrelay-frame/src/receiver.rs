use std::io::{ErrorKind, Read};

use bytes::{Buf, BytesMut};

use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 64 * 1024;
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Per-connection byte accumulator.
///
/// Reads append to the back; decoders look at [`Receiver::as_slice`] and the
/// caller drops what they consumed with [`Receiver::remove`]. Whatever is
/// left over (a partial message) waits for the next read.
#[derive(Debug)]
pub struct Receiver {
    buf: BytesMut,
}

impl Receiver {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_BUFFER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn bytes_received(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Drop `count` bytes from the front (clamped to what is buffered).
    pub fn remove(&mut self, count: usize) {
        let count = count.min(self.buf.len());
        self.buf.advance(count);
    }

    /// Move the unread remainder to the start of the allocation so the
    /// buffer does not creep forward across many partial reads.
    pub fn move_to_begin(&mut self) {
        if self.buf.capacity() < INITIAL_BUFFER_CAPACITY / 2 {
            let mut fresh = BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY.max(self.buf.len()));
            fresh.extend_from_slice(&self.buf);
            self.buf = fresh;
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Read once from `source` and append what arrived.
    ///
    /// Returns the number of bytes read. End of stream is reported as
    /// `FrameError::ConnectionClosed`; `Interrupted` is retried.
    pub fn receive_from<R: Read>(&mut self, source: &mut R) -> Result<usize> {
        let mut chunk = [0u8; READ_CHUNK_SIZE];
        loop {
            match source.read(&mut chunk) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => {
                    self.buf.extend_from_slice(&chunk[..n]);
                    return Ok(n);
                }
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }
}

impl Default for Receiver {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::codec::{decode_message, Message};
    use crate::id::Id4;

    fn wire(payload: &'static [u8]) -> Vec<u8> {
        Message::log(Id4::new("APP"), Id4::new("CTX"), 0, payload)
            .to_network_bytes()
            .unwrap()
            .to_vec()
    }

    #[test]
    fn accumulates_until_message_complete() {
        let bytes = wire(b"slow");
        let mut source = ByteByByteReader { bytes, pos: 0 };
        let mut receiver = Receiver::new();

        let message = loop {
            receiver.receive_from(&mut source).unwrap();
            if let Some((message, used)) = decode_message(receiver.as_slice()).unwrap() {
                receiver.remove(used);
                break message;
            }
        };

        assert_eq!(message.payload.as_ref(), b"slow");
        assert!(receiver.is_empty());
    }

    #[test]
    fn remove_keeps_remainder_for_next_read() {
        let mut receiver = Receiver::new();
        let mut bytes = wire(b"one");
        let first_len = bytes.len();
        bytes.extend_from_slice(&wire(b"two")[..5]);
        receiver.extend_from_slice(&bytes);

        let (_, used) = decode_message(receiver.as_slice()).unwrap().unwrap();
        assert_eq!(used, first_len);
        receiver.remove(used);
        receiver.move_to_begin();

        assert_eq!(receiver.bytes_received(), 5);
        assert!(decode_message(receiver.as_slice()).unwrap().is_none());
    }

    #[test]
    fn remove_is_clamped() {
        let mut receiver = Receiver::new();
        receiver.extend_from_slice(b"abc");
        receiver.remove(10);
        assert_eq!(receiver.bytes_received(), 0);
    }

    #[test]
    fn end_of_stream_is_connection_closed() {
        let mut receiver = Receiver::new();
        let err = receiver
            .receive_from(&mut Cursor::new(Vec::<u8>::new()))
            .unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn interrupted_read_retries() {
        let mut source = InterruptedThenData {
            interrupted: false,
            bytes: b"data".to_vec(),
        };
        let mut receiver = Receiver::new();
        assert_eq!(receiver.receive_from(&mut source).unwrap(), 4);
        assert_eq!(receiver.as_slice(), b"data");
    }

    #[test]
    fn would_block_propagates() {
        struct Blocked;
        impl Read for Blocked {
            fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::from(ErrorKind::WouldBlock))
            }
        }
        let err = Receiver::new().receive_from(&mut Blocked).unwrap_err();
        assert!(matches!(err, FrameError::Io(e) if e.kind() == ErrorKind::WouldBlock));
    }

    #[test]
    fn reads_from_socket_pair() {
        use std::io::Write;
        let (mut left, mut right) = std::os::unix::net::UnixStream::pair().unwrap();
        left.write_all(&wire(b"uds")).unwrap();

        let mut receiver = Receiver::new();
        receiver.receive_from(&mut right).unwrap();
        let (message, _) = decode_message(receiver.as_slice()).unwrap().unwrap();
        assert_eq!(message.payload.as_ref(), b"uds");
    }

    struct ByteByByteReader {
        bytes: Vec<u8>,
        pos: usize,
    }

    impl Read for ByteByByteReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if self.pos >= self.bytes.len() || buf.is_empty() {
                return Ok(0);
            }
            buf[0] = self.bytes[self.pos];
            self.pos += 1;
            Ok(1)
        }
    }

    struct InterruptedThenData {
        interrupted: bool,
        bytes: Vec<u8>,
    }

    impl Read for InterruptedThenData {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            if !self.interrupted {
                self.interrupted = true;
                return Err(std::io::Error::from(ErrorKind::Interrupted));
            }
            let n = self.bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&self.bytes[..n]);
            self.bytes.drain(..n);
            Ok(n)
        }
    }
}
