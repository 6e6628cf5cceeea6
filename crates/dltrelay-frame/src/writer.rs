use std::io::{ErrorKind, Write};
use std::time::Duration;

use dltrelay_transport::IpcStream;

use crate::error::{FrameError, Result};

/// Writes whole messages to a stream.
///
/// Header and payload go out back to back; a message is either written
/// completely or the writer reports an error and the connection is expected
/// to be dropped. Blocking past the stream's write timeout surfaces as
/// [`FrameError::WouldBlock`].
pub struct MessageWriter<T> {
    inner: T,
}

impl<T: Write> MessageWriter<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    /// Write `parts` in order as one message.
    pub fn write_parts(&mut self, parts: &[&[u8]]) -> Result<()> {
        for part in parts {
            self.write_all(part)?;
        }
        self.flush()
    }

    fn write_all(&mut self, mut data: &[u8]) -> Result<()> {
        while !data.is_empty() {
            match self.inner.write(data) {
                Ok(0) => return Err(FrameError::ConnectionClosed),
                Ok(n) => data = &data[n..],
                Err(err) => classify(err)?,
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        loop {
            match self.inner.flush() {
                Ok(()) => return Ok(()),
                Err(err) => classify(err)?,
            }
        }
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl MessageWriter<IpcStream> {
    /// Wrap a connected stream and bound every write by `timeout`.
    pub fn with_send_timeout(inner: IpcStream, timeout: Duration) -> Result<Self> {
        inner.set_write_timeout(Some(timeout))?;
        Ok(Self::new(inner))
    }
}

/// `Ok(())` means "retry".
fn classify(err: std::io::Error) -> Result<()> {
    match err.kind() {
        ErrorKind::Interrupted => Ok(()),
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Err(FrameError::WouldBlock),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
            Err(FrameError::ConnectionClosed)
        }
        _ => Err(FrameError::Io(err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn writes_parts_in_order() {
        let mut writer = MessageWriter::new(Vec::new());
        writer.write_parts(&[b"head", b"", b"payload"]).unwrap();
        assert_eq!(writer.into_inner(), b"headpayload");
    }

    #[test]
    fn short_writes_are_completed() {
        let mut writer = MessageWriter::new(TrickleWriter::default());
        writer.write_parts(&[b"abcdef"]).unwrap();
        assert_eq!(writer.get_ref().data, b"abcdef");
    }

    #[test]
    fn zero_write_is_connection_closed() {
        let mut writer = MessageWriter::new(ZeroWriter);
        let err = writer.write_parts(&[b"x"]).unwrap_err();
        assert!(matches!(err, FrameError::ConnectionClosed));
    }

    #[test]
    fn timeout_is_would_block() {
        let mut writer = MessageWriter::new(ErrWriter(ErrorKind::WouldBlock));
        assert!(matches!(
            writer.write_parts(&[b"x"]).unwrap_err(),
            FrameError::WouldBlock
        ));
        let mut writer = MessageWriter::new(ErrWriter(ErrorKind::BrokenPipe));
        assert!(matches!(
            writer.write_parts(&[b"x"]).unwrap_err(),
            FrameError::ConnectionClosed
        ));
    }

    #[test]
    fn flushes_after_message() {
        let mut writer = MessageWriter::new(FlushTrackingWriter::default());
        writer.write_parts(&[b"abc"]).unwrap();
        assert_eq!(writer.get_ref().flushes, 1);
    }

    #[test]
    fn full_socket_times_out() {
        let (left, mut right) = std::os::unix::net::UnixStream::pair().unwrap();
        left.set_write_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut writer = MessageWriter::new(left);

        let chunk = vec![0u8; 64 * 1024];
        let err = loop {
            if let Err(err) = writer.write_parts(&[&chunk]) {
                break err;
            }
        };
        assert!(matches!(err, FrameError::WouldBlock));

        let mut buf = [0u8; 16];
        assert_eq!(right.read(&mut buf).unwrap(), 16);
    }

    #[derive(Default)]
    struct TrickleWriter {
        data: Vec<u8>,
    }

    impl Write for TrickleWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let n = buf.len().min(2);
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ZeroWriter;

    impl Write for ZeroWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Ok(0)
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    struct ErrWriter(ErrorKind);

    impl Write for ErrWriter {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(self.0))
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct FlushTrackingWriter {
        flushes: usize,
    }

    impl Write for FlushTrackingWriter {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            self.flushes += 1;
            Ok(())
        }
    }
}
