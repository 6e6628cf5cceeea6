use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;

use crate::error::Result;

/// A connected byte channel to a producer or consumer.
///
/// Producers always talk over a Unix domain socket; consumers may also attach
/// over TCP. Both halves of the daemon only see `Read + Write`.
pub struct IpcStream {
    inner: IpcStreamInner,
}

enum IpcStreamInner {
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
    Tcp(TcpStream),
}

impl Read for IpcStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.read(buf),
            IpcStreamInner::Tcp(stream) => stream.read(buf),
        }
    }
}

impl Write for IpcStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.write(buf),
            IpcStreamInner::Tcp(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &mut self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.flush(),
            IpcStreamInner::Tcp(stream) => stream.flush(),
        }
    }
}

impl IpcStream {
    #[cfg(unix)]
    pub(crate) fn from_unix(stream: std::os::unix::net::UnixStream) -> Self {
        Self {
            inner: IpcStreamInner::Unix(stream),
        }
    }

    pub(crate) fn from_tcp(stream: TcpStream) -> Self {
        Self {
            inner: IpcStreamInner::Tcp(stream),
        }
    }

    /// Short transport name for log fields.
    pub fn kind(&self) -> &'static str {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(_) => "unix",
            IpcStreamInner::Tcp(_) => "tcp",
        }
    }

    /// Bound blocking reads. `None` blocks forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_read_timeout(timeout).map_err(Into::into),
        }
    }

    /// Bound blocking writes. A write that exceeds the timeout fails with
    /// `WouldBlock`/`TimedOut`.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_write_timeout(timeout).map_err(Into::into),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.set_nonblocking(nonblocking).map_err(Into::into),
        }
    }

    /// Duplicate the descriptor so one thread can read while another writes.
    pub fn try_clone(&self) -> Result<Self> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => Ok(Self::from_unix(stream.try_clone()?)),
            IpcStreamInner::Tcp(stream) => Ok(Self::from_tcp(stream.try_clone()?)),
        }
    }

    /// Shut down both directions, waking any thread blocked in `read`.
    pub fn shutdown(&self) -> Result<()> {
        match &self.inner {
            #[cfg(unix)]
            IpcStreamInner::Unix(stream) => stream.shutdown(Shutdown::Both).map_err(Into::into),
            IpcStreamInner::Tcp(stream) => stream.shutdown(Shutdown::Both).map_err(Into::into),
        }
    }

    /// Process id of the peer on a local socket (Linux only).
    ///
    /// Used to label producer connections in logs; TCP peers report `None`.
    #[cfg(target_os = "linux")]
    pub fn peer_pid(&self) -> Option<u32> {
        use std::os::fd::AsRawFd;

        let fd = match &self.inner {
            IpcStreamInner::Unix(stream) => stream.as_raw_fd(),
            IpcStreamInner::Tcp(_) => return None,
        };

        let mut cred = libc::ucred {
            pid: 0,
            uid: 0,
            gid: 0,
        };
        let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;

        // SAFETY: `cred` and `len` point to writable locals of the sizes passed,
        // and `fd` belongs to a Unix stream owned by `self`.
        let rc = unsafe {
            libc::getsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_PEERCRED,
                (&mut cred as *mut libc::ucred).cast::<libc::c_void>(),
                &mut len,
            )
        };

        (rc == 0 && len as usize == std::mem::size_of::<libc::ucred>()).then_some(cred.pid as u32)
    }

    #[cfg(not(target_os = "linux"))]
    pub fn peer_pid(&self) -> Option<u32> {
        None
    }
}

impl std::fmt::Debug for IpcStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcStream").field("kind", &self.kind()).finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::os::unix::net::UnixStream;

    #[test]
    fn unix_pair_reads_and_writes() {
        let (left, right) = UnixStream::pair().unwrap();
        let mut left = IpcStream::from_unix(left);
        let mut right = IpcStream::from_unix(right);

        left.write_all(b"DUH\x01").unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).unwrap();

        assert_eq!(&buf, b"DUH\x01");
        assert_eq!(left.kind(), "unix");
    }

    #[test]
    fn shutdown_wakes_reader_with_eof() {
        let (left, right) = UnixStream::pair().unwrap();
        let left = IpcStream::from_unix(left);
        let mut right = IpcStream::from_unix(right);

        left.shutdown().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(right.read(&mut buf).unwrap(), 0);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn peer_pid_reports_own_process_on_pair() {
        let (left, _right) = UnixStream::pair().unwrap();
        let stream = IpcStream::from_unix(left);
        assert_eq!(stream.peer_pid(), Some(std::process::id()));
    }
}
