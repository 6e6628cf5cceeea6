use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// Listening Unix domain socket bound to a filesystem path.
///
/// The socket file is removed on drop, unless something else has since been
/// placed at the same path.
pub struct UnixDomainSocket {
    listener: UnixListener,
    path: PathBuf,
    identity: Option<(u64, u64)>,
}

impl UnixDomainSocket {
    /// Permission mode applied to freshly bound socket files.
    pub const DEFAULT_SOCKET_MODE: u32 = 0o600;

    #[cfg(target_os = "linux")]
    const MAX_PATH_LEN: usize = 108;
    #[cfg(not(target_os = "linux"))]
    const MAX_PATH_LEN: usize = 104;

    /// Bind with [`Self::DEFAULT_SOCKET_MODE`].
    pub fn bind(path: impl AsRef<Path>) -> Result<Self> {
        Self::bind_with_mode(path, Self::DEFAULT_SOCKET_MODE)
    }

    /// Bind and listen at `path`, replacing a stale socket file left behind by
    /// a previous daemon. Regular files at `path` are never removed.
    pub fn bind_with_mode(path: impl AsRef<Path>, mode: u32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let len = path.as_os_str().len();
        if len >= Self::MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len,
                max: Self::MAX_PATH_LEN,
            });
        }

        let bind_error = |source: std::io::Error| TransportError::Bind {
            address: path.display().to_string(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_error(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_error)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_error)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .map_err(bind_error)?;
        let identity = std::fs::symlink_metadata(&path)
            .map(|m| (m.dev(), m.ino()))
            .map_err(bind_error)?;

        info!(?path, mode = %format!("{mode:o}"), "listening on unix domain socket");

        Ok(Self {
            listener,
            path,
            identity: Some(identity),
        })
    }

    /// Accept the next connection (blocking).
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, _addr) = self.listener.accept().map_err(TransportError::Accept)?;
        debug!(path = ?self.path, "accepted unix connection");
        Ok(IpcStream::from_unix(stream))
    }

    /// Connect to a daemon socket (blocking).
    pub fn connect(path: impl AsRef<Path>) -> Result<IpcStream> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).map_err(|source| TransportError::Connect {
            address: path.display().to_string(),
            source,
        })?;
        debug!(?path, "connected to unix domain socket");
        Ok(IpcStream::from_unix(stream))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// With `true`, [`Self::accept`] fails with `WouldBlock` instead of
    /// waiting when no connection is pending.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking).map_err(Into::into)
    }
}

impl Drop for UnixDomainSocket {
    fn drop(&mut self) {
        let Some((dev, ino)) = self.identity else {
            return;
        };
        match std::fs::symlink_metadata(&self.path) {
            Ok(m) if m.file_type().is_socket() && m.dev() == dev && m.ino() == ino => {
                debug!(path = ?self.path, "removing socket file");
                let _ = std::fs::remove_file(&self.path);
            }
            Ok(_) => debug!(path = ?self.path, "socket path was replaced; leaving it"),
            Err(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("dltrelay-uds-{tag}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn bind_accept_connect() {
        let dir = temp_dir("accept");
        let sock_path = dir.join("app.sock");

        let listener = UnixDomainSocket::bind(&sock_path).unwrap();
        assert!(sock_path.exists());

        let client_path = sock_path.clone();
        let handle = std::thread::spawn(move || {
            let mut client = UnixDomainSocket::connect(&client_path).unwrap();
            client.write_all(b"DUH\x01").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"DUH\x01");
        handle.join().unwrap();

        drop(listener);
        assert!(!sock_path.exists(), "socket file should be removed on drop");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn rebind_replaces_stale_socket() {
        let dir = temp_dir("stale");
        let sock_path = dir.join("stale.sock");

        let first = UnixDomainSocket::bind(&sock_path).unwrap();
        std::mem::forget(first);
        let second = UnixDomainSocket::bind(&sock_path);
        assert!(second.is_ok());

        drop(second);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn path_too_long_is_rejected() {
        let long_path = "/tmp/".to_string() + &"d".repeat(200) + ".sock";
        let result = UnixDomainSocket::bind(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn explicit_mode_is_applied() {
        let dir = temp_dir("mode");
        let sock_path = dir.join("mode.sock");

        let listener = UnixDomainSocket::bind_with_mode(&sock_path, 0o666).unwrap();
        let mode = std::fs::metadata(&sock_path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o666);

        drop(listener);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn refuses_to_replace_regular_file() {
        let dir = temp_dir("file");
        let sock_path = dir.join("plain.sock");
        std::fs::write(&sock_path, b"not a socket").unwrap();

        let result = UnixDomainSocket::bind(&sock_path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));
        assert!(sock_path.exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
