use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use tracing::{debug, info};

use crate::error::{Result, TransportError};
use crate::traits::IpcStream;

/// Listening TCP socket for remote consumers.
pub struct TcpSocket {
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl TcpSocket {
    /// Bind and listen on `address` (`host:port`; port 0 picks a free port).
    pub fn bind(address: &str) -> Result<Self> {
        let bind_error = |source: std::io::Error| TransportError::Bind {
            address: address.to_string(),
            source,
        };
        let listener = TcpListener::bind(address).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        info!(%local_addr, "listening on tcp");
        Ok(Self {
            listener,
            local_addr,
        })
    }

    /// Accept the next connection (blocking). Nagle is disabled on the
    /// accepted stream so small control responses go out immediately.
    pub fn accept(&self) -> Result<IpcStream> {
        let (stream, peer) = self.listener.accept().map_err(TransportError::Accept)?;
        stream.set_nodelay(true)?;
        debug!(%peer, "accepted tcp connection");
        Ok(IpcStream::from_tcp(stream))
    }

    pub fn connect(address: &str) -> Result<IpcStream> {
        let connect_error = |source: std::io::Error| TransportError::Connect {
            address: address.to_string(),
            source,
        };
        let addrs: Vec<SocketAddr> = address
            .to_socket_addrs()
            .map_err(connect_error)?
            .collect();
        let stream = TcpStream::connect(addrs.as_slice()).map_err(connect_error)?;
        stream.set_nodelay(true)?;
        debug!(address, "connected over tcp");
        Ok(IpcStream::from_tcp(stream))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.listener.set_nonblocking(nonblocking).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn bind_accept_connect_loopback() {
        let listener = TcpSocket::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().to_string();

        let handle = std::thread::spawn(move || {
            let mut client = TcpSocket::connect(&address).unwrap();
            client.write_all(b"DLT\x01").unwrap();
        });

        let mut server = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"DLT\x01");
        assert_eq!(server.kind(), "tcp");
        handle.join().unwrap();
    }

    #[test]
    fn connect_to_closed_port_fails() {
        let port = {
            let probe = TcpSocket::bind("127.0.0.1:0").unwrap();
            probe.local_addr().port()
        };
        let err = TcpSocket::connect(&format!("127.0.0.1:{port}")).unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
