use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TransportError};
use crate::tcp::TcpSocket;
use crate::traits::IpcStream;
#[cfg(unix)]
use crate::uds::UnixDomainSocket;

const TCP_SCHEME: &str = "tcp://";

/// Where a listener binds or a client connects.
///
/// `tcp://host:port` selects TCP; anything else is a Unix socket path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self> {
        if let Some(address) = s.strip_prefix(TCP_SCHEME) {
            if address.rsplit_once(':').is_none_or(|(host, port)| {
                host.is_empty() || port.parse::<u16>().is_err()
            }) {
                return Err(TransportError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Tcp(address.to_string()));
        }
        if s.is_empty() {
            return Err(TransportError::InvalidEndpoint(s.to_string()));
        }
        Ok(Self::Unix(PathBuf::from(s)))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "{}", path.display()),
            Self::Tcp(address) => write!(f, "{TCP_SCHEME}{address}"),
        }
    }
}

impl Endpoint {
    /// Bind a listener. `mode` only applies to Unix sockets.
    pub fn bind(&self, mode: u32) -> Result<Listener> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => Ok(Listener::Unix(UnixDomainSocket::bind_with_mode(path, mode)?)),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::InvalidEndpoint(self.to_string())),
            Self::Tcp(address) => {
                let _ = mode;
                Ok(Listener::Tcp(TcpSocket::bind(address)?))
            }
        }
    }

    pub fn connect(&self) -> Result<IpcStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(path) => UnixDomainSocket::connect(path),
            #[cfg(not(unix))]
            Self::Unix(_) => Err(TransportError::InvalidEndpoint(self.to_string())),
            Self::Tcp(address) => TcpSocket::connect(address),
        }
    }
}

/// A bound listener of either kind.
pub enum Listener {
    #[cfg(unix)]
    Unix(UnixDomainSocket),
    Tcp(TcpSocket),
}

impl Listener {
    pub fn accept(&self) -> Result<IpcStream> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.accept(),
            Self::Tcp(socket) => socket.accept(),
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => socket.set_nonblocking(nonblocking),
            Self::Tcp(socket) => socket.set_nonblocking(nonblocking),
        }
    }

    /// Endpoint clients should connect to; resolves a TCP port 0 bind to the
    /// port actually assigned.
    pub fn endpoint(&self) -> Endpoint {
        match self {
            #[cfg(unix)]
            Self::Unix(socket) => Endpoint::Unix(socket.path().to_path_buf()),
            Self::Tcp(socket) => Endpoint::Tcp(socket.local_addr().to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_and_unix_endpoints() {
        assert_eq!(
            "tcp://127.0.0.1:3490".parse::<Endpoint>().unwrap(),
            Endpoint::Tcp("127.0.0.1:3490".to_string())
        );
        assert_eq!(
            "/tmp/dlt-ctrl.sock".parse::<Endpoint>().unwrap(),
            Endpoint::Unix(PathBuf::from("/tmp/dlt-ctrl.sock"))
        );
    }

    #[test]
    fn rejects_malformed_tcp_endpoint() {
        assert!("tcp://localhost".parse::<Endpoint>().is_err());
        assert!("tcp://:3490".parse::<Endpoint>().is_err());
        assert!("tcp://host:port".parse::<Endpoint>().is_err());
        assert!("".parse::<Endpoint>().is_err());
    }

    #[test]
    fn display_round_trips_through_parse() {
        for text in ["tcp://10.0.0.1:3490", "/run/dlt.sock"] {
            let endpoint: Endpoint = text.parse().unwrap();
            assert_eq!(endpoint.to_string(), text);
        }
    }

    #[test]
    fn tcp_listener_reports_assigned_port() {
        let listener = Endpoint::Tcp("127.0.0.1:0".to_string()).bind(0).unwrap();
        match listener.endpoint() {
            Endpoint::Tcp(address) => assert!(!address.ends_with(":0")),
            other => panic!("unexpected endpoint {other:?}"),
        }
    }
}
