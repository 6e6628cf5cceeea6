use std::path::PathBuf;

/// Errors that can occur while opening or using a byte channel.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Failed to bind a listening socket.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        source: std::io::Error,
    },

    /// Failed to connect to a listening socket.
    #[error("failed to connect to {address}: {source}")]
    Connect {
        address: String,
        source: std::io::Error,
    },

    /// Failed to accept an incoming connection.
    #[error("failed to accept connection: {0}")]
    Accept(std::io::Error),

    /// An I/O error occurred on a connected stream.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The socket path does not fit in `sockaddr_un`.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// The endpoint string could not be parsed.
    #[error("invalid endpoint {0:?} (expected a socket path or tcp://host:port)")]
    InvalidEndpoint(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;
