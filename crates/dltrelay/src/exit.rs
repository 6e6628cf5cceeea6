use std::fmt;
use std::io;

use dltrelay_daemon::DaemonError;
use dltrelay_frame::FrameError;
use dltrelay_transport::TransportError;

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const TRANSPORT_ERROR: i32 = 3;
/// The daemon answered a control request with a non-OK status.
pub const REQUEST_REJECTED: i32 = 4;
pub const PERMISSION_DENIED: i32 = 50;
pub const DATA_INVALID: i32 = 60;
pub const USAGE: i32 = 64;
pub const CONFIG_INVALID: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn transport_error(context: &str, err: TransportError) -> CliError {
    match err {
        TransportError::Bind { source, .. }
        | TransportError::Connect { source, .. }
        | TransportError::Accept(source)
        | TransportError::Io(source) => io_error(context, source),
        TransportError::InvalidEndpoint(_) | TransportError::PathTooLong { .. } => {
            CliError::new(USAGE, format!("{context}: {err}"))
        }
    }
}

pub fn frame_error(context: &str, err: FrameError) -> CliError {
    match err {
        FrameError::Io(source) => io_error(context, source),
        FrameError::Transport(err) => transport_error(context, err),
        FrameError::WouldBlock => CliError::new(TIMEOUT, format!("{context}: {err}")),
        FrameError::ConnectionClosed => CliError::new(FAILURE, format!("{context}: {err}")),
        FrameError::MessageTooLarge { .. }
        | FrameError::LengthTooShort { .. }
        | FrameError::InvalidStoragePattern
        | FrameError::InvalidEnvelopeMarker => {
            CliError::new(DATA_INVALID, format!("{context}: {err}"))
        }
    }
}

pub fn daemon_error(context: &str, err: DaemonError) -> CliError {
    match err {
        DaemonError::Transport(err) => transport_error(context, err),
        DaemonError::Frame(err) => frame_error(context, err),
        DaemonError::Io(source) => io_error(context, source),
        DaemonError::Persist { source, .. } => io_error(context, source),
        DaemonError::InvalidBufferConfig { .. }
        | DaemonError::InvalidLogLevel(_)
        | DaemonError::InvalidTraceStatus(_)
        | DaemonError::EmptyId => CliError::new(CONFIG_INVALID, format!("{context}: {err}")),
        other => CliError::new(INTERNAL, format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_socket_is_a_plain_failure() {
        let err = transport_error(
            "connect failed",
            TransportError::Connect {
                address: "/tmp/none.sock".to_string(),
                source: io::Error::from(io::ErrorKind::NotFound),
            },
        );
        assert_eq!(err.code, FAILURE);
        assert!(err.message.starts_with("connect failed: "));
    }

    #[test]
    fn bad_ring_buffer_sizes_are_config_errors() {
        let err = daemon_error(
            "daemon failed to start",
            DaemonError::InvalidBufferConfig {
                min: 10,
                max: 5,
                step: 1,
            },
        );
        assert_eq!(err.code, CONFIG_INVALID);
    }

    #[test]
    fn nested_frame_errors_keep_the_io_kind() {
        let err = daemon_error(
            "write failed",
            DaemonError::Frame(FrameError::Io(io::Error::from(
                io::ErrorKind::PermissionDenied,
            ))),
        );
        assert_eq!(err.code, PERMISSION_DENIED);
        assert_eq!(
            frame_error("send failed", FrameError::WouldBlock).code,
            TIMEOUT
        );
    }
}
