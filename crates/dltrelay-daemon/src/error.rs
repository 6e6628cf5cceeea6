use std::path::PathBuf;

use dltrelay_frame::Id4;

use crate::state::DeliveryState;

/// Errors raised by the daemon core.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] dltrelay_transport::TransportError),

    /// Frame-level error.
    #[error("frame error: {0}")]
    Frame(#[from] dltrelay_frame::FrameError),

    /// I/O error outside of a connection (runtime files, trace sink).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No user list exists for the ECU.
    #[error("unknown ECU {0}")]
    UnknownEcu(Id4),

    /// An identifier was empty where one is required.
    #[error("empty identifier")]
    EmptyId,

    /// The application is not registered.
    #[error("application {apid} not registered on {ecu}")]
    ApplicationNotFound { ecu: Id4, apid: Id4 },

    /// The context is not registered.
    #[error("context {apid}:{ctid} not registered on {ecu}")]
    ContextNotFound { ecu: Id4, apid: Id4, ctid: Id4 },

    /// Log level outside -1..=6.
    #[error("invalid log level {0}")]
    InvalidLogLevel(i8),

    /// Trace status outside -1..=1.
    #[error("invalid trace status {0}")]
    InvalidTraceStatus(i8),

    /// A state change that is not an edge of the delivery state machine.
    #[error("illegal delivery state transition {from} -> {to}")]
    IllegalTransition {
        from: DeliveryState,
        to: DeliveryState,
    },

    /// Ring buffer parameters that cannot describe a valid buffer.
    #[error("invalid ring buffer sizes: min {min}, max {max}, step {step}")]
    InvalidBufferConfig { min: usize, max: usize, step: usize },

    /// A runtime configuration file could not be read or written.
    #[error("runtime file {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// No runtime directory is configured.
    #[error("no runtime directory configured")]
    NoRuntimeStore,

    /// A forced send reached no consumer, or a direct send failed.
    #[error("send failed")]
    SendFailed,

    /// The ring buffer rejected the message; it was discarded.
    #[error("ring buffer full, message discarded")]
    BufferFull,
}

pub type Result<T> = std::result::Result<T, DaemonError>;
