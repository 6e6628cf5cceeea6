/// Errors raised while framing or deframing messages.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// A storage header did not start with `DLT\x01`.
    #[error("invalid storage header pattern")]
    InvalidStoragePattern,

    /// A control envelope did not start with `DUH\x01`.
    #[error("invalid control envelope marker")]
    InvalidEnvelopeMarker,

    /// The declared length cannot even hold the headers its flags announce.
    #[error("declared length {len} is shorter than the {header} header bytes")]
    LengthTooShort { len: usize, header: usize },

    /// The encoded message would not fit the 16-bit length field.
    #[error("message too large ({size} bytes, max {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// A write would have blocked past the configured send timeout.
    #[error("write timed out")]
    WouldBlock,

    /// An I/O error occurred while reading or writing.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The underlying socket rejected an option change.
    #[error(transparent)]
    Transport(#[from] dltrelay_transport::TransportError),

    /// The peer closed the connection.
    #[error("connection closed")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
