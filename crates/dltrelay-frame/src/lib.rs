//! DLT wire formats.
//!
//! Three byte formats meet in the relay:
//! - DLT messages (standard header, optional extra fields and extended
//!   header, payload), with an optional 16-byte storage header in front
//!   when stored and an optional `DLS\x01` serial header on serial links
//! - the producer control envelope (`DUH\x01` + type) that local
//!   applications use to register, unregister and log
//! - control service payloads exchanged with consumers
//!
//! Decoders never read past a declared length and report `Ok(None)` until a
//! whole unit is buffered, so callers can feed partial reads through
//! [`Receiver`] without managing offsets themselves.

pub mod codec;
pub mod envelope;
pub mod error;
pub mod header;
pub mod id;
pub mod receiver;
pub mod service;
pub mod writer;

#[cfg(feature = "async")]
pub mod tokio_codec;

pub use codec::{
    decode_message, decode_stored_message, find_serial_header, strip_serial_header, Message,
    MAX_MESSAGE_SIZE,
};
pub use envelope::{
    decode_user_message, find_control_marker, Injection, LogLevelUpdate, RegisterApplication,
    RegisterContext, UserMessage, USER_HEADER_PATTERN, USER_HEADER_SIZE,
};
pub use error::{FrameError, Result};
pub use header::{ExtendedHeader, HeaderExtra, StorageHeader};
pub use id::{Id4, ID_SIZE};
pub use receiver::Receiver;
pub use writer::MessageWriter;
