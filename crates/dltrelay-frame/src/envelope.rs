//! Control envelope between producers and the daemon.
//!
//! Every producer message starts with an 8-byte user header: the marker
//! `DUH\x01` and a little-endian message type. What follows depends on the
//! type; all fixed-size fields are little-endian and packed.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{decode_message, Message};
use crate::error::{FrameError, Result};
use crate::id::{Id4, ID_SIZE};

pub const USER_HEADER_PATTERN: [u8; 4] = *b"DUH\x01";
pub const USER_HEADER_SIZE: usize = 8;

/// Descriptions longer than this are truncated on receipt.
pub const DESCRIPTION_MAX: usize = 255;

/// Wire value producers use for "not set"; decoded as default (-1).
const NOT_SET: i8 = -2;
const DEFAULT: i8 = -1;

/// Numeric message types of the user header.
pub mod kind {
    pub const LOG: u32 = 1;
    pub const REGISTER_APPLICATION: u32 = 2;
    pub const UNREGISTER_APPLICATION: u32 = 3;
    pub const REGISTER_CONTEXT: u32 = 4;
    pub const UNREGISTER_CONTEXT: u32 = 5;
    pub const LOG_LEVEL: u32 = 6;
    pub const INJECTION: u32 = 7;
    pub const OVERFLOW: u32 = 8;
    pub const APP_LL_TS: u32 = 9;
    pub const LOG_SHM: u32 = 10;
    pub const LOG_MODE: u32 = 11;
    pub const LOG_STATE: u32 = 12;
    pub const MARKER: u32 = 13;
    pub const NOT_SUPPORTED: u32 = 16;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterApplication {
    pub apid: Id4,
    pub pid: i32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterContext {
    pub apid: Id4,
    pub ctid: Id4,
    /// Index into the producer's local level table.
    pub log_level_pos: i32,
    pub log_level: i8,
    pub trace_status: i8,
    pub pid: i32,
    pub description: String,
}

/// Daemon → producer: new effective level and status for one context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevelUpdate {
    pub log_level: u8,
    pub trace_status: u8,
    pub log_level_pos: i32,
}

/// Daemon → producer: injected service call for one context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Injection {
    pub log_level_pos: i32,
    pub service_id: u32,
    pub data: Bytes,
}

/// One control envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserMessage {
    Log(Message),
    RegisterApplication(RegisterApplication),
    UnregisterApplication { apid: Id4, pid: i32 },
    RegisterContext(RegisterContext),
    UnregisterContext { apid: Id4, ctid: Id4, pid: i32 },
    LogLevel(LogLevelUpdate),
    Injection(Injection),
    Overflow { overflow_counter: u32, apid: Id4 },
    AppLogLevelTraceStatus { apid: Id4, log_level: i8, trace_status: i8 },
    LogShm,
    LogMode(i8),
    LogState(i8),
    Marker,
    /// A type this daemon does not handle; only the user header is consumed.
    Unsupported(u32),
}

/// Offset of the next envelope marker in `src`.
///
/// The caller drops everything before the returned offset; that is the
/// whole resynchronization contract for producer streams.
pub fn find_control_marker(src: &[u8]) -> Option<usize> {
    src.windows(USER_HEADER_PATTERN.len())
        .position(|window| window == USER_HEADER_PATTERN)
}

/// Decode one envelope from the front of `src`.
///
/// `src` must start at a marker (see [`find_control_marker`]). Returns
/// `Ok(None)` until the full envelope is buffered.
pub fn decode_user_message(src: &[u8]) -> Result<Option<(UserMessage, usize)>> {
    if src.len() < USER_HEADER_SIZE {
        return Ok(None);
    }
    if src[..4] != USER_HEADER_PATTERN {
        return Err(FrameError::InvalidEnvelopeMarker);
    }
    let message_type = u32::from_le_bytes([src[4], src[5], src[6], src[7]]);
    let mut body = Fields::new(&src[USER_HEADER_SIZE..]);

    if message_type == kind::LOG {
        return Ok(decode_message(body.rest())?
            .map(|(message, used)| (UserMessage::Log(message), USER_HEADER_SIZE + used)));
    }

    Ok(decode_body(message_type, &mut body)
        .map(|message| (message, USER_HEADER_SIZE + body.consumed())))
}

fn decode_body(message_type: u32, body: &mut Fields<'_>) -> Option<UserMessage> {
    let message = match message_type {
        kind::REGISTER_APPLICATION => UserMessage::RegisterApplication(RegisterApplication {
            apid: body.id()?,
            pid: body.i32()?,
            description: body.description()?,
        }),
        kind::UNREGISTER_APPLICATION => UserMessage::UnregisterApplication {
            apid: body.id()?,
            pid: body.i32()?,
        },
        kind::REGISTER_CONTEXT => UserMessage::RegisterContext(RegisterContext {
            apid: body.id()?,
            ctid: body.id()?,
            log_level_pos: body.i32()?,
            log_level: not_set_to_default(body.i8()?),
            trace_status: not_set_to_default(body.i8()?),
            pid: body.i32()?,
            description: body.description()?,
        }),
        kind::UNREGISTER_CONTEXT => UserMessage::UnregisterContext {
            apid: body.id()?,
            ctid: body.id()?,
            pid: body.i32()?,
        },
        kind::LOG_LEVEL => UserMessage::LogLevel(LogLevelUpdate {
            log_level: body.u8()?,
            trace_status: body.u8()?,
            log_level_pos: body.i32()?,
        }),
        kind::INJECTION => {
            let log_level_pos = body.i32()?;
            let service_id = body.u32()?;
            let len = body.u32()? as usize;
            UserMessage::Injection(Injection {
                log_level_pos,
                service_id,
                data: Bytes::copy_from_slice(body.take(len)?),
            })
        }
        kind::OVERFLOW => UserMessage::Overflow {
            overflow_counter: body.u32()?,
            apid: body.id()?,
        },
        kind::APP_LL_TS => UserMessage::AppLogLevelTraceStatus {
            apid: body.id()?,
            log_level: not_set_to_default(body.i8()?),
            trace_status: not_set_to_default(body.i8()?),
        },
        kind::LOG_SHM => UserMessage::LogShm,
        kind::LOG_MODE => UserMessage::LogMode(body.i8()?),
        kind::LOG_STATE => UserMessage::LogState(body.i8()?),
        kind::MARKER => UserMessage::Marker,
        other => UserMessage::Unsupported(other),
    };
    Some(message)
}

impl UserMessage {
    pub fn message_type(&self) -> u32 {
        match self {
            Self::Log(_) => kind::LOG,
            Self::RegisterApplication(_) => kind::REGISTER_APPLICATION,
            Self::UnregisterApplication { .. } => kind::UNREGISTER_APPLICATION,
            Self::RegisterContext(_) => kind::REGISTER_CONTEXT,
            Self::UnregisterContext { .. } => kind::UNREGISTER_CONTEXT,
            Self::LogLevel(_) => kind::LOG_LEVEL,
            Self::Injection(_) => kind::INJECTION,
            Self::Overflow { .. } => kind::OVERFLOW,
            Self::AppLogLevelTraceStatus { .. } => kind::APP_LL_TS,
            Self::LogShm => kind::LOG_SHM,
            Self::LogMode(_) => kind::LOG_MODE,
            Self::LogState(_) => kind::LOG_STATE,
            Self::Marker => kind::MARKER,
            Self::Unsupported(other) => *other,
        }
    }

    /// Encode header and body.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        dst.put_slice(&USER_HEADER_PATTERN);
        dst.put_u32_le(self.message_type());
        match self {
            Self::Log(message) => message.encode_network(dst)?,
            Self::RegisterApplication(app) => {
                dst.put_slice(app.apid.as_bytes());
                dst.put_i32_le(app.pid);
                put_description(dst, &app.description);
            }
            Self::UnregisterApplication { apid, pid } => {
                dst.put_slice(apid.as_bytes());
                dst.put_i32_le(*pid);
            }
            Self::RegisterContext(ctx) => {
                dst.put_slice(ctx.apid.as_bytes());
                dst.put_slice(ctx.ctid.as_bytes());
                dst.put_i32_le(ctx.log_level_pos);
                dst.put_i8(ctx.log_level);
                dst.put_i8(ctx.trace_status);
                dst.put_i32_le(ctx.pid);
                put_description(dst, &ctx.description);
            }
            Self::UnregisterContext { apid, ctid, pid } => {
                dst.put_slice(apid.as_bytes());
                dst.put_slice(ctid.as_bytes());
                dst.put_i32_le(*pid);
            }
            Self::LogLevel(update) => {
                dst.put_u8(update.log_level);
                dst.put_u8(update.trace_status);
                dst.put_i32_le(update.log_level_pos);
            }
            Self::Injection(injection) => {
                dst.put_i32_le(injection.log_level_pos);
                dst.put_u32_le(injection.service_id);
                dst.put_u32_le(injection.data.len() as u32);
                dst.put_slice(&injection.data);
            }
            Self::Overflow {
                overflow_counter,
                apid,
            } => {
                dst.put_u32_le(*overflow_counter);
                dst.put_slice(apid.as_bytes());
            }
            Self::AppLogLevelTraceStatus {
                apid,
                log_level,
                trace_status,
            } => {
                dst.put_slice(apid.as_bytes());
                dst.put_i8(*log_level);
                dst.put_i8(*trace_status);
            }
            Self::LogMode(mode) | Self::LogState(mode) => dst.put_i8(*mode),
            Self::LogShm | Self::Marker | Self::Unsupported(_) => {}
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

fn not_set_to_default(value: i8) -> i8 {
    if value == NOT_SET {
        DEFAULT
    } else {
        value
    }
}

fn put_description(dst: &mut BytesMut, description: &str) {
    dst.put_u32_le(description.len() as u32);
    dst.put_slice(description.as_bytes());
}

/// Bounds-checked little-endian field reader; `None` means "need more bytes".
struct Fields<'a> {
    src: &'a [u8],
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, offset: 0 }
    }

    fn consumed(&self) -> usize {
        self.offset
    }

    fn rest(&self) -> &'a [u8] {
        &self.src[self.offset..]
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.src.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    fn array<const N: usize>(&mut self) -> Option<[u8; N]> {
        self.take(N)?.try_into().ok()
    }

    fn u8(&mut self) -> Option<u8> {
        self.array::<1>().map(|b| b[0])
    }

    fn i8(&mut self) -> Option<i8> {
        self.u8().map(|b| b as i8)
    }

    fn i32(&mut self) -> Option<i32> {
        self.array().map(i32::from_le_bytes)
    }

    fn u32(&mut self) -> Option<u32> {
        self.array().map(u32::from_le_bytes)
    }

    fn id(&mut self) -> Option<Id4> {
        self.array::<ID_SIZE>().map(Id4::from_bytes)
    }

    /// Length-prefixed description, truncated to [`DESCRIPTION_MAX`] bytes.
    /// Bytes beyond the cap stay in the stream and are skipped by resync.
    fn description(&mut self) -> Option<String> {
        let declared = self.u32()? as usize;
        let raw = self.take(declared.min(DESCRIPTION_MAX))?;
        let text = raw.split(|b| *b == 0).next().unwrap_or_default();
        Some(String::from_utf8_lossy(text).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn register_app(apid: &str) -> UserMessage {
        UserMessage::RegisterApplication(RegisterApplication {
            apid: Id4::new(apid),
            pid: 4242,
            description: "Test application".to_string(),
        })
    }

    #[test]
    fn register_application_layout() {
        let bytes = register_app("APP1").to_bytes().unwrap();
        assert_eq!(&bytes[..4], b"DUH\x01");
        assert_eq!(&bytes[4..8], &2u32.to_le_bytes());
        assert_eq!(&bytes[8..12], b"APP1");
        assert_eq!(&bytes[12..16], &4242i32.to_le_bytes());
        assert_eq!(&bytes[16..20], &16u32.to_le_bytes());
        assert_eq!(bytes.len(), 20 + 16);
    }

    #[test]
    fn decode_each_kind() {
        let messages = vec![
            register_app("APP1"),
            UserMessage::UnregisterApplication {
                apid: Id4::new("APP1"),
                pid: 1,
            },
            UserMessage::RegisterContext(RegisterContext {
                apid: Id4::new("APP1"),
                ctid: Id4::new("CTX1"),
                log_level_pos: 3,
                log_level: 4,
                trace_status: -1,
                pid: 1,
                description: String::new(),
            }),
            UserMessage::LogLevel(LogLevelUpdate {
                log_level: 6,
                trace_status: 1,
                log_level_pos: 9,
            }),
            UserMessage::Injection(Injection {
                log_level_pos: 2,
                service_id: 0x1000,
                data: Bytes::from_static(b"\x01\x02"),
            }),
            UserMessage::Overflow {
                overflow_counter: 5,
                apid: Id4::new("APP1"),
            },
            UserMessage::LogMode(2),
            UserMessage::LogState(1),
            UserMessage::Marker,
            UserMessage::Log(Message::log(Id4::new("APP1"), Id4::new("CTX1"), 3, &b"x"[..])),
        ];

        for message in messages {
            let bytes = message.to_bytes().unwrap();
            let (decoded, used) = decode_user_message(&bytes).unwrap().unwrap();
            assert_eq!(used, bytes.len(), "{message:?}");
            assert_eq!(decoded, message);
        }
    }

    #[test]
    fn not_set_level_decodes_as_default() {
        let mut buf = BytesMut::new();
        UserMessage::AppLogLevelTraceStatus {
            apid: Id4::new("APP1"),
            log_level: -2,
            trace_status: -2,
        }
        .encode(&mut buf)
        .unwrap();

        let (decoded, _) = decode_user_message(&buf).unwrap().unwrap();
        assert_eq!(
            decoded,
            UserMessage::AppLogLevelTraceStatus {
                apid: Id4::new("APP1"),
                log_level: -1,
                trace_status: -1,
            }
        );
    }

    #[test]
    fn partial_envelope_is_incomplete() {
        let bytes = register_app("APP1").to_bytes().unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_user_message(&bytes[..cut]).unwrap().is_none(), "cut={cut}");
        }
    }

    #[test]
    fn long_description_is_truncated() {
        let message = UserMessage::RegisterApplication(RegisterApplication {
            apid: Id4::new("APP1"),
            pid: 1,
            description: "d".repeat(300),
        });
        let bytes = message.to_bytes().unwrap();

        let (decoded, used) = decode_user_message(&bytes).unwrap().unwrap();
        assert_eq!(used, 20 + DESCRIPTION_MAX);
        match decoded {
            UserMessage::RegisterApplication(app) => assert_eq!(app.description.len(), 255),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_consumes_header_only() {
        let mut buf = BytesMut::new();
        buf.put_slice(&USER_HEADER_PATTERN);
        buf.put_u32_le(kind::NOT_SUPPORTED);
        buf.put_slice(b"tail");

        let (decoded, used) = decode_user_message(&buf).unwrap().unwrap();
        assert_eq!(decoded, UserMessage::Unsupported(16));
        assert_eq!(used, USER_HEADER_SIZE);
    }

    #[test]
    fn marker_search_skips_garbage() {
        let mut buf = BytesMut::new();
        buf.put_slice(b"\x00garbage\xffDU");
        let garbage = buf.len();
        UserMessage::Marker.encode(&mut buf).unwrap();

        assert_eq!(find_control_marker(&buf), Some(garbage));
        assert_eq!(find_control_marker(b"DUH"), None);
    }

    #[test]
    fn wrong_marker_is_rejected() {
        let err = decode_user_message(b"DUX\x01\x02\x00\x00\x00").unwrap_err();
        assert!(matches!(err, FrameError::InvalidEnvelopeMarker));
    }
}
