//! Control service payloads exchanged with consumers.
//!
//! A request payload starts with a 32-bit service id in the byte order of
//! the carrying message (little-endian unless MSBF is set). Every response
//! starts with the same service id and a status byte, and is always encoded
//! little-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::id::{Id4, ID_SIZE};

/// Service ids.
pub mod id {
    pub const SET_LOG_LEVEL: u32 = 0x01;
    pub const SET_TRACE_STATUS: u32 = 0x02;
    pub const GET_LOG_INFO: u32 = 0x03;
    pub const GET_DEFAULT_LOG_LEVEL: u32 = 0x04;
    pub const STORE_CONFIG: u32 = 0x05;
    pub const RESET_TO_FACTORY_DEFAULT: u32 = 0x06;
    pub const SET_COM_INTERFACE_STATUS: u32 = 0x07;
    pub const SET_COM_INTERFACE_MAX_BANDWIDTH: u32 = 0x08;
    pub const SET_VERBOSE_MODE: u32 = 0x09;
    pub const SET_MESSAGE_FILTERING: u32 = 0x0A;
    pub const SET_TIMING_PACKETS: u32 = 0x0B;
    pub const GET_LOCAL_TIME: u32 = 0x0C;
    pub const USE_ECU_ID: u32 = 0x0D;
    pub const USE_SESSION_ID: u32 = 0x0E;
    pub const USE_TIMESTAMP: u32 = 0x0F;
    pub const USE_EXTENDED_HEADER: u32 = 0x10;
    pub const SET_DEFAULT_LOG_LEVEL: u32 = 0x11;
    pub const SET_DEFAULT_TRACE_STATUS: u32 = 0x12;
    pub const GET_SOFTWARE_VERSION: u32 = 0x13;
    pub const MESSAGE_BUFFER_OVERFLOW: u32 = 0x14;
    pub const GET_DEFAULT_TRACE_STATUS: u32 = 0x15;
    pub const GET_TRACE_STATUS: u32 = 0x1F;
    pub const UNREGISTER_CONTEXT: u32 = 0xF01;
    pub const CONNECTION_INFO: u32 = 0xF02;
    pub const TIMEZONE: u32 = 0xF03;
    pub const MARKER: u32 = 0xF04;
    pub const SET_ALL_LOG_LEVEL: u32 = 0xF11;
    pub const SET_ALL_TRACE_STATUS: u32 = 0xF12;

    /// First id routed to a producer as a software injection.
    pub const INJECTION_MIN: u32 = 0xFFF;
    pub const INJECTION_MAX: u32 = 0xFFFF_FFFF;
}

/// Response status byte.
pub mod status {
    pub const OK: u8 = 0;
    pub const NOT_SUPPORTED: u8 = 1;
    pub const ERROR: u8 = 2;
    /// GET_LOG_INFO: no application/context matched the filter.
    pub const NO_MATCHING_CONTEXT: u8 = 8;
}

/// Connection-info states.
pub const CONNECTION_DISCONNECTED: u8 = 1;
pub const CONNECTION_CONNECTED: u8 = 2;

/// Communication interface name reported in responses.
pub const COM_INTERFACE: Id4 = Id4::from_bytes(*b"remo");

/// Human-readable service name for logs and CLI output.
pub fn service_name(service_id: u32) -> &'static str {
    match service_id {
        id::SET_LOG_LEVEL => "set_log_level",
        id::SET_TRACE_STATUS => "set_trace_status",
        id::GET_LOG_INFO => "get_log_info",
        id::GET_DEFAULT_LOG_LEVEL => "get_default_log_level",
        id::STORE_CONFIG => "store_config",
        id::RESET_TO_FACTORY_DEFAULT => "reset_to_factory_default",
        id::SET_COM_INTERFACE_STATUS => "set_com_interface_status",
        id::SET_COM_INTERFACE_MAX_BANDWIDTH => "set_com_interface_max_bandwidth",
        id::SET_VERBOSE_MODE => "set_verbose_mode",
        id::SET_MESSAGE_FILTERING => "set_message_filtering",
        id::SET_TIMING_PACKETS => "set_timing_packets",
        id::GET_LOCAL_TIME => "get_local_time",
        id::USE_ECU_ID => "use_ecu_id",
        id::USE_SESSION_ID => "use_session_id",
        id::USE_TIMESTAMP => "use_timestamp",
        id::USE_EXTENDED_HEADER => "use_extended_header",
        id::SET_DEFAULT_LOG_LEVEL => "set_default_log_level",
        id::SET_DEFAULT_TRACE_STATUS => "set_default_trace_status",
        id::GET_SOFTWARE_VERSION => "get_software_version",
        id::MESSAGE_BUFFER_OVERFLOW => "message_buffer_overflow",
        id::GET_DEFAULT_TRACE_STATUS => "get_default_trace_status",
        id::GET_TRACE_STATUS => "get_trace_status",
        id::UNREGISTER_CONTEXT => "unregister_context",
        id::CONNECTION_INFO => "connection_info",
        id::TIMEZONE => "timezone",
        id::MARKER => "marker",
        id::SET_ALL_LOG_LEVEL => "set_all_log_level",
        id::SET_ALL_TRACE_STATUS => "set_all_trace_status",
        id::INJECTION_MIN..=id::INJECTION_MAX => "injection",
        _ => "unknown",
    }
}

/// Cursor over a request payload that honors the message byte order.
pub struct RequestReader<'a> {
    src: &'a [u8],
    offset: usize,
    big_endian: bool,
}

impl<'a> RequestReader<'a> {
    pub fn new(src: &'a [u8], big_endian: bool) -> Self {
        Self {
            src,
            offset: 0,
            big_endian,
        }
    }

    fn take(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.offset.checked_add(len)?;
        let slice = self.src.get(self.offset..end)?;
        self.offset = end;
        Some(slice)
    }

    pub fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    pub fn u32(&mut self) -> Option<u32> {
        let raw: [u8; 4] = self.take(4)?.try_into().ok()?;
        Some(if self.big_endian {
            u32::from_be_bytes(raw)
        } else {
            u32::from_le_bytes(raw)
        })
    }

    pub fn id(&mut self) -> Option<Id4> {
        let raw: [u8; ID_SIZE] = self.take(ID_SIZE)?.try_into().ok()?;
        Some(Id4::from_bytes(raw))
    }

    pub fn bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        self.take(len)
    }
}

/// Service id at the front of a request payload.
pub fn request_service_id(payload: &[u8], big_endian: bool) -> Option<u32> {
    RequestReader::new(payload, big_endian).u32()
}

/// SET_LOG_LEVEL / SET_TRACE_STATUS request (same layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetLevelRequest {
    pub apid: Id4,
    pub ctid: Id4,
    pub value: u8,
}

impl SetLevelRequest {
    pub fn parse(payload: &[u8], big_endian: bool) -> Option<Self> {
        let mut reader = RequestReader::new(payload, big_endian);
        reader.u32()?;
        let request = Self {
            apid: reader.id()?,
            ctid: reader.id()?,
            value: reader.u8()?,
        };
        reader.id()?;
        Some(request)
    }

    pub fn encode(&self, service_id: u32) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u32_le(service_id);
        buf.put_slice(self.apid.as_bytes());
        buf.put_slice(self.ctid.as_bytes());
        buf.put_u8(self.value);
        buf.put_slice(COM_INTERFACE.as_bytes());
        buf.freeze()
    }
}

/// Requests carrying one value byte after the service id: default level or
/// status, set-all, timing packets.
pub fn parse_value_request(payload: &[u8], big_endian: bool) -> Option<u8> {
    let mut reader = RequestReader::new(payload, big_endian);
    reader.u32()?;
    reader.u8()
}

pub fn encode_value_request(service_id: u32, value: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(9);
    buf.put_u32_le(service_id);
    buf.put_u8(value);
    buf.put_slice(COM_INTERFACE.as_bytes());
    buf.freeze()
}

/// GET_LOG_INFO request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetLogInfoRequest {
    pub options: u8,
    pub apid: Id4,
    pub ctid: Id4,
}

impl GetLogInfoRequest {
    pub fn parse(payload: &[u8], big_endian: bool) -> Option<Self> {
        let mut reader = RequestReader::new(payload, big_endian);
        reader.u32()?;
        let request = Self {
            options: reader.u8()?,
            apid: reader.id()?,
            ctid: reader.id()?,
        };
        reader.id()?;
        Some(request)
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(17);
        buf.put_u32_le(id::GET_LOG_INFO);
        buf.put_u8(self.options);
        buf.put_slice(self.apid.as_bytes());
        buf.put_slice(self.ctid.as_bytes());
        buf.put_slice(COM_INTERFACE.as_bytes());
        buf.freeze()
    }
}

/// GET_TRACE_STATUS request: one context.
pub fn parse_context_request(payload: &[u8], big_endian: bool) -> Option<(Id4, Id4)> {
    let mut reader = RequestReader::new(payload, big_endian);
    reader.u32()?;
    Some((reader.id()?, reader.id()?))
}

/// Software injection request: service id, data length, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionRequest {
    pub service_id: u32,
    pub data: Bytes,
}

impl InjectionRequest {
    pub fn parse(payload: &[u8], big_endian: bool) -> Option<Self> {
        let mut reader = RequestReader::new(payload, big_endian);
        let service_id = reader.u32()?;
        let len = reader.u32()? as usize;
        let data = Bytes::copy_from_slice(reader.bytes(len)?);
        Some(Self { service_id, data })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(8 + self.data.len());
        buf.put_u32_le(self.service_id);
        buf.put_u32_le(self.data.len() as u32);
        buf.put_slice(&self.data);
        buf.freeze()
    }
}

fn response_header(service_id: u32, status: u8, extra: usize) -> BytesMut {
    let mut buf = BytesMut::with_capacity(5 + extra);
    buf.put_u32_le(service_id);
    buf.put_u8(status);
    buf
}

/// Plain `{service id, status}` response.
pub fn encode_status(service_id: u32, status: u8) -> Bytes {
    response_header(service_id, status, 0).freeze()
}

/// `{service id, status, value}`: default level, default or context trace status.
pub fn encode_value(service_id: u32, status: u8, value: u8) -> Bytes {
    let mut buf = response_header(service_id, status, 1);
    buf.put_u8(value);
    buf.freeze()
}

pub fn encode_software_version(version: &str) -> Bytes {
    let mut buf = response_header(id::GET_SOFTWARE_VERSION, status::OK, 4 + version.len());
    buf.put_u32_le(version.len() as u32);
    buf.put_slice(version.as_bytes());
    buf.freeze()
}

pub fn encode_buffer_overflow(overflow: bool, counter: u32) -> Bytes {
    let mut buf = response_header(id::MESSAGE_BUFFER_OVERFLOW, status::OK, 5);
    buf.put_u8(u8::from(overflow));
    buf.put_u32_le(counter);
    buf.freeze()
}

pub fn encode_unregister_context(apid: Id4, ctid: Id4) -> Bytes {
    let mut buf = response_header(id::UNREGISTER_CONTEXT, status::OK, 3 * ID_SIZE);
    buf.put_slice(apid.as_bytes());
    buf.put_slice(ctid.as_bytes());
    buf.put_slice(COM_INTERFACE.as_bytes());
    buf.freeze()
}

pub fn encode_connection_info(state: u8) -> Bytes {
    let mut buf = response_header(id::CONNECTION_INFO, status::OK, 1 + ID_SIZE);
    buf.put_u8(state);
    buf.put_slice(COM_INTERFACE.as_bytes());
    buf.freeze()
}

pub fn encode_timezone(offset_seconds: i32, is_dst: bool) -> Bytes {
    let mut buf = response_header(id::TIMEZONE, status::OK, 5);
    buf.put_i32_le(offset_seconds);
    buf.put_u8(u8::from(is_dst));
    buf.freeze()
}

pub fn encode_marker() -> Bytes {
    encode_status(id::MARKER, status::OK)
}

/// One application in a GET_LOG_INFO response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfoApplication {
    pub apid: Id4,
    pub description: String,
    pub contexts: Vec<LogInfoContext>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogInfoContext {
    pub ctid: Id4,
    pub log_level: i8,
    pub trace_status: i8,
    pub description: String,
}

/// GET_LOG_INFO response for `options` 3..=7.
///
/// Options 4, 6 and 7 add the level per context, 5, 6 and 7 the trace
/// status, and 7 adds the descriptions. An empty `applications` slice
/// produces the no-match status.
pub fn encode_log_info(options: u8, applications: &[LogInfoApplication]) -> Bytes {
    let with_level = matches!(options, 4 | 6 | 7);
    let with_status = matches!(options, 5 | 6 | 7);
    let with_description = options == 7;

    let matched = applications.iter().any(|app| !app.contexts.is_empty());
    if !matched {
        let mut buf = response_header(id::GET_LOG_INFO, status::NO_MATCHING_CONTEXT, ID_SIZE);
        buf.put_slice(COM_INTERFACE.as_bytes());
        return buf.freeze();
    }

    let mut buf = response_header(id::GET_LOG_INFO, options, 64);
    buf.put_u16_le(applications.len() as u16);
    for app in applications {
        buf.put_slice(app.apid.as_bytes());
        buf.put_u16_le(app.contexts.len() as u16);
        for ctx in &app.contexts {
            buf.put_slice(ctx.ctid.as_bytes());
            if with_level {
                buf.put_i8(ctx.log_level);
            }
            if with_status {
                buf.put_i8(ctx.trace_status);
            }
            if with_description {
                put_short_text(&mut buf, &ctx.description);
            }
        }
        if with_description {
            put_short_text(&mut buf, &app.description);
        }
    }
    buf.put_slice(COM_INTERFACE.as_bytes());
    buf.freeze()
}

/// Parse a GET_LOG_INFO response body back into applications.
///
/// Returns the status byte and, when the status is an options value, the
/// decoded applications.
pub fn decode_log_info(payload: &[u8]) -> Option<(u8, Vec<LogInfoApplication>)> {
    let mut reader = RequestReader::new(payload, false);
    if reader.u32()? != id::GET_LOG_INFO {
        return None;
    }
    let options = reader.u8()?;
    if !(3..=7).contains(&options) {
        return Some((options, Vec::new()));
    }
    let with_level = matches!(options, 4 | 6 | 7);
    let with_status = matches!(options, 5 | 6 | 7);
    let with_description = options == 7;

    let app_count = read_u16(&mut reader)?;
    let mut applications = Vec::with_capacity(app_count as usize);
    for _ in 0..app_count {
        let apid = reader.id()?;
        let ctx_count = read_u16(&mut reader)?;
        let mut contexts = Vec::with_capacity(ctx_count as usize);
        for _ in 0..ctx_count {
            let ctid = reader.id()?;
            let log_level = if with_level { reader.u8()? as i8 } else { -1 };
            let trace_status = if with_status { reader.u8()? as i8 } else { -1 };
            let description = if with_description {
                read_short_text(&mut reader)?
            } else {
                String::new()
            };
            contexts.push(LogInfoContext {
                ctid,
                log_level,
                trace_status,
                description,
            });
        }
        let description = if with_description {
            read_short_text(&mut reader)?
        } else {
            String::new()
        };
        applications.push(LogInfoApplication {
            apid,
            description,
            contexts,
        });
    }
    Some((options, applications))
}

fn put_short_text(buf: &mut BytesMut, text: &str) {
    let bytes = &text.as_bytes()[..text.len().min(u16::MAX as usize)];
    buf.put_u16_le(bytes.len() as u16);
    buf.put_slice(bytes);
}

fn read_u16(reader: &mut RequestReader<'_>) -> Option<u16> {
    let raw: [u8; 2] = reader.bytes(2)?.try_into().ok()?;
    Some(u16::from_le_bytes(raw))
}

fn read_short_text(reader: &mut RequestReader<'_>) -> Option<String> {
    let len = read_u16(reader)? as usize;
    Some(String::from_utf8_lossy(reader.bytes(len)?).into_owned())
}
