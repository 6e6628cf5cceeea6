use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::header::{
    htyp, msin, ExtendedHeader, HeaderExtra, StorageHeader, EXTENDED_HEADER_SIZE, SERIAL_HEADER,
    STANDARD_HEADER_SIZE, STORAGE_HEADER_SIZE,
};
use crate::id::Id4;

/// Largest value the 16-bit length field can carry.
pub const MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// One decoded DLT message.
///
/// The layout flags of `htyp` (extended header, ECU, session, timestamp) are
/// derived from `extra`/`extended` on encode; the remaining bits (byte order,
/// version) are carried through unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub storage: StorageHeader,
    pub htyp: u8,
    pub counter: u8,
    pub extra: HeaderExtra,
    pub extended: Option<ExtendedHeader>,
    pub payload: Bytes,
}

impl Message {
    /// Build a control message as the daemon emits it: ECU and timestamp in
    /// the extra header, extended header with one argument.
    pub fn control(
        ecu: Id4,
        timestamp: u32,
        info: u8,
        apid: Id4,
        ctid: Id4,
        payload: impl Into<Bytes>,
    ) -> Self {
        Self {
            storage: StorageHeader::now(ecu),
            htyp: htyp::VERSION_1,
            counter: 0,
            extra: HeaderExtra {
                ecu: Some(ecu),
                session_id: None,
                timestamp: Some(timestamp),
            },
            extended: Some(ExtendedHeader {
                msin: info,
                noar: 1,
                apid,
                ctid,
            }),
            payload: payload.into(),
        }
    }

    /// A non-verbose log message as a producer would send it.
    pub fn log(apid: Id4, ctid: Id4, counter: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            storage: StorageHeader::default(),
            htyp: htyp::VERSION_1,
            counter,
            extra: HeaderExtra::default(),
            extended: Some(ExtendedHeader {
                msin: msin::compose(msin::TYPE_LOG, 4),
                noar: 1,
                apid,
                ctid,
            }),
            payload: payload.into(),
        }
    }

    /// Effective header type byte.
    pub fn header_type(&self) -> u8 {
        let mut flags = (self.htyp & !htyp::LAYOUT_BITS) | self.extra.flags();
        if self.extended.is_some() {
            flags |= htyp::UEH;
        }
        flags
    }

    /// Standard + extra + extended header bytes.
    pub fn header_size(&self) -> usize {
        STANDARD_HEADER_SIZE
            + self.extra.size()
            + self.extended.map_or(0, |_| EXTENDED_HEADER_SIZE)
    }

    /// Value of the length field: everything after the storage header.
    pub fn network_size(&self) -> usize {
        self.header_size() + self.payload.len()
    }

    pub fn is_big_endian(&self) -> bool {
        self.htyp & htyp::MSBF != 0
    }

    pub fn is_control(&self) -> bool {
        self.extended.is_some_and(|ext| ext.is_control())
    }

    pub fn is_control_request(&self) -> bool {
        self.extended
            .is_some_and(|ext| ext.is_control() && ext.subtype() == msin::CONTROL_REQUEST)
    }

    pub fn apid(&self) -> Option<Id4> {
        self.extended.map(|ext| ext.apid)
    }

    pub fn ctid(&self) -> Option<Id4> {
        self.extended.map(|ext| ext.ctid)
    }

    /// Stamp the storage header ECU: the message's own ECU when it carries
    /// one, otherwise `fallback`.
    pub fn set_storage_ecu(&mut self, fallback: Id4) {
        self.storage.ecu = self.extra.ecu.unwrap_or(fallback);
    }

    /// Encode the standard, extra and extended headers (no payload).
    pub fn encode_header(&self, dst: &mut BytesMut) -> Result<()> {
        let len = self.network_size();
        if len > MAX_MESSAGE_SIZE {
            return Err(FrameError::MessageTooLarge {
                size: len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        dst.reserve(self.header_size());
        dst.put_u8(self.header_type());
        dst.put_u8(self.counter);
        dst.put_u16(len as u16);
        self.extra.encode(dst);
        if let Some(extended) = &self.extended {
            extended.encode(dst);
        }
        Ok(())
    }

    /// Encode the message as it travels to consumers.
    ///
    /// ```text
    /// ┌──────┬──────┬──────────┬──────────────┬─────────────┬─────────┐
    /// │ htyp │ mcnt │ len (BE) │ extra fields │ ext. header │ payload │
    /// │ 1B   │ 1B   │ 2B       │ 0/4/8/12B    │ 0/10B       │         │
    /// └──────┴──────┴──────────┴──────────────┴─────────────┴─────────┘
    /// ```
    pub fn encode_network(&self, dst: &mut BytesMut) -> Result<()> {
        self.encode_header(dst)?;
        dst.put_slice(&self.payload);
        Ok(())
    }

    /// Encode with the 16-byte storage header in front, as written to files.
    pub fn encode_stored(&self, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(STORAGE_HEADER_SIZE + self.network_size());
        self.storage.encode(dst);
        self.encode_network(dst)
    }

    pub fn to_network_bytes(&self) -> Result<Bytes> {
        let mut buf = BytesMut::with_capacity(self.network_size());
        self.encode_network(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decode one message in network form from the front of `src`.
///
/// A leading serial header (`DLS\x01`) is skipped and counted in the
/// consumed bytes. Returns `Ok(None)` until the whole message is available;
/// nothing past the declared length is ever looked at.
pub fn decode_message(src: &[u8]) -> Result<Option<(Message, usize)>> {
    let body = strip_serial_header(src);
    let skip = src.len() - body.len();
    Ok(decode_network(body)?.map(|(message, used)| (message, skip + used)))
}

/// Decode one message that starts with a storage header.
pub fn decode_stored_message(src: &[u8]) -> Result<Option<(Message, usize)>> {
    if src.len() < STORAGE_HEADER_SIZE {
        return Ok(None);
    }
    let storage = StorageHeader::decode(src)?;
    Ok(
        decode_network(&src[STORAGE_HEADER_SIZE..])?.map(|(mut message, used)| {
            message.storage = storage;
            (message, STORAGE_HEADER_SIZE + used)
        }),
    )
}

/// `src` without a leading serial header.
pub fn strip_serial_header(src: &[u8]) -> &[u8] {
    src.strip_prefix(&SERIAL_HEADER[..]).unwrap_or(src)
}

/// Offset of the next serial header in `src`, for resynchronizing a
/// consumer stream after a malformed message.
pub fn find_serial_header(src: &[u8]) -> Option<usize> {
    src.windows(SERIAL_HEADER.len())
        .position(|window| window == SERIAL_HEADER)
}

fn decode_network(src: &[u8]) -> Result<Option<(Message, usize)>> {
    if src.len() < STANDARD_HEADER_SIZE {
        return Ok(None);
    }

    let header_type = src[0];
    let counter = src[1];
    let len = u16::from_be_bytes([src[2], src[3]]) as usize;
    let extended_size = if header_type & htyp::UEH != 0 {
        EXTENDED_HEADER_SIZE
    } else {
        0
    };
    let header_size = STANDARD_HEADER_SIZE + HeaderExtra::size_for(header_type) + extended_size;

    if len < header_size {
        return Err(FrameError::LengthTooShort {
            len,
            header: header_size,
        });
    }
    if src.len() < len {
        return Ok(None);
    }

    let extra_start = STANDARD_HEADER_SIZE;
    let extra = HeaderExtra::decode(header_type, &src[extra_start..]);
    let extended = (extended_size != 0)
        .then(|| ExtendedHeader::decode(&src[header_size - EXTENDED_HEADER_SIZE..]));
    let payload = Bytes::copy_from_slice(&src[header_size..len]);

    let message = Message {
        storage: StorageHeader::default(),
        htyp: header_type & !htyp::LAYOUT_BITS,
        counter,
        extra,
        extended,
        payload,
    };
    Ok(Some((message, len)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Message {
        let mut message = Message::log(Id4::new("APP1"), Id4::new("CTX1"), 7, &b"hello"[..]);
        message.extra.ecu = Some(Id4::new("ECU9"));
        message.extra.timestamp = Some(12_345);
        message
    }

    #[test]
    fn network_round_trip_preserves_headers_and_payload() {
        let message = sample();
        let bytes = message.to_network_bytes().unwrap();

        let (decoded, used) = decode_message(&bytes).unwrap().unwrap();
        assert_eq!(used, bytes.len());
        assert_eq!(decoded.header_type(), message.header_type());
        assert_eq!(decoded.counter, 7);
        assert_eq!(decoded.extra, message.extra);
        assert_eq!(decoded.extended, message.extended);
        assert_eq!(decoded.payload.as_ref(), b"hello");
        assert_eq!(decoded.to_network_bytes().unwrap(), bytes);
    }

    #[test]
    fn length_field_is_big_endian() {
        let bytes = sample().to_network_bytes().unwrap();
        let expected = (4 + 8 + 10 + 5) as u16;
        assert_eq!(&bytes[2..4], &expected.to_be_bytes());
        assert_eq!(bytes[0] & htyp::UEH, htyp::UEH);
        assert_eq!(bytes[0] & htyp::WEID, htyp::WEID);
        assert_eq!(bytes[0] & htyp::WSID, 0);
    }

    #[test]
    fn incomplete_input_is_not_consumed() {
        let bytes = sample().to_network_bytes().unwrap();
        for cut in 0..bytes.len() {
            assert!(decode_message(&bytes[..cut]).unwrap().is_none(), "cut={cut}");
        }
    }

    #[test]
    fn trailing_bytes_are_left_alone() {
        let mut buf = BytesMut::new();
        sample().encode_network(&mut buf).unwrap();
        let first_len = buf.len();
        buf.put_slice(&[0x35, 0x00]);

        let (_, used) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(used, first_len);
    }

    #[test]
    fn declared_length_shorter_than_headers_is_an_error() {
        let bytes = [htyp::UEH | htyp::VERSION_1, 0, 0, 6, 0, 0, 0, 0, 0, 0];
        let err = decode_message(&bytes).unwrap_err();
        assert!(matches!(err, FrameError::LengthTooShort { len: 6, header: 14 }));
    }

    #[test]
    fn oversized_message_is_rejected_on_encode() {
        let message = Message::log(Id4::new("A"), Id4::new("C"), 0, vec![0u8; MAX_MESSAGE_SIZE]);
        let mut buf = BytesMut::new();
        let err = message.encode_network(&mut buf).unwrap_err();
        assert!(matches!(err, FrameError::MessageTooLarge { .. }));
        assert!(buf.is_empty());
    }

    #[test]
    fn largest_message_fits_exactly() {
        let payload_len = MAX_MESSAGE_SIZE - STANDARD_HEADER_SIZE - EXTENDED_HEADER_SIZE;
        let message = Message::log(Id4::new("A"), Id4::new("C"), 0, vec![1u8; payload_len]);
        let bytes = message.to_network_bytes().unwrap();
        assert_eq!(bytes.len(), MAX_MESSAGE_SIZE);
    }

    #[test]
    fn stored_round_trip_keeps_storage_header() {
        let mut message = sample();
        message.storage = StorageHeader {
            seconds: 99,
            microseconds: 1,
            ecu: Id4::new("ECU9"),
        };
        let mut buf = BytesMut::new();
        message.encode_stored(&mut buf).unwrap();

        let (decoded, used) = decode_stored_message(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded, message);
    }

    #[test]
    fn serial_header_is_skipped() {
        let mut buf = BytesMut::new();
        buf.put_slice(&SERIAL_HEADER);
        sample().encode_network(&mut buf).unwrap();

        let (decoded, used) = decode_message(&buf).unwrap().unwrap();
        assert_eq!(used, buf.len());
        assert_eq!(decoded.payload.as_ref(), b"hello");
        assert_eq!(find_serial_header(&buf[1..]), None);
        assert_eq!(find_serial_header(&[0, 1, b'D', b'L', b'S', 1]), Some(2));
    }

    #[test]
    fn storage_ecu_prefers_message_ecu() {
        let mut message = sample();
        message.set_storage_ecu(Id4::new("ECU1"));
        assert_eq!(message.storage.ecu, Id4::new("ECU9"));

        message.extra.ecu = None;
        message.set_storage_ecu(Id4::new("ECU1"));
        assert_eq!(message.storage.ecu, Id4::new("ECU1"));
    }

    #[test]
    fn control_request_detection() {
        let request = Message::control(
            Id4::new("ECU1"),
            0,
            msin::REQUEST,
            Id4::EMPTY,
            Id4::EMPTY,
            &[1u8, 0, 0, 0][..],
        );
        assert!(request.is_control_request());
        assert!(!sample().is_control());
    }
}
