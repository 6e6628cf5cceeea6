//! Fixed-layout header pieces of a DLT message.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{BufMut, BytesMut};

use crate::error::{FrameError, Result};
use crate::id::{Id4, ID_SIZE};

/// `DLT\x01`, first bytes of a storage header.
pub const STORAGE_PATTERN: [u8; 4] = *b"DLT\x01";
/// `DLS\x01`, optional prefix on serial-style consumer streams.
pub const SERIAL_HEADER: [u8; 4] = *b"DLS\x01";

pub const STORAGE_HEADER_SIZE: usize = 16;
pub const STANDARD_HEADER_SIZE: usize = 4;
pub const EXTENDED_HEADER_SIZE: usize = 10;

/// Standard header type flags.
pub mod htyp {
    /// Extended header present.
    pub const UEH: u8 = 0x01;
    /// Payload is big-endian.
    pub const MSBF: u8 = 0x02;
    /// ECU id in the extra header.
    pub const WEID: u8 = 0x04;
    /// Session id in the extra header.
    pub const WSID: u8 = 0x08;
    /// Timestamp in the extra header.
    pub const WTMS: u8 = 0x10;
    /// Protocol version 1.
    pub const VERSION_1: u8 = 0x20;

    pub(crate) const LAYOUT_BITS: u8 = UEH | WEID | WSID | WTMS;
}

/// Message-info byte helpers.
pub mod msin {
    pub const VERBOSE: u8 = 0x01;
    const MSTP_SHIFT: u8 = 1;
    const MSTP_MASK: u8 = 0x0E;
    const MTIN_SHIFT: u8 = 4;

    pub const TYPE_LOG: u8 = 0;
    pub const TYPE_APP_TRACE: u8 = 1;
    pub const TYPE_NW_TRACE: u8 = 2;
    pub const TYPE_CONTROL: u8 = 3;

    pub const CONTROL_REQUEST: u8 = 1;
    pub const CONTROL_RESPONSE: u8 = 2;
    pub const CONTROL_TIME: u8 = 3;

    pub const fn compose(message_type: u8, subtype: u8) -> u8 {
        (subtype << MTIN_SHIFT) | (message_type << MSTP_SHIFT)
    }

    pub const fn message_type(msin: u8) -> u8 {
        (msin & MSTP_MASK) >> MSTP_SHIFT
    }

    pub const fn subtype(msin: u8) -> u8 {
        msin >> MTIN_SHIFT
    }

    pub const REQUEST: u8 = compose(TYPE_CONTROL, CONTROL_REQUEST);
    pub const RESPONSE: u8 = compose(TYPE_CONTROL, CONTROL_RESPONSE);
    pub const TIME: u8 = compose(TYPE_CONTROL, CONTROL_TIME);
}

/// Storage header prepended to messages written to the trace sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StorageHeader {
    pub seconds: u32,
    pub microseconds: i32,
    pub ecu: Id4,
}

impl StorageHeader {
    /// Stamp with the current wall-clock time.
    pub fn now(ecu: Id4) -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self {
            seconds: since_epoch.as_secs() as u32,
            microseconds: since_epoch.subsec_micros() as i32,
            ecu,
        }
    }

    pub(crate) fn decode(src: &[u8]) -> Result<Self> {
        if src[..4] != STORAGE_PATTERN {
            return Err(FrameError::InvalidStoragePattern);
        }
        Ok(Self {
            seconds: u32::from_le_bytes([src[4], src[5], src[6], src[7]]),
            microseconds: i32::from_le_bytes([src[8], src[9], src[10], src[11]]),
            ecu: Id4::from_slice(&src[12..]),
        })
    }

    pub fn encode(&self, dst: &mut BytesMut) {
        dst.put_slice(&STORAGE_PATTERN);
        dst.put_u32_le(self.seconds);
        dst.put_i32_le(self.microseconds);
        dst.put_slice(self.ecu.as_bytes());
    }
}

/// Optional fields between the standard and extended header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HeaderExtra {
    pub ecu: Option<Id4>,
    pub session_id: Option<u32>,
    /// Uptime in 0.1 ms units.
    pub timestamp: Option<u32>,
}

impl HeaderExtra {
    pub(crate) fn size_for(htyp: u8) -> usize {
        let mut size = 0;
        if htyp & htyp::WEID != 0 {
            size += ID_SIZE;
        }
        if htyp & htyp::WSID != 0 {
            size += 4;
        }
        if htyp & htyp::WTMS != 0 {
            size += 4;
        }
        size
    }

    pub(crate) fn flags(&self) -> u8 {
        let mut flags = 0;
        if self.ecu.is_some() {
            flags |= htyp::WEID;
        }
        if self.session_id.is_some() {
            flags |= htyp::WSID;
        }
        if self.timestamp.is_some() {
            flags |= htyp::WTMS;
        }
        flags
    }

    pub(crate) fn size(&self) -> usize {
        Self::size_for(self.flags())
    }

    pub(crate) fn decode(htyp: u8, src: &[u8]) -> Self {
        let mut offset = 0;
        let mut extra = Self::default();
        if htyp & htyp::WEID != 0 {
            extra.ecu = Some(Id4::from_slice(&src[offset..]));
            offset += ID_SIZE;
        }
        if htyp & htyp::WSID != 0 {
            extra.session_id = Some(read_u32_be(&src[offset..]));
            offset += 4;
        }
        if htyp & htyp::WTMS != 0 {
            extra.timestamp = Some(read_u32_be(&src[offset..]));
        }
        extra
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        if let Some(ecu) = self.ecu {
            dst.put_slice(ecu.as_bytes());
        }
        if let Some(session_id) = self.session_id {
            dst.put_u32(session_id);
        }
        if let Some(timestamp) = self.timestamp {
            dst.put_u32(timestamp);
        }
    }
}

/// Extended header: message info, argument count, application and context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExtendedHeader {
    pub msin: u8,
    pub noar: u8,
    pub apid: Id4,
    pub ctid: Id4,
}

impl ExtendedHeader {
    pub fn message_type(&self) -> u8 {
        msin::message_type(self.msin)
    }

    pub fn subtype(&self) -> u8 {
        msin::subtype(self.msin)
    }

    pub fn is_verbose(&self) -> bool {
        self.msin & msin::VERBOSE != 0
    }

    pub fn is_control(&self) -> bool {
        self.message_type() == msin::TYPE_CONTROL
    }

    pub(crate) fn decode(src: &[u8]) -> Self {
        Self {
            msin: src[0],
            noar: src[1],
            apid: Id4::from_slice(&src[2..]),
            ctid: Id4::from_slice(&src[6..]),
        }
    }

    pub(crate) fn encode(&self, dst: &mut BytesMut) {
        dst.put_u8(self.msin);
        dst.put_u8(self.noar);
        dst.put_slice(self.apid.as_bytes());
        dst.put_slice(self.ctid.as_bytes());
    }
}

fn read_u32_be(src: &[u8]) -> u32 {
    u32::from_be_bytes([src[0], src[1], src[2], src[3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn msin_composition() {
        assert_eq!(msin::REQUEST, 0x16);
        assert_eq!(msin::RESPONSE, 0x26);
        assert_eq!(msin::message_type(msin::RESPONSE), msin::TYPE_CONTROL);
        assert_eq!(msin::subtype(msin::RESPONSE), msin::CONTROL_RESPONSE);
    }

    #[test]
    fn storage_header_layout() {
        let header = StorageHeader {
            seconds: 0x0102_0304,
            microseconds: 5,
            ecu: Id4::new("ECU1"),
        };
        let mut buf = BytesMut::new();
        header.encode(&mut buf);

        assert_eq!(buf.len(), STORAGE_HEADER_SIZE);
        assert_eq!(&buf[..4], b"DLT\x01");
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(StorageHeader::decode(&buf).unwrap(), header);
    }

    #[test]
    fn storage_header_rejects_bad_pattern() {
        let buf = [0u8; STORAGE_HEADER_SIZE];
        assert!(matches!(
            StorageHeader::decode(&buf),
            Err(FrameError::InvalidStoragePattern)
        ));
    }

    #[test]
    fn extra_size_follows_flags() {
        assert_eq!(HeaderExtra::size_for(0), 0);
        assert_eq!(HeaderExtra::size_for(htyp::WEID | htyp::WTMS), 8);
        assert_eq!(HeaderExtra::size_for(htyp::WEID | htyp::WSID | htyp::WTMS), 12);
    }
}
