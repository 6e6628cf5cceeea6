//! `tokio_util::codec` adapters for async consumers and producers.

use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{decode_message, Message};
use crate::envelope::{decode_user_message, find_control_marker, UserMessage, USER_HEADER_PATTERN};
use crate::error::{FrameError, Result};

/// Network-form DLT messages as a consumer receives them.
#[derive(Debug, Default, Clone, Copy)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>> {
        match decode_message(src)? {
            Some((message, used)) => {
                src.advance(used);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        item.encode_network(dst)
    }
}

/// Producer envelopes. Garbage before a marker is dropped and an envelope
/// that fails to decode is skipped past its marker.
#[derive(Debug, Default, Clone, Copy)]
pub struct UserMessageCodec;

impl Decoder for UserMessageCodec {
    type Item = UserMessage;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<UserMessage>> {
        loop {
            match find_control_marker(src) {
                Some(offset) => src.advance(offset),
                None => {
                    // keep a possible partial marker at the tail
                    let keep = (USER_HEADER_PATTERN.len() - 1).min(src.len());
                    src.advance(src.len() - keep);
                    return Ok(None);
                }
            }
            match decode_user_message(src) {
                Ok(Some((message, used))) => {
                    src.advance(used);
                    return Ok(Some(message));
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    tracing::debug!(error = %err, "skipping malformed envelope");
                    src.advance(USER_HEADER_PATTERN.len());
                }
            }
        }
    }
}

impl Encoder<UserMessage> for UserMessageCodec {
    type Error = FrameError;

    fn encode(&mut self, item: UserMessage, dst: &mut BytesMut) -> Result<()> {
        item.encode(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::Id4;

    #[test]
    fn message_codec_waits_for_full_message() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::new();
        codec
            .encode(Message::log(Id4::new("APP"), Id4::new("CTX"), 3, &b"abc"[..]), &mut buf)
            .unwrap();
        let full = buf.split();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&full[full.len() - 1..]);

        let message = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(message.counter, 3);
        assert_eq!(message.payload.as_ref(), b"abc");
        assert!(partial.is_empty());
    }

    #[test]
    fn user_codec_drops_leading_garbage() {
        let mut codec = UserMessageCodec;
        let mut buf = BytesMut::from(&b"noise"[..]);
        codec.encode(UserMessage::LogMode(1), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(UserMessage::LogMode(1)));
        assert!(buf.is_empty());
    }

    #[test]
    fn user_codec_keeps_partial_marker() {
        let mut codec = UserMessageCodec;
        let mut buf = BytesMut::from(&b"xxxxDU"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.as_ref(), b"xDU");
    }
}
