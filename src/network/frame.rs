use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::protocol::{
    Binary, Message, Payload, Text, BINARY_TYPE, HEADER_SIZE, MAX_PAYLOAD_SIZE, TEXT_TYPE,
};
use crate::{AppError, AppResult};

/// TLV framing for `tokio_util::codec::Framed`.
///
/// The header is validated as soon as its 5 bytes are buffered, so an
/// unknown tag or an oversized length is refused before any room is reserved
/// for the value.
#[derive(Debug, Clone, Copy)]
pub struct TlvCodec {
    max_payload_size: u32,
}

impl Default for TlvCodec {
    fn default() -> Self {
        TlvCodec {
            max_payload_size: MAX_PAYLOAD_SIZE,
        }
    }
}

impl TlvCodec {
    pub fn new(max_payload_size: u32) -> Self {
        TlvCodec {
            max_payload_size: max_payload_size.min(MAX_PAYLOAD_SIZE),
        }
    }

    pub fn max_payload_size(&self) -> u32 {
        self.max_payload_size
    }

    fn check(&self, buffer: &mut BytesMut) -> AppResult<Option<(u8, usize)>> {
        if buffer.remaining() < HEADER_SIZE {
            return Ok(None);
        }
        let tag = buffer[0];
        if tag != BINARY_TYPE && tag != TEXT_TYPE {
            return Err(AppError::UnknownType { actual: tag });
        }
        let length = u32::from_be_bytes([buffer[1], buffer[2], buffer[3], buffer[4]]);
        if length > self.max_payload_size {
            return Err(AppError::ExceedsMaxPayload {
                length,
                max: self.max_payload_size,
            });
        }
        let frame_size = HEADER_SIZE + length as usize;
        if buffer.remaining() < frame_size {
            buffer.reserve(frame_size - buffer.remaining());
            return Ok(None);
        }
        Ok(Some((tag, length as usize)))
    }
}

impl Decoder for TlvCodec {
    type Item = Message;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> AppResult<Option<Message>> {
        let Some((tag, length)) = self.check(src)? else {
            return Ok(None);
        };
        src.advance(HEADER_SIZE);
        let value = src.split_to(length);
        let message = if tag == BINARY_TYPE {
            Message::Binary(Binary::new(value.to_vec()))
        } else {
            let text = String::from_utf8(value.to_vec()).map_err(|_| AppError::InvalidUtf8 {
                transferred: (HEADER_SIZE + length) as u64,
            })?;
            Message::Text(Text::new(text))
        };
        Ok(Some(message))
    }
}

impl Encoder<Message> for TlvCodec {
    type Error = AppError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> AppResult<()> {
        let value = item.bytes();
        if value.len() > self.max_payload_size as usize {
            return Err(AppError::ExceedsMaxPayload {
                length: u32::try_from(value.len()).unwrap_or(u32::MAX),
                max: self.max_payload_size,
            });
        }
        dst.reserve(HEADER_SIZE + value.len());
        dst.put_u8(item.tag());
        dst.put_u32(value.len() as u32);
        dst.extend_from_slice(value);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_whole_frame() -> AppResult<()> {
        let mut codec = TlvCodec::default();
        let mut buffer = BytesMut::from(&[BINARY_TYPE, 0, 0][..]);
        assert!(codec.decode(&mut buffer)?.is_none());

        buffer.extend_from_slice(&[0, 3, 0x01, 0x02]);
        assert!(codec.decode(&mut buffer)?.is_none());

        buffer.extend_from_slice(&[0x03, TEXT_TYPE]);
        let message = codec.decode(&mut buffer)?.expect("complete frame");
        assert_eq!(message, Message::Binary(Binary::new(vec![1, 2, 3])));
        // the next frame's tag stays buffered
        assert_eq!(&buffer[..], &[TEXT_TYPE]);
        Ok(())
    }

    #[test]
    fn test_decode_rejects_header_early() {
        let mut codec = TlvCodec::new(16);
        let mut buffer = BytesMut::from(&[TEXT_TYPE, 0, 0, 0, 17][..]);
        let err = codec.decode(&mut buffer).unwrap_err();
        assert!(matches!(err, AppError::ExceedsMaxPayload { length: 17, max: 16 }));
        assert!(buffer.capacity() < 17 + HEADER_SIZE);

        let mut buffer = BytesMut::from(&[7u8, 0, 0, 0, 0][..]);
        assert!(matches!(
            codec.decode(&mut buffer),
            Err(AppError::UnknownType { actual: 7 })
        ));
    }

    #[test]
    fn test_encode_matches_payload_encoding() -> AppResult<()> {
        let mut codec = TlvCodec::default();
        let mut dst = BytesMut::new();
        codec.encode(Message::Text(Text::from("hi")), &mut dst)?;
        assert_eq!(&dst[..], &[TEXT_TYPE, 0, 0, 0, 2, b'h', b'i']);

        let mut codec = TlvCodec::new(1);
        assert!(codec
            .encode(Message::Text(Text::from("hi")), &mut BytesMut::new())
            .is_err());
        Ok(())
    }
}
