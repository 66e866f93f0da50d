use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{read_length, read_tag, read_value, write_frame, Payload, BINARY_TYPE, MAX_PAYLOAD_SIZE};
use crate::{AppError, AppResult};

/// Opaque bytes, tag [`BINARY_TYPE`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Binary(Vec<u8>);

impl Binary {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Binary(value.into())
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes everything after a tag that has already been read and matched.
    pub(crate) async fn read_body<R>(reader: &mut R, max: u32) -> AppResult<(Binary, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let length = read_length(reader, max).await?;
        let value = read_value(reader, length).await?;
        Ok((Binary(value), 5 + length as u64))
    }
}

impl From<Vec<u8>> for Binary {
    fn from(value: Vec<u8>) -> Self {
        Binary(value)
    }
}

impl From<&[u8]> for Binary {
    fn from(value: &[u8]) -> Self {
        Binary(value.to_vec())
    }
}

impl fmt::Display for Binary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl Payload for Binary {
    fn bytes(&self) -> &[u8] {
        &self.0
    }

    async fn read_from<R>(&mut self, reader: &mut R) -> AppResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tag = read_tag(reader).await?;
        if tag != BINARY_TYPE {
            return Err(AppError::InvalidType {
                expected: BINARY_TYPE,
                actual: tag,
            });
        }
        let (binary, read) = Binary::read_body(reader, MAX_PAYLOAD_SIZE).await?;
        *self = binary;
        Ok(read)
    }

    async fn write_to<W>(&self, writer: &mut W) -> AppResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write_frame(writer, BINARY_TYPE, &self.0).await
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::protocol::test_support::LimitedSink;
    use crate::protocol::TEXT_TYPE;
    use crate::service::FrameField;

    #[tokio::test]
    async fn test_encode_layout() -> AppResult<()> {
        let mut wire = Vec::new();
        let written = Binary::new(vec![0x01, 0x02, 0x03]).write_to(&mut wire).await?;
        assert_eq!(written, 8);
        assert_eq!(wire, vec![BINARY_TYPE, 0x00, 0x00, 0x00, 0x03, 0x01, 0x02, 0x03]);

        let mut decoded = Binary::default();
        let read = decoded.read_from(&mut Cursor::new(wire)).await?;
        assert_eq!(read, 8);
        assert_eq!(decoded.bytes(), &[0x01, 0x02, 0x03]);
        Ok(())
    }

    #[tokio::test]
    async fn test_round_trip_sizes() -> AppResult<()> {
        for size in [0usize, 1, 4096, MAX_PAYLOAD_SIZE as usize] {
            let value: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
            let mut wire = Vec::with_capacity(size + 5);
            Binary::new(value.clone()).write_to(&mut wire).await?;

            let mut decoded = Binary::new(b"stale".to_vec());
            let read = decoded.read_from(&mut Cursor::new(wire)).await?;
            assert_eq!(read, size as u64 + 5);
            assert_eq!(decoded.into_inner(), value);
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_mismatched_tag_consumes_one_byte() {
        let mut cursor = Cursor::new(vec![TEXT_TYPE, 0x00, 0x00, 0x00, 0x01, b'a']);
        let mut decoded = Binary::new(b"kept".to_vec());
        let err = decoded.read_from(&mut cursor).await.unwrap_err();

        assert!(matches!(
            err,
            AppError::InvalidType {
                expected: BINARY_TYPE,
                actual: TEXT_TYPE
            }
        ));
        assert_eq!(err.transferred(), Some(1));
        assert_eq!(cursor.position(), 1);
        assert_eq!(decoded.bytes(), b"kept");
    }

    #[tokio::test]
    async fn test_oversized_length_rejected() {
        let mut wire = vec![BINARY_TYPE];
        wire.extend_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_be_bytes());
        let mut cursor = Cursor::new(wire);

        let err = Binary::default().read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, AppError::ExceedsMaxPayload { length, .. } if length == MAX_PAYLOAD_SIZE + 1));
        assert_eq!(err.transferred(), Some(5));
        assert_eq!(cursor.position(), 5);
    }

    #[tokio::test]
    async fn test_truncated_header() {
        let err = Binary::default()
            .read_from(&mut Cursor::new(Vec::<u8>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Type, transferred: 0, .. }));

        let err = Binary::default()
            .read_from(&mut Cursor::new(vec![BINARY_TYPE, 0x00, 0x00]))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Length, transferred: 1, .. }));
    }

    #[tokio::test]
    async fn test_truncated_value_reports_partial_count() {
        let wire = vec![BINARY_TYPE, 0x00, 0x00, 0x00, 0x04, 0xaa, 0xbb];
        let err = Binary::default()
            .read_from(&mut Cursor::new(wire))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Value, transferred: 7, .. }));
    }

    #[tokio::test]
    async fn test_short_reads_fill_whole_value() -> AppResult<()> {
        // a 3 byte pipe forces the value to arrive in many small pieces
        let (mut client, mut server) = tokio::io::duplex(3);
        let value: Vec<u8> = (0..1024u32).map(|i| i as u8).collect();
        let expected = value.clone();

        let writer = tokio::spawn(async move {
            let written = Binary::new(value).write_to(&mut client).await?;
            client.shutdown().await?;
            AppResult::Ok(written)
        });

        let mut decoded = Binary::default();
        let read = decoded.read_from(&mut server).await?;
        assert_eq!(read, 1029);
        assert_eq!(decoded.into_inner(), expected);
        assert_eq!(writer.await.unwrap()?, 1029);
        Ok(())
    }

    #[tokio::test]
    async fn test_partial_write_counts() {
        // sink dies inside the length field, after the tag and two length bytes
        let mut sink = LimitedSink::new(3);
        let err = Binary::new(vec![1, 2, 3]).write_to(&mut sink).await.unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Length, transferred: 3, .. }));
        assert_eq!(err.transferred(), Some(sink.accepted.len() as u64));

        // sink dies inside the value
        let mut sink = LimitedSink::new(7);
        let err = Binary::new(vec![1, 2, 3]).write_to(&mut sink).await.unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Value, transferred: 7, .. }));
        assert_eq!(sink.accepted.len(), 7);

        // sink dies right after the header
        let mut sink = LimitedSink::new(5);
        let err = Binary::new(vec![1, 2, 3]).write_to(&mut sink).await.unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Value, transferred: 5, .. }));

        // every length byte accepted counts, whatever the cut
        for capacity in 1..5 {
            let mut sink = LimitedSink::new(capacity);
            let err = Binary::new(vec![1]).write_to(&mut sink).await.unwrap_err();
            assert_eq!(err.transferred(), Some(capacity as u64));
        }

        // sink refuses everything
        let mut sink = LimitedSink::new(0);
        let err = Binary::new(vec![1]).write_to(&mut sink).await.unwrap_err();
        assert!(matches!(err, AppError::Io { field: FrameField::Type, transferred: 0, .. }));
    }
}
