use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{read_length, read_tag, read_value, write_frame, Payload, MAX_PAYLOAD_SIZE, TEXT_TYPE};
use crate::{AppError, AppResult};

/// UTF-8 text, tag [`TEXT_TYPE`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Text(String);

impl Text {
    pub fn new(value: impl Into<String>) -> Self {
        Text(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub(crate) async fn read_body<R>(reader: &mut R, max: u32) -> AppResult<(Text, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        let length = read_length(reader, max).await?;
        let value = read_value(reader, length).await?;
        let read = 5 + length as u64;
        let text = String::from_utf8(value).map_err(|_| AppError::InvalidUtf8 { transferred: read })?;
        Ok((Text(text), read))
    }
}

impl From<&str> for Text {
    fn from(value: &str) -> Self {
        Text(value.to_string())
    }
}

impl From<String> for Text {
    fn from(value: String) -> Self {
        Text(value)
    }
}

impl fmt::Display for Text {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Payload for Text {
    fn bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    async fn read_from<R>(&mut self, reader: &mut R) -> AppResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let tag = read_tag(reader).await?;
        if tag != TEXT_TYPE {
            return Err(AppError::InvalidType {
                expected: TEXT_TYPE,
                actual: tag,
            });
        }
        let (text, read) = Text::read_body(reader, MAX_PAYLOAD_SIZE).await?;
        *self = text;
        Ok(read)
    }

    async fn write_to<W>(&self, writer: &mut W) -> AppResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        write_frame(writer, TEXT_TYPE, self.0.as_bytes()).await
    }
}
