use std::fmt;

use tokio::io::{AsyncRead, AsyncWrite};

use super::{read_tag, Binary, Payload, Text, BINARY_TYPE, MAX_PAYLOAD_SIZE, TEXT_TYPE};
use crate::{AppError, AppResult};

/// Any registered payload variant, chosen by the tag found on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Binary(Binary),
    Text(Text),
}

impl Message {
    pub fn tag(&self) -> u8 {
        match self {
            Message::Binary(_) => BINARY_TYPE,
            Message::Text(_) => TEXT_TYPE,
        }
    }

    /// Decodes one message of whatever variant the tag names, refusing values
    /// longer than `max`.
    pub async fn read_limited<R>(reader: &mut R, max: u32) -> AppResult<(Message, u64)>
    where
        R: AsyncRead + Unpin + Send,
    {
        match read_tag(reader).await? {
            BINARY_TYPE => {
                let (binary, read) = Binary::read_body(reader, max).await?;
                Ok((Message::Binary(binary), read))
            }
            TEXT_TYPE => {
                let (text, read) = Text::read_body(reader, max).await?;
                Ok((Message::Text(text), read))
            }
            actual => Err(AppError::UnknownType { actual }),
        }
    }

    pub async fn decode<R>(reader: &mut R) -> AppResult<Message>
    where
        R: AsyncRead + Unpin + Send,
    {
        Self::read_limited(reader, MAX_PAYLOAD_SIZE)
            .await
            .map(|(message, _)| message)
    }

    /// Encodes into a fresh buffer, for sinks that must receive a frame in
    /// one piece.
    pub async fn to_frame(&self) -> AppResult<Vec<u8>> {
        let mut frame = Vec::with_capacity(self.bytes().len() + super::HEADER_SIZE);
        self.write_to(&mut frame).await?;
        Ok(frame)
    }
}

impl Default for Message {
    fn default() -> Self {
        Message::Binary(Binary::default())
    }
}

impl From<Binary> for Message {
    fn from(value: Binary) -> Self {
        Message::Binary(value)
    }
}

impl From<Text> for Message {
    fn from(value: Text) -> Self {
        Message::Text(value)
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::Binary(binary) => fmt::Display::fmt(binary, f),
            Message::Text(text) => fmt::Display::fmt(text, f),
        }
    }
}

impl Payload for Message {
    fn bytes(&self) -> &[u8] {
        match self {
            Message::Binary(binary) => binary.bytes(),
            Message::Text(text) => text.bytes(),
        }
    }

    async fn read_from<R>(&mut self, reader: &mut R) -> AppResult<u64>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (message, read) = Self::read_limited(reader, MAX_PAYLOAD_SIZE).await?;
        *self = message;
        Ok(read)
    }

    async fn write_to<W>(&self, writer: &mut W) -> AppResult<u64>
    where
        W: AsyncWrite + Unpin + Send,
    {
        match self {
            Message::Binary(binary) => binary.write_to(writer).await,
            Message::Text(text) => text.write_to(writer).await,
        }
    }
}
