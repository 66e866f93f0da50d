// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;

pub type AppResult<T> = Result<T, AppError>;

/// The TLV sub-field an I/O failure happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameField {
    Type,
    Length,
    Value,
}

impl fmt::Display for FrameField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameField::Type => write!(f, "type"),
            FrameField::Length => write!(f, "length"),
            FrameField::Value => write!(f, "value"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// codec errors, each one knows how many bytes crossed the wire
    #[error("I/O error on {field} field after {transferred} bytes: {source}")]
    Io {
        field: FrameField,
        transferred: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid type tag: expected {expected}, got {actual}")]
    InvalidType { expected: u8, actual: u8 },

    #[error("unknown type tag: {actual}")]
    UnknownType { actual: u8 },

    #[error("maximum payload size exceeded: {length} > {max}")]
    ExceedsMaxPayload { length: u32, max: u32 },

    #[error("text payload is not valid utf-8 ({transferred} bytes read)")]
    InvalidUtf8 { transferred: u64 },

    /// scope errors
    #[error("deadline exceeded: {0}")]
    Timeout(String),

    #[error("canceled: {0}")]
    Cancelled(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalStateError(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),
}

impl AppError {
    /// Bytes handed to the sink, or consumed from the source, before a codec
    /// operation failed. `None` for errors that are not raised by the codec.
    pub fn transferred(&self) -> Option<u64> {
        match self {
            AppError::Io { transferred, .. } => Some(*transferred),
            AppError::InvalidType { .. } | AppError::UnknownType { .. } => Some(1),
            AppError::ExceedsMaxPayload { .. } => Some(5),
            AppError::InvalidUtf8 { transferred } => Some(*transferred),
            _ => None,
        }
    }

    /// The peer broke the framing contract; the connection should be dropped
    /// rather than resynchronized.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            AppError::InvalidType { .. }
                | AppError::UnknownType { .. }
                | AppError::ExceedsMaxPayload { .. }
        )
    }

    /// The source ended before the first byte of a frame, i.e. the peer went
    /// away cleanly rather than in the middle of a message.
    pub fn is_eof_between_frames(&self) -> bool {
        matches!(
            self,
            AppError::Io {
                field: FrameField::Type,
                transferred: 0,
                source,
            } if source.kind() == std::io::ErrorKind::UnexpectedEof
        )
    }

    pub(crate) fn io(field: FrameField, transferred: u64, source: std::io::Error) -> Self {
        AppError::Io {
            field,
            transferred,
            source,
        }
    }
}
