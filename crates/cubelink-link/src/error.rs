// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use thiserror::Error;

use crate::TransportId;

/// Structural decode failures. The frame is dropped, no reply is sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("decode: size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("decode: unknown message type: 0x{0:02x}")]
    UnknownType(u8),

    #[error("decode: payload too large: {len} > {max}")]
    PayloadTooLarge { len: usize, max: usize },

    #[error("decode: invalid field {field}: {value}")]
    InvalidField { field: &'static str, value: u32 },
}

impl DecodeError {
    pub fn size_mismatch(expected: usize, actual: usize) -> Self {
        DecodeError::SizeMismatch { expected, actual }
    }
}

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("link: internal error: {0}")]
    InternalError(String),

    #[error("link: buffer full: {0}")]
    BufferFull(&'static str),

    #[error("link: transport {0} error: {1}")]
    TransportError(TransportId, String),

    #[error("link: decode error: {0}")]
    DecodeError(#[from] DecodeError),
}

impl LinkError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        LinkError::InvalidArgument(msg.into())
    }
    pub fn internal_error<S: Into<String>>(msg: S) -> Self {
        LinkError::InternalError(msg.into())
    }
    pub fn transport_error<S: Into<String>>(id: TransportId, msg: S) -> Self {
        LinkError::TransportError(id, msg.into())
    }
}

pub type LinkResult<T> = Result<T, LinkError>;
