// Copyright (C) 2025 Bonsai Software, Inc.
// This file is part of Cubelink, and is licensed under the
// GNU General Public License, version 3 or later. See the LICENSE file
// or <https://www.gnu.org/licenses/> for details.

use thiserror::Error;

/// Failures surfaced to the caller of a transfer operation. The session
/// stays resumable after any of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransferError {
    #[error("transfer: payload too large: {size} > {max}")]
    TooLarge { size: usize, max: usize },

    #[error("transfer: outbox full")]
    QueueFull,

    #[error("transfer: unknown session {0}")]
    UnknownSession(u16),

    #[error("transfer: digest mismatch for session {0}")]
    DigestMismatch(u16),

    #[error("transfer: invalid chunk: {0}")]
    InvalidChunk(String),
}

impl TransferError {
    pub fn invalid_chunk<S: Into<String>>(msg: S) -> Self {
        TransferError::InvalidChunk(msg.into())
    }
}

#[derive(Debug, Error)]
pub enum StationError {
    #[error("station: invalid argument: {0}")]
    InvalidArgument(String),

    #[error("station: command checksum mismatch for code 0x{0:02x}")]
    Checksum(u8),

    #[error("station: dispatch error: {0}")]
    Dispatch(String),

    #[error("station: internal error: {0}")]
    InternalError(String),

    #[error("station: transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("station: storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error("station: json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("station: link error: {0}")]
    Link(#[from] cubelink_link::LinkError),

    #[error("station: decode error: {0}")]
    Decode(#[from] cubelink_link::DecodeError),
}

impl StationError {
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        StationError::InvalidArgument(msg.into())
    }
    pub fn dispatch<S: Into<String>>(msg: S) -> Self {
        StationError::Dispatch(msg.into())
    }
    pub fn internal_error<S: Into<String>>(msg: S) -> Self {
        StationError::InternalError(msg.into())
    }
}

pub type StationResult<T> = Result<T, StationError>;
