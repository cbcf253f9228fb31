//! Crate-wide error type.
//!
//! The storage engine and the cache layer share one error enum: the cache is
//! a thin orchestration of engine operations and almost every cache failure
//! is an engine failure surfaced unchanged.  Recoverable conditions are not
//! errors: an unsupported file makes `initialize` return `false`, and a
//! missing or expired cache entry makes `get` return `None`.

use std::io;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// The file is too short, carries the wrong magic, or declares a format
    /// version this build cannot read.  `initialize` converts this into a
    /// `false` return instead of propagating it.
    #[error("Not a blob file: {0}")]
    UnsupportedFormat(String),

    /// A chunk header failed its CRC-16 or declares a payload running past
    /// the end of the file.  During recovery the file is truncated at the
    /// offending offset; during a normal read this propagates.
    #[error("Invalid chunk at offset {position}: {reason}")]
    InvalidChunk { position: u64, reason: String },

    /// A `HEAD` chunk payload did not decode as a cache head.
    #[error("Invalid cache head: {0}")]
    InvalidHead(String),

    /// The coordinator lock was not acquired before the deadline.
    #[error("Storage lock not acquired within {0:?}")]
    Timeout(Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An operation was attempted before `initialize` succeeded.
    #[error("Storage is not initialized")]
    NotInitialized,

    /// A payload does not fit the 32-bit chunk size field.
    #[error("Payload of {0} bytes exceeds the 32-bit chunk size field")]
    SizeOverflow(u64),

    /// A data chunk starts with a compression tag this build does not know.
    #[error("Unknown compression tag {0:#04x} in data head")]
    UnknownCompression(u8),

    /// The serialized index does not fit the shared buffer.
    #[error("Storage info needs {needed} bytes but the shared buffer holds {capacity}")]
    SharedBufferFull { needed: usize, capacity: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn invalid_chunk(position: u64, reason: impl Into<String>) -> Self {
        Error::InvalidChunk { position, reason: reason.into() }
    }
}
