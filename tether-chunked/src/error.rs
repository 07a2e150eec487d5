//! Chunk decoding error types.

use std::io;
use thiserror::Error;

/// Result type for chunk decoding.
pub type ChunkResult<T> = Result<T, ChunkError>;

/// Framing errors raised while decoding a chunked body.
///
/// Every variant means the connection is no longer usable: the decoder does
/// not resynchronise, and the caller is expected to close the stream.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// The chunk-size field had no hex digits.
    #[error("Invalid chunk length")]
    InvalidChunkLength,

    /// The chunk-size field exceeds 0x7FFFFFFF.
    #[error("Chunk length exceeds the maximum of {max} bytes")]
    ChunkTooLarge {
        /// Largest accepted chunk size.
        max: u32,
    },

    /// Malformed chunk extension or missing CRLF after the size line.
    #[error("Invalid chunk extension")]
    InvalidExtension,

    /// Chunk data was not followed by CRLF.
    #[error("Chunk data not terminated by CRLF")]
    InvalidChunkTerminator,

    /// A trailer line could not be parsed.
    #[error("Invalid trailer header: {0}")]
    InvalidTrailer(String),

    /// The trailer section exceeded its byte budget.
    #[error("Trailer section exceeds {limit} bytes")]
    TrailerTooLarge {
        /// Configured budget.
        limit: usize,
    },

    /// Framing metadata did not fit in the scratch buffer at its maximum size.
    #[error("Chunk metadata exceeds the buffer limit of {limit} bytes")]
    BufferLimitExceeded {
        /// Configured maximum buffer length.
        limit: usize,
    },

    /// The stream ended before the terminal chunk was consumed.
    #[error("Connection closed before the chunked body was complete")]
    ConnectionClosed,
}

impl ChunkError {
    /// The `io::ErrorKind` this error surfaces as.
    pub fn io_kind(&self) -> io::ErrorKind {
        match self {
            Self::ConnectionClosed => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::InvalidData,
        }
    }

    /// Recover a `ChunkError` from an `io::Error` produced by the decoder.
    pub fn from_io(err: &io::Error) -> Option<&ChunkError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<ChunkError>())
    }
}

impl From<ChunkError> for io::Error {
    fn from(err: ChunkError) -> Self {
        io::Error::new(err.io_kind(), err)
    }
}
