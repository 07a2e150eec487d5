//! # Tether Chunked
//!
//! Decoder for the HTTP/1.1 chunked transfer coding.
//!
//! The decoder wraps a stream positioned just after a response head and
//! yields the de-framed payload. Chunk-size lines, extensions, CRLFs and
//! trailers are consumed internally; extensions are validated and discarded,
//! trailers are collected into an [`http::HeaderMap`].
//!
//! ## Blocking
//!
//! ```rust
//! use std::io::{Cursor, Read};
//! use tether_chunked::ChunkedDecoder;
//!
//! let wire = b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
//! let mut decoder = ChunkedDecoder::new(Cursor::new(&wire[..]));
//!
//! let mut body = String::new();
//! decoder.read_to_string(&mut body).unwrap();
//! assert_eq!(body, "hello world");
//! assert!(decoder.is_done());
//! ```
//!
//! ## Async
//!
//! [`ChunkedDecoder`] implements [`tokio::io::AsyncRead`] for any
//! `AsyncRead + Unpin` stream, so `AsyncReadExt` helpers work unchanged.
//!
//! ## Errors
//!
//! Framing problems surface as `io::Error`s of kind `InvalidData`; a stream
//! that ends early surfaces as `UnexpectedEof`. [`ChunkError::from_io`]
//! recovers the precise cause. After any error the decoder is terminal.

pub mod config;
pub mod decoder;
pub mod encode;
pub mod error;
pub mod parser;

pub use config::DecoderConfig;
pub use decoder::ChunkedDecoder;
pub use encode::{EncodeOptions, encode_chunked, encode_chunked_with};
pub use error::{ChunkError, ChunkResult};
pub use parser::{ChunkParser, DecodeState, MAX_CHUNK_LENGTH, Step};
