//! Chunked body readers over blocking and async streams.
//!
//! [`ChunkedDecoder`] wraps a stream positioned at the first chunk-size line
//! and yields only payload bytes. It implements [`std::io::Read`] when the
//! stream does and [`tokio::io::AsyncRead`] when the stream does.
//!
//! Each call to `read`/`poll_read` delivers at most one contiguous span of
//! payload. When the scratch buffer is empty and the decoder is inside chunk
//! data, the underlying stream reads directly into the caller's buffer.

use crate::config::DecoderConfig;
use crate::parser::{ChunkParser, DecodeState, Step};
use bytes::Bytes;
use http::HeaderMap;
use std::io::{self, Read};
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

/// Decodes an HTTP/1.1 chunked body from `S`.
#[derive(Debug)]
pub struct ChunkedDecoder<S> {
    inner: S,
    parser: ChunkParser,
}

impl<S> ChunkedDecoder<S> {
    /// Wrap `inner` with the default configuration.
    pub fn new(inner: S) -> Self {
        Self::with_config(inner, DecoderConfig::default())
    }

    /// Wrap `inner` with an explicit configuration.
    pub fn with_config(inner: S, config: DecoderConfig) -> Self {
        Self {
            parser: ChunkParser::new(&config),
            inner,
        }
    }

    /// Wrap `inner` together with bytes that were already read from it.
    ///
    /// `buffer[offset..offset + len]` must be the stream content immediately
    /// preceding what `inner` will yield next; typically the tail of the read
    /// that delivered the response head.
    pub fn with_buffer(
        inner: S,
        buffer: Vec<u8>,
        offset: usize,
        len: usize,
        config: DecoderConfig,
    ) -> Self {
        Self {
            parser: ChunkParser::with_buffer(buffer, offset, len, &config),
            inner,
        }
    }

    /// Current decode state.
    pub fn state(&self) -> DecodeState {
        self.parser.state()
    }

    /// Whether the terminal chunk and trailers have been consumed.
    pub fn is_done(&self) -> bool {
        self.parser.state() == DecodeState::Done
    }

    /// Trailer fields; empty until [`is_done`](Self::is_done).
    pub fn trailers(&self) -> &HeaderMap {
        self.parser.trailers()
    }

    /// Bytes read from the stream past the end of the chunked body.
    ///
    /// `None` unless the body is done. The bytes belong to whatever follows on
    /// the connection, such as the next pipelined response.
    pub fn try_get_leftover_bytes(&self) -> Option<&[u8]> {
        self.parser.leftover()
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }

    /// Mutably borrow the underlying stream. Reading from it directly
    /// desynchronizes the decoder.
    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }

    /// Release the stream together with any bytes buffered past the current
    /// position.
    pub fn into_parts(self) -> (S, Bytes) {
        let buffered = Bytes::copy_from_slice(self.parser.buffered());
        (self.inner, buffered)
    }
}

// ============================================================================
// Blocking reader
// ============================================================================

impl<S: Read> Read for ChunkedDecoder<S> {
    fn read(&mut self, dst: &mut [u8]) -> io::Result<usize> {
        if dst.is_empty() && self.parser.state() != DecodeState::Error {
            return Ok(0);
        }

        loop {
            match self.parser.decode(dst)? {
                Step::Data(n) => return Ok(n),
                Step::End => return Ok(0),
                Step::NeedData => {}
            }

            if let Some(owed) = self.parser.direct_payload() {
                let want = owed.min(dst.len());
                let n = read_retrying(&mut self.inner, &mut dst[..want])?;
                if n == 0 {
                    self.parser.end_of_stream()?;
                    return Ok(0);
                }
                self.parser.consume_direct(n);
                return Ok(n);
            }

            let space = self.parser.read_space()?;
            let n = read_retrying(&mut self.inner, space)?;
            if n == 0 {
                self.parser.end_of_stream()?;
                return Ok(0);
            }
            self.parser.commit(n);
        }
    }
}

fn read_retrying<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        match reader.read(buf) {
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

// ============================================================================
// Async reader
// ============================================================================

impl<S: AsyncRead + Unpin> AsyncRead for ChunkedDecoder<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 && this.parser.state() != DecodeState::Error {
            return Poll::Ready(Ok(()));
        }

        loop {
            let step = this.parser.decode(buf.initialize_unfilled())?;
            match step {
                Step::Data(n) => {
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
                Step::End => return Poll::Ready(Ok(())),
                Step::NeedData => {}
            }

            if let Some(owed) = this.parser.direct_payload() {
                let unfilled = buf.initialize_unfilled();
                let want = owed.min(unfilled.len());
                let mut direct = ReadBuf::new(&mut unfilled[..want]);
                ready!(Pin::new(&mut this.inner).poll_read(cx, &mut direct))?;
                let n = direct.filled().len();
                if n == 0 {
                    this.parser.end_of_stream()?;
                    return Poll::Ready(Ok(()));
                }
                this.parser.consume_direct(n);
                buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            let space = this.parser.read_space()?;
            let mut scratch = ReadBuf::new(space);
            ready!(Pin::new(&mut this.inner).poll_read(cx, &mut scratch))?;
            let n = scratch.filled().len();
            if n == 0 {
                this.parser.end_of_stream()?;
                return Poll::Ready(Ok(()));
            }
            this.parser.commit(n);
        }
    }
}
