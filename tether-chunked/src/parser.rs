//! Sans-IO chunked framing state machine.
//!
//! [`ChunkParser`] owns the scratch buffer and the decode state but never
//! touches a stream. The readers in [`crate::decoder`] drive it: they ask it
//! to decode, and when it reports [`Step::NeedData`] they fill either the
//! scratch buffer ([`ChunkParser::read_space`]) or, for payload bytes with an
//! empty scratch buffer, the caller's buffer directly.

use crate::config::DecoderConfig;
use crate::error::{ChunkError, ChunkResult};
use http::header::{HeaderMap, HeaderName, HeaderValue};
use tether_log::debug;

/// Largest chunk size accepted.
pub const MAX_CHUNK_LENGTH: u32 = 0x7FFF_FFFF;

/// Upper bound on the number of trailer fields.
const MAX_TRAILERS: usize = 64;

/// Position in the chunked message grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Expecting hex digits of the next chunk size.
    ChunkLength,
    /// Expecting optional `;name[=value]` extensions and the CRLF.
    Extension,
    /// Inside chunk data.
    Payload,
    /// Expecting the CRLF after chunk data.
    PayloadEnd,
    /// Expecting trailer fields after the zero-length chunk.
    Trailer,
    /// The message is complete.
    Done,
    /// A framing error occurred; terminal.
    Error,
}

/// Outcome of one decode step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// `n` payload bytes were copied into the destination.
    Data(usize),
    /// More input is required to make progress.
    NeedData,
    /// The message is complete; no more payload follows.
    End,
}

/// Outcome of a partial metadata parse.
enum Parsed<T> {
    Complete(T),
    Incomplete,
}

/// Scratch buffer with a consume cursor.
///
/// `data[pos..filled]` holds bytes read from the stream but not yet parsed.
#[derive(Debug)]
struct Scratch {
    data: Vec<u8>,
    pos: usize,
    filled: usize,
    max_len: usize,
}

impl Scratch {
    fn unparsed(&self) -> &[u8] {
        &self.data[self.pos..self.filled]
    }

    fn available(&self) -> usize {
        self.filled - self.pos
    }

    fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.available());
        self.pos += n;
    }

    /// Make room for the next stream read: reset when fully consumed,
    /// compact when a consumed prefix exists, double when full.
    fn prepare(&mut self) -> ChunkResult<()> {
        if self.pos == self.filled {
            self.pos = 0;
            self.filled = 0;
        } else if self.pos > 0 {
            self.data.copy_within(self.pos..self.filled, 0);
            self.filled -= self.pos;
            self.pos = 0;
        }

        if self.filled == self.data.len() {
            if self.data.len() >= self.max_len {
                return Err(ChunkError::BufferLimitExceeded {
                    limit: self.max_len,
                });
            }
            let grown = (self.data.len().max(1) * 2).min(self.max_len);
            self.data.resize(grown, 0);
        }
        Ok(())
    }

    fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.filled..]
    }
}

/// Chunked transfer-coding state machine over an owned scratch buffer.
#[derive(Debug)]
pub struct ChunkParser {
    state: DecodeState,
    scratch: Scratch,
    chunk_remaining: usize,
    trailers: HeaderMap,
    max_trailer_bytes: usize,
    failure: Option<ChunkError>,
}

impl ChunkParser {
    /// Create a parser with an empty scratch buffer.
    pub fn new(config: &DecoderConfig) -> Self {
        Self::with_buffer(vec![0; config.initial_buffer_size.max(1)], 0, 0, config)
    }

    /// Create a parser seeded with lookahead bytes `buffer[offset..offset + len]`
    /// that were already read from the stream.
    ///
    /// The buffer is adopted as the scratch buffer. A buffer longer than the
    /// configured maximum raises the maximum to its own length.
    pub fn with_buffer(
        mut buffer: Vec<u8>,
        offset: usize,
        len: usize,
        config: &DecoderConfig,
    ) -> Self {
        let offset = offset.min(buffer.len());
        let filled = offset + len.min(buffer.len() - offset);
        if buffer.is_empty() {
            buffer.resize(config.initial_buffer_size.max(1), 0);
        }
        let max_len = config.max_buffer_length.max(buffer.len());

        Self {
            state: DecodeState::ChunkLength,
            scratch: Scratch {
                data: buffer,
                pos: offset,
                filled,
                max_len,
            },
            chunk_remaining: 0,
            trailers: HeaderMap::new(),
            max_trailer_bytes: config.max_trailer_bytes,
            failure: None,
        }
    }

    /// Current decode state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Trailer fields, populated once the message is done.
    pub fn trailers(&self) -> &HeaderMap {
        &self.trailers
    }

    /// Take ownership of the trailer fields.
    pub fn take_trailers(&mut self) -> HeaderMap {
        std::mem::take(&mut self.trailers)
    }

    /// Bytes left in the current chunk.
    pub fn chunk_remaining(&self) -> usize {
        self.chunk_remaining
    }

    /// Buffered bytes not yet consumed by the parser.
    pub fn buffered(&self) -> &[u8] {
        self.scratch.unparsed()
    }

    /// Bytes read past the end of the message, available only once done.
    pub fn leftover(&self) -> Option<&[u8]> {
        (self.state == DecodeState::Done).then(|| self.scratch.unparsed())
    }

    /// Whether the next read should go straight into the caller's buffer:
    /// inside chunk data with nothing buffered. Returns the payload bytes
    /// still owed by the current chunk.
    pub fn direct_payload(&self) -> Option<usize> {
        (self.state == DecodeState::Payload
            && self.chunk_remaining > 0
            && self.scratch.available() == 0)
            .then_some(self.chunk_remaining)
    }

    /// Account for `n` payload bytes read directly into a caller buffer.
    pub fn consume_direct(&mut self, n: usize) {
        debug_assert!(n <= self.chunk_remaining);
        self.chunk_remaining -= n;
    }

    /// Writable space for the next stream read into the scratch buffer.
    pub fn read_space(&mut self) -> ChunkResult<&mut [u8]> {
        match self.scratch.prepare() {
            Ok(()) => Ok(self.scratch.spare_mut()),
            Err(err) => Err(self.fail(err)),
        }
    }

    /// Record `n` bytes read into [`read_space`](Self::read_space).
    pub fn commit(&mut self, n: usize) {
        self.scratch.filled = (self.scratch.filled + n).min(self.scratch.data.len());
    }

    /// Signal that the stream reached EOF. Completion is unaffected; any
    /// other state becomes a connection-closed failure.
    pub fn end_of_stream(&mut self) -> ChunkResult<()> {
        match self.state {
            DecodeState::Done => Ok(()),
            DecodeState::Error => Err(self.stored_failure()),
            _ => Err(self.fail(ChunkError::ConnectionClosed)),
        }
    }

    /// Advance the state machine, copying buffered payload into `dst`.
    ///
    /// Returns [`Step::Data`] with at least one byte whenever payload is
    /// available and `dst` is non-empty.
    pub fn decode(&mut self, dst: &mut [u8]) -> ChunkResult<Step> {
        loop {
            let advanced = match self.state {
                DecodeState::ChunkLength => self.parse_chunk_length(),
                DecodeState::Extension => self.parse_extension(),
                DecodeState::Payload => {
                    if self.chunk_remaining == 0 {
                        self.state = DecodeState::PayloadEnd;
                        continue;
                    }
                    let available = self.scratch.available();
                    if available == 0 {
                        return Ok(Step::NeedData);
                    }
                    let n = dst.len().min(available).min(self.chunk_remaining);
                    if n == 0 {
                        return Ok(Step::Data(0));
                    }
                    let start = self.scratch.pos;
                    dst[..n].copy_from_slice(&self.scratch.data[start..start + n]);
                    self.scratch.consume(n);
                    self.chunk_remaining -= n;
                    return Ok(Step::Data(n));
                }
                DecodeState::PayloadEnd => self.parse_payload_end(),
                DecodeState::Trailer => self.parse_trailer(),
                DecodeState::Done => return Ok(Step::End),
                DecodeState::Error => return Err(self.stored_failure()),
            };

            match advanced {
                Ok(Parsed::Complete(())) => {}
                Ok(Parsed::Incomplete) => return Ok(Step::NeedData),
                Err(err) => return Err(self.fail(err)),
            }
        }
    }

    fn stored_failure(&self) -> ChunkError {
        self.failure.clone().unwrap_or(ChunkError::ConnectionClosed)
    }

    fn fail(&mut self, err: ChunkError) -> ChunkError {
        if self.failure.is_none() {
            debug!(target: "tether::chunked", "chunked decode failed in {:?}: {}", self.state, err);
            self.failure = Some(err.clone());
        }
        self.state = DecodeState::Error;
        err
    }

    fn parse_chunk_length(&mut self) -> ChunkResult<Parsed<()>> {
        let data = self.scratch.unparsed();
        let mut length: u32 = 0;
        let mut digits = 0;

        for &byte in data {
            let Some(value) = hex_value(byte) else {
                break;
            };
            if length > MAX_CHUNK_LENGTH >> 4 {
                return Err(ChunkError::ChunkTooLarge {
                    max: MAX_CHUNK_LENGTH,
                });
            }
            length = (length << 4) | u32::from(value);
            digits += 1;
        }

        if digits == data.len() {
            return Ok(Parsed::Incomplete);
        }
        if digits == 0 {
            return Err(ChunkError::InvalidChunkLength);
        }

        self.scratch.consume(digits);
        self.chunk_remaining = length as usize;
        self.state = DecodeState::Extension;
        Ok(Parsed::Complete(()))
    }

    fn parse_extension(&mut self) -> ChunkResult<Parsed<()>> {
        let Some(consumed) = scan_extension(self.scratch.unparsed())? else {
            return Ok(Parsed::Incomplete);
        };
        self.scratch.consume(consumed);
        self.state = if self.chunk_remaining == 0 {
            DecodeState::Trailer
        } else {
            DecodeState::Payload
        };
        Ok(Parsed::Complete(()))
    }

    fn parse_payload_end(&mut self) -> ChunkResult<Parsed<()>> {
        match scan_crlf(self.scratch.unparsed()) {
            Some(true) => {
                self.scratch.consume(2);
                self.state = DecodeState::ChunkLength;
                Ok(Parsed::Complete(()))
            }
            Some(false) => Err(ChunkError::InvalidChunkTerminator),
            None => Ok(Parsed::Incomplete),
        }
    }

    fn parse_trailer(&mut self) -> ChunkResult<Parsed<()>> {
        let data = self.scratch.unparsed();
        let mut headers = [httparse::EMPTY_HEADER; MAX_TRAILERS];

        let (consumed, fields) = match httparse::parse_headers(data, &mut headers) {
            Ok(httparse::Status::Complete((consumed, parsed))) => {
                let mut fields = Vec::with_capacity(parsed.len());
                for header in parsed {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|_| ChunkError::InvalidTrailer(header.name.to_string()))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|_| ChunkError::InvalidTrailer(header.name.to_string()))?;
                    fields.push((name, value));
                }
                (consumed, fields)
            }
            Ok(httparse::Status::Partial) => {
                if data.len() > self.max_trailer_bytes {
                    return Err(ChunkError::TrailerTooLarge {
                        limit: self.max_trailer_bytes,
                    });
                }
                return Ok(Parsed::Incomplete);
            }
            Err(err) => return Err(ChunkError::InvalidTrailer(err.to_string())),
        };

        if consumed > self.max_trailer_bytes {
            return Err(ChunkError::TrailerTooLarge {
                limit: self.max_trailer_bytes,
            });
        }

        self.scratch.consume(consumed);
        for (name, value) in fields {
            self.trailers.append(name, value);
        }
        self.state = DecodeState::Done;
        Ok(Parsed::Complete(()))
    }
}

// ============================================================================
// Grammar helpers
// ============================================================================

#[inline]
fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[inline]
fn is_whitespace(byte: u8) -> bool {
    byte == b' ' || byte == b'\t'
}

/// RFC 9110 `tchar`.
#[inline]
fn is_token_char(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&byte)
}

/// `Some(true)` for CRLF, `Some(false)` for anything else, `None` if fewer
/// than two bytes are available.
fn scan_crlf(data: &[u8]) -> Option<bool> {
    if data.len() < 2 {
        return None;
    }
    Some(data[0] == b'\r' && data[1] == b'\n')
}

/// Skip spaces and tabs. `None` if the input ran out.
fn skip_whitespace(data: &[u8], mut pos: usize) -> Option<usize> {
    while pos < data.len() {
        if !is_whitespace(data[pos]) {
            return Some(pos);
        }
        pos += 1;
    }
    None
}

/// Consume a non-empty token. `Ok(None)` if the input ran out.
fn scan_token(data: &[u8], start: usize) -> ChunkResult<Option<usize>> {
    let mut pos = start;
    while pos < data.len() {
        if !is_token_char(data[pos]) {
            if pos == start {
                return Err(ChunkError::InvalidExtension);
            }
            return Ok(Some(pos));
        }
        pos += 1;
    }
    Ok(None)
}

/// Consume a quoted string starting at the opening quote. Backslash escapes
/// are accepted for 7-bit characters only.
fn scan_quoted(data: &[u8], start: usize) -> ChunkResult<Option<usize>> {
    let mut pos = start + 1;
    while pos < data.len() {
        match data[pos] {
            b'"' => return Ok(Some(pos + 1)),
            b'\\' => {
                let Some(&escaped) = data.get(pos + 1) else {
                    return Ok(None);
                };
                if escaped > 0x7F {
                    return Err(ChunkError::InvalidExtension);
                }
                pos += 2;
            }
            b'\r' | b'\n' => return Err(ChunkError::InvalidExtension),
            _ => pos += 1,
        }
    }
    Ok(None)
}

/// Scan `*( BWS ";" BWS name [ BWS "=" BWS value ] ) BWS CRLF` and return the
/// number of bytes it spans, `None` if incomplete.
fn scan_extension(data: &[u8]) -> ChunkResult<Option<usize>> {
    macro_rules! need {
        ($e:expr) => {
            match $e {
                Some(v) => v,
                None => return Ok(None),
            }
        };
    }

    let mut pos = need!(skip_whitespace(data, 0));

    while data[pos] == b';' {
        pos = need!(skip_whitespace(data, pos + 1));
        pos = need!(scan_token(data, pos)?);
        pos = need!(skip_whitespace(data, pos));

        if data[pos] == b'=' {
            pos = need!(skip_whitespace(data, pos + 1));
            pos = if data[pos] == b'"' {
                need!(scan_quoted(data, pos)?)
            } else {
                need!(scan_token(data, pos)?)
            };
            pos = need!(skip_whitespace(data, pos));
        }
    }

    match scan_crlf(&data[pos..]) {
        Some(true) => Ok(Some(pos + 2)),
        Some(false) => Err(ChunkError::InvalidExtension),
        None => Ok(None),
    }
}
