//! Chunked transfer-coding encoder.
//!
//! Produces wire bytes for tests, benchmarks, and callers that need to frame
//! a body for a peer that only speaks chunked.

use bytes::{BufMut, Bytes, BytesMut};

/// Framing options for [`encode_chunked_with`].
#[derive(Debug, Clone, Default)]
pub struct EncodeOptions {
    /// Extension appended to every chunk-size line, without the leading `;`
    pub extension: Option<String>,
    /// Trailer fields emitted after the terminal chunk
    pub trailers: Vec<(String, String)>,
}

impl EncodeOptions {
    /// Options with no extensions and no trailers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `ext` to every chunk-size line.
    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    /// Append a trailer field.
    pub fn with_trailer(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.trailers.push((name.into(), value.into()));
        self
    }
}

/// Frame `payload` as a chunked body.
///
/// Chunk sizes cycle through `chunk_sizes`; zero entries are skipped since a
/// zero-length chunk terminates the body. An empty (or all-zero) size list
/// emits the payload as a single chunk.
pub fn encode_chunked(payload: &[u8], chunk_sizes: &[usize]) -> Bytes {
    encode_chunked_with(payload, chunk_sizes, &EncodeOptions::default())
}

/// Frame `payload` as a chunked body with extensions and trailers.
pub fn encode_chunked_with(
    payload: &[u8],
    chunk_sizes: &[usize],
    options: &EncodeOptions,
) -> Bytes {
    let mut sizes = chunk_sizes
        .iter()
        .copied()
        .filter(|&s| s > 0)
        .cycle()
        .peekable();
    let single = sizes.peek().is_none();

    let mut out = BytesMut::with_capacity(payload.len() + 32);
    let mut rest = payload;
    while !rest.is_empty() {
        let size = if single {
            rest.len()
        } else {
            sizes.next().unwrap_or(rest.len()).min(rest.len())
        };
        put_size_line(&mut out, size, options);
        out.put_slice(&rest[..size]);
        out.put_slice(b"\r\n");
        rest = &rest[size..];
    }

    put_size_line(&mut out, 0, options);
    for (name, value) in &options.trailers {
        out.put_slice(name.as_bytes());
        out.put_slice(b": ");
        out.put_slice(value.as_bytes());
        out.put_slice(b"\r\n");
    }
    out.put_slice(b"\r\n");
    out.freeze()
}

fn put_size_line(out: &mut BytesMut, size: usize, options: &EncodeOptions) {
    out.put_slice(format!("{size:x}").as_bytes());
    if let Some(ext) = &options.extension {
        out.put_u8(b';');
        out.put_slice(ext.as_bytes());
    }
    out.put_slice(b"\r\n");
}
