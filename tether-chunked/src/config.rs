//! Decoder configuration.

/// Default initial scratch buffer size (4 KB).
pub const DEFAULT_INITIAL_BUFFER: usize = 4096;

/// Default hard cap on scratch buffer growth (64 KB).
pub const DEFAULT_MAX_BUFFER: usize = 64 * 1024;

/// Configuration for [`crate::ChunkedDecoder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecoderConfig {
    /// Scratch buffer size allocated when no lookahead buffer is supplied
    pub initial_buffer_size: usize,
    /// Maximum scratch buffer length; metadata that does not fit fails
    pub max_buffer_length: usize,
    /// Byte budget for the whole trailer section
    pub max_trailer_bytes: usize,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            initial_buffer_size: DEFAULT_INITIAL_BUFFER,
            max_buffer_length: DEFAULT_MAX_BUFFER,
            max_trailer_bytes: DEFAULT_MAX_BUFFER,
        }
    }
}

impl DecoderConfig {
    /// Create the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Small buffers, for memory-constrained hosts.
    pub fn low_memory() -> Self {
        Self {
            initial_buffer_size: 256,
            max_buffer_length: 8 * 1024,
            max_trailer_bytes: 4 * 1024,
        }
    }

    /// Set the initial scratch buffer size.
    pub fn with_initial_buffer_size(mut self, size: usize) -> Self {
        self.initial_buffer_size = size.max(1);
        self
    }

    /// Set the maximum scratch buffer length.
    pub fn with_max_buffer_length(mut self, size: usize) -> Self {
        self.max_buffer_length = size.max(1);
        self
    }

    /// Set the trailer byte budget.
    pub fn with_max_trailer_bytes(mut self, size: usize) -> Self {
        self.max_trailer_bytes = size;
        self
    }
}
