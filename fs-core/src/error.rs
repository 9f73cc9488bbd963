//! Error types for sparse image access

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for image device operations
#[derive(Error, Debug)]
pub enum ImageError {
    /// The device or image file could not be opened
    #[error("Failed to open device {path:?}: {source}")]
    DeviceOpenFailed {
        /// Path that was being opened
        path: PathBuf,
        /// Underlying OS error
        source: io::Error,
    },

    /// Seeking to the start of a block failed
    #[error("Seeking to block {block} failed: {source}")]
    SeekFailed {
        /// Block that was being positioned to
        block: u64,
        /// Underlying OS error
        source: io::Error,
    },

    /// The device kept returning short reads until the retry budget ran out
    #[error("Reading block {block} failed after retries: got {read} of {expected} bytes")]
    ShortReadExhausted {
        /// Block that was being read
        block: u64,
        /// Bytes read before giving up
        read: usize,
        /// Bytes that were requested
        expected: usize,
    },

    /// Block index is past the end of the device
    #[error("Block {block} is out of range (device has {total} blocks)")]
    OutOfRange {
        /// Requested block
        block: u64,
        /// Number of addressable blocks
        total: u64,
    },

    /// Fewer destination buffers than occupied blocks in a bulk read
    #[error("Not enough destination buffers: needed at least {needed}, got {supplied}")]
    InsufficientBuffers {
        /// Buffers needed so far
        needed: usize,
        /// Buffers supplied by the caller
        supplied: usize,
    },

    /// A destination buffer cannot hold a block at the requested offset
    #[error("Destination buffer of {len} bytes is too small, {required} required")]
    BufferTooSmall {
        /// Length of the destination buffer
        len: usize,
        /// Bytes required (offset + block size)
        required: usize,
    },

    /// Geometry or bitmap does not describe a usable image
    #[error("Invalid image layout: {0}")]
    InvalidLayout(String),

    /// Device options are inconsistent
    #[error("Invalid device options: {0}")]
    InvalidOptions(String),

    /// The readahead task exited before answering a request
    #[error("Readahead task is not running")]
    ReadaheadStopped,

    /// Other I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Options file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] serde_json::Error),
}

impl ImageError {
    /// Whether this error comes from device I/O and therefore marks the
    /// device as failed.
    pub fn is_io_failure(&self) -> bool {
        matches!(
            self,
            ImageError::SeekFailed { .. } | ImageError::ShortReadExhausted { .. } | ImageError::Io(_)
        )
    }
}

/// Result type for image device operations
pub type Result<T> = std::result::Result<T, ImageError>;
