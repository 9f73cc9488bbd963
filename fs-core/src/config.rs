//! Device options

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::buffer_pool::DEFAULT_MAX_IDLE_BUFFERS;
use crate::error::{ImageError, Result};

/// Default readahead window (high watermark), in blocks
pub const DEFAULT_READAHEAD_BLOCKS: usize = 5120;

/// Default number of retries after a short read
pub const DEFAULT_READ_RETRIES: u32 = 20;

/// Default pause between short-read retries
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

/// Configuration for an [`ImageDevice`](crate::ImageDevice)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceOptions {
    /// Prefetch upcoming occupied blocks in a background task
    pub readahead: bool,
    /// Cached block count at which prefetching pauses
    pub readahead_blocks: usize,
    /// Cached block count at which prefetching resumes (defaults to half the window)
    pub readahead_low_watermark: Option<usize>,
    /// Idle buffers kept for reuse
    pub max_idle_buffers: usize,
    /// Retries after a short read before giving up
    pub read_retries: u32,
    /// Pause between short-read retries, in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            readahead: false,
            readahead_blocks: DEFAULT_READAHEAD_BLOCKS,
            readahead_low_watermark: None,
            max_idle_buffers: DEFAULT_MAX_IDLE_BUFFERS,
            read_retries: DEFAULT_READ_RETRIES,
            retry_delay_ms: DEFAULT_RETRY_DELAY.as_millis() as u64,
        }
    }
}

impl DeviceOptions {
    /// Create options with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable background readahead
    pub fn with_readahead(mut self, readahead: bool) -> Self {
        self.readahead = readahead;
        self
    }

    /// Set the readahead window (high watermark)
    pub fn with_readahead_blocks(mut self, blocks: usize) -> Self {
        self.readahead_blocks = blocks;
        self
    }

    /// Set the low watermark at which prefetching resumes
    pub fn with_low_watermark(mut self, blocks: usize) -> Self {
        self.readahead_low_watermark = Some(blocks);
        self
    }

    /// Set the idle buffer bound of the pool
    pub fn with_max_idle_buffers(mut self, max_idle: usize) -> Self {
        self.max_idle_buffers = max_idle;
        self
    }

    /// Set the short-read retry budget
    pub fn with_read_retries(mut self, retries: u32) -> Self {
        self.read_retries = retries;
        self
    }

    /// Set the pause between short-read retries
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Pause between short-read retries
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Effective low watermark
    pub fn low_watermark(&self) -> usize {
        self.readahead_low_watermark
            .unwrap_or(self.readahead_blocks / 2)
    }

    /// Check that the options describe a usable configuration
    pub fn validate(&self) -> Result<()> {
        if self.readahead_blocks == 0 {
            return Err(ImageError::InvalidOptions(
                "readahead_blocks must be at least 1".to_string(),
            ));
        }

        if self.low_watermark() >= self.readahead_blocks {
            return Err(ImageError::InvalidOptions(format!(
                "low watermark {} must be below readahead_blocks {}",
                self.low_watermark(),
                self.readahead_blocks
            )));
        }

        Ok(())
    }

    /// Load options from a JSON file; missing fields keep their defaults
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        let options: Self = serde_json::from_str(&contents)?;
        options.validate()?;
        Ok(options)
    }
}
