//! Occupancy bitmap for sparse volume images
//!
//! Each bit marks whether the corresponding block of the captured volume holds
//! filesystem data. Bit `i % 8` of byte `i / 8` is set for occupied block `i`.
//! The bitmap is read-only once an image is opened; it drives both the presence
//! test and the readahead scan.

use crate::error::{ImageError, Result};

/// Block bitmap for tracking occupied blocks of an image
#[derive(Clone)]
pub struct BlockBitmap {
    /// Bitmap data (each bit represents one block)
    bitmap: Vec<u8>,
    /// Total number of blocks that can be tracked
    total_blocks: u64,
}

impl BlockBitmap {
    /// Wrap a packed bitmap describing `total_blocks` blocks.
    ///
    /// The bitmap must hold at least `ceil(total_blocks / 8)` bytes. Extra
    /// trailing bytes are kept but never consulted.
    pub fn new(bitmap: Vec<u8>, total_blocks: u64) -> Result<Self> {
        let required = Self::bytes_for(total_blocks);
        if (bitmap.len() as u64) < required {
            return Err(ImageError::InvalidLayout(format!(
                "bitmap has {} bytes, {} blocks need {}",
                bitmap.len(),
                total_blocks,
                required
            )));
        }

        Ok(Self {
            bitmap,
            total_blocks,
        })
    }

    /// Build a bitmap with the given blocks marked occupied
    pub fn from_used_blocks(total_blocks: u64, used: impl IntoIterator<Item = u64>) -> Result<Self> {
        let mut bitmap = vec![0u8; Self::bytes_for(total_blocks) as usize];
        for block_idx in used {
            if block_idx >= total_blocks {
                return Err(ImageError::OutOfRange {
                    block: block_idx,
                    total: total_blocks,
                });
            }
            bitmap[(block_idx / 8) as usize] |= 1 << (block_idx % 8);
        }
        Ok(Self {
            bitmap,
            total_blocks,
        })
    }

    /// Number of bytes needed to describe `total_blocks` blocks
    pub fn bytes_for(total_blocks: u64) -> u64 {
        (total_blocks + 7) / 8
    }

    /// Check if a block is occupied
    ///
    /// Indices past the end of the device are reported as not occupied.
    pub fn is_used(&self, block_idx: u64) -> bool {
        if block_idx >= self.total_blocks {
            return false;
        }

        let byte_idx = (block_idx / 8) as usize;
        let bit = (block_idx % 8) as u8;

        (self.bitmap[byte_idx] & (1 << bit)) != 0
    }

    /// First occupied block at or after `from`
    pub fn next_used(&self, from: u64) -> Option<u64> {
        let mut block_idx = from;
        while block_idx < self.total_blocks {
            let byte_idx = (block_idx / 8) as usize;
            let bit = block_idx % 8;

            // Whole empty byte: jump to the next byte boundary
            if bit == 0 && self.bitmap[byte_idx] == 0 {
                block_idx += 8;
                continue;
            }

            if self.is_used(block_idx) {
                return Some(block_idx);
            }
            block_idx += 1;
        }
        None
    }

    /// Iterate over occupied block indices in ascending order
    pub fn iter_used(&self) -> impl Iterator<Item = u64> + '_ {
        let mut next = self.next_used(0);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.next_used(current + 1);
            Some(current)
        })
    }

    /// Count occupied blocks, ignoring padding bits past `total_blocks`
    pub fn count_used(&self) -> u64 {
        let full_bytes = (self.total_blocks / 8) as usize;
        let mut used: u64 = self.bitmap[..full_bytes]
            .iter()
            .map(|b| b.count_ones() as u64)
            .sum();

        let tail_bits = self.total_blocks % 8;
        if tail_bits > 0 {
            let mask = (1u8 << tail_bits) - 1;
            used += (self.bitmap[full_bytes] & mask).count_ones() as u64;
        }

        used
    }

    /// Get the total number of blocks
    pub fn total_blocks(&self) -> u64 {
        self.total_blocks
    }

    /// Get a reference to the raw bitmap bytes
    pub fn bitmap_data(&self) -> &[u8] {
        &self.bitmap
    }
}

impl std::fmt::Debug for BlockBitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockBitmap")
            .field("total_blocks", &self.total_blocks)
            .field("used_blocks", &self.count_used())
            .field("bytes", &self.bitmap.len())
            .finish()
    }
}
