//! Block access to sparse volume images

mod reader;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::fs::{File, OpenOptions};
use tokio::sync::Mutex;

use crate::buffer_pool::{BlockBuffer, BufferPool};
use crate::cache::{ReadaheadCache, ReadaheadStats};
use crate::config::DeviceOptions;
use crate::error::{ImageError, Result};
use crate::layout::{device_size, ImageLayout};

pub use self::reader::{BlockReader, BlockSource};

/// How blocks reach the caller
enum Access<S> {
    /// Every request reads the source directly
    Direct(Mutex<BlockReader<S>>),
    /// Requests go through the background readahead task
    Readahead(ReadaheadCache<S>),
}

/// A captured volume image whose occupied blocks are listed in a bitmap
pub struct ImageDevice<S> {
    layout: Arc<ImageLayout>,
    pool: Arc<BufferPool>,
    has_error: Arc<AtomicBool>,
    access: Access<S>,
}

impl ImageDevice<File> {
    /// Open an image file or block device read-only.
    ///
    /// The file is closed when the device is dropped.
    pub async fn open(
        path: impl AsRef<Path>,
        layout: ImageLayout,
        options: DeviceOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .open(path)
            .await
            .map_err(|source| {
                log::error!("Error opening device file {:?}: {}", path, source);
                ImageError::DeviceOpenFailed {
                    path: path.to_path_buf(),
                    source,
                }
            })?;

        log::info!(
            "Opened image {:?}: {} blocks of {} bytes, {} occupied",
            path,
            layout.total_blocks(),
            layout.block_size,
            layout.bitmap.count_used()
        );

        Self::with_source(file, layout, options)
    }

    /// Open an image whose occupancy bitmap is stored in a separate file.
    ///
    /// The device size is taken from the image itself.
    pub async fn open_with_bitmap(
        path: impl AsRef<Path>,
        bitmap_path: impl AsRef<Path>,
        block_size: u64,
        options: DeviceOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let size = device_size(path).map_err(|e| match e {
            ImageError::Io(source) => ImageError::DeviceOpenFailed {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })?;
        let layout = ImageLayout::from_bitmap_file(bitmap_path, block_size, size)?;
        Self::open(path, layout, options).await
    }
}

impl<S: BlockSource> ImageDevice<S> {
    /// Wrap an already opened source.
    ///
    /// The source is handed back by [`close`](Self::close). With readahead
    /// enabled this must be called from within a tokio runtime.
    pub fn with_source(source: S, layout: ImageLayout, options: DeviceOptions) -> Result<Self> {
        options.validate()?;

        let block_size = usize::try_from(layout.block_size).map_err(|_| {
            ImageError::InvalidLayout(format!("block size {} is too large", layout.block_size))
        })?;

        let layout = Arc::new(layout);
        let pool = BufferPool::new(block_size, options.max_idle_buffers);
        let has_error = Arc::new(AtomicBool::new(false));
        let reader = BlockReader::new(
            source,
            Arc::clone(&layout),
            Arc::clone(&pool),
            Arc::clone(&has_error),
            &options,
        );

        let access = if options.readahead {
            Access::Readahead(ReadaheadCache::spawn(reader, &options)?)
        } else {
            Access::Direct(Mutex::new(reader))
        };

        Ok(Self {
            layout,
            pool,
            has_error,
            access,
        })
    }

    /// Whether any read on this device has failed. Once set it stays set.
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// Whether the bitmap marks the block as occupied.
    ///
    /// Out-of-range indices are never occupied.
    pub fn has_block(&self, block: u64) -> bool {
        self.layout.bitmap.is_used(block)
    }

    /// Read one block.
    ///
    /// Returns `Ok(None)` for blocks the bitmap marks as unoccupied. The
    /// returned buffer goes back to the device's pool when dropped.
    pub async fn read_block(&self, block: u64) -> Result<Option<BlockBuffer>> {
        let total = self.layout.total_blocks();
        if block >= total {
            return Err(ImageError::OutOfRange { block, total });
        }

        if !self.has_block(block) {
            return Ok(None);
        }

        match &self.access {
            Access::Direct(reader) => {
                let mut reader = reader.lock().await;
                reader.read_block(block).await.map(Some)
            }
            Access::Readahead(cache) => cache.get_block(block).await,
        }
    }

    /// Read `count` consecutive blocks starting at `start`.
    ///
    /// Occupied blocks are copied in order into successive destination
    /// buffers at `offset`; unoccupied blocks are skipped and use no
    /// destination. Returns the indices that were filled.
    pub async fn read_blocks<B>(
        &self,
        start: u64,
        count: u64,
        destinations: &mut [B],
        offset: usize,
    ) -> Result<Vec<u64>>
    where
        B: AsMut<[u8]>,
    {
        let block_size = self.pool.block_size();
        let mut filled = Vec::new();
        let mut currbuf = 0;

        for block in start..start.saturating_add(count) {
            let Some(buf) = self.read_block(block).await? else {
                continue;
            };

            let supplied = destinations.len();
            let dest = destinations
                .get_mut(currbuf)
                .ok_or(ImageError::InsufficientBuffers {
                    needed: currbuf + 1,
                    supplied,
                })?
                .as_mut();

            let required = offset
                .checked_add(block_size)
                .filter(|&end| end <= dest.len())
                .ok_or(ImageError::BufferTooSmall {
                    len: dest.len(),
                    required: offset.saturating_add(block_size),
                })?;

            dest[offset..required].copy_from_slice(&buf);
            self.pool.release(buf);
            currbuf += 1;
            filled.push(block);
        }

        Ok(filled)
    }

    /// Bytes occupied by filesystem data according to the bitmap
    pub fn calculate_used_space(&self) -> u64 {
        self.layout.used_space()
    }

    /// Occupied block indices in ascending order
    pub fn used_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.layout.bitmap.iter_used()
    }

    /// Next occupied block at or after `from`
    pub fn next_used_block(&self, from: u64) -> Option<u64> {
        self.layout.bitmap.next_used(from)
    }

    /// Number of addressable blocks
    pub fn total_blocks(&self) -> u64 {
        self.layout.total_blocks()
    }

    /// Block size in bytes
    pub fn block_size(&self) -> u64 {
        self.layout.block_size
    }

    /// Device size in bytes
    pub fn size(&self) -> u64 {
        self.layout.size
    }

    /// Geometry of the image
    pub fn layout(&self) -> &ImageLayout {
        &self.layout
    }

    /// Buffer pool shared by every read on this device
    pub fn buffer_pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Readahead counters, if readahead is enabled
    pub fn readahead_stats(&self) -> Option<ReadaheadStats> {
        match &self.access {
            Access::Direct(_) => None,
            Access::Readahead(cache) => Some(cache.stats()),
        }
    }

    /// Close the device.
    ///
    /// Stops and waits for the readahead task, if any, then hands the source
    /// back to the caller.
    pub async fn close(self) -> Result<S> {
        let reader = match self.access {
            Access::Direct(reader) => reader.into_inner(),
            Access::Readahead(cache) => cache.shutdown().await?,
        };

        log::info!(
            "Closed image device ({} idle buffers pooled, error flag {})",
            self.pool.idle_count(),
            self.has_error.load(Ordering::Acquire)
        );
        Ok(reader.into_source())
    }
}
