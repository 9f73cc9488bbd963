//! sparseimg core - read path for bitmap-described volume images
//!
//! A captured volume image stores every block of the original device, but
//! only the blocks marked in its occupancy bitmap carry filesystem data. This
//! crate reads those blocks for exporters and verifiers, optionally through a
//! background readahead task that keeps a bounded window of upcoming blocks
//! in memory.
//!
//! ```no_run
//! use sparseimg::{DeviceOptions, ImageDevice};
//!
//! # async fn run() -> sparseimg::Result<()> {
//! let options = DeviceOptions::new().with_readahead(true);
//! let device = ImageDevice::open_with_bitmap("volume.raw", "volume.bitmap", 4096, options).await?;
//!
//! for block in device.used_blocks().collect::<Vec<_>>() {
//!     if let Some(buf) = device.read_block(block).await? {
//!         // buf derefs to the block's bytes and returns to the pool on drop
//!         let _ = &buf[..];
//!     }
//! }
//!
//! device.close().await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]
#![warn(rust_2018_idioms)]

pub mod block_bitmap;
pub mod blockdev;
pub mod buffer_pool;
pub mod cache;
pub mod config;
pub mod error;
pub mod layout;

// Re-export the main types
pub use block_bitmap::BlockBitmap;
pub use blockdev::{BlockReader, BlockSource, ImageDevice};
pub use buffer_pool::{BlockBuffer, BufferPool};
pub use cache::{ReadaheadCache, ReadaheadStats};
pub use config::DeviceOptions;
pub use error::{ImageError, Result};
pub use layout::{device_size, ImageLayout};

/// Re-export common types and traits
pub mod prelude {
    pub use crate::error::Result;
    pub use crate::{BlockBuffer, DeviceOptions, ImageDevice, ImageLayout};
}
