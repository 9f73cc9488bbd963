//! Image geometry: block size, device size and occupancy bitmap

use std::path::Path;

use crate::block_bitmap::BlockBitmap;
use crate::error::{ImageError, Result};

/// Geometry of a captured volume image
#[derive(Debug, Clone)]
pub struct ImageLayout {
    /// Size of one block in bytes
    pub block_size: u64,
    /// Size of the device in bytes
    pub size: u64,
    /// Occupancy bitmap covering every addressable block
    pub bitmap: BlockBitmap,
}

impl ImageLayout {
    /// Describe an image of `size` bytes split into `block_size` byte blocks
    pub fn new(block_size: u64, size: u64, bitmap: BlockBitmap) -> Result<Self> {
        if block_size == 0 {
            return Err(ImageError::InvalidLayout(
                "block size must be non-zero".to_string(),
            ));
        }

        let total_blocks = size / block_size;
        if bitmap.total_blocks() != total_blocks {
            return Err(ImageError::InvalidLayout(format!(
                "bitmap describes {} blocks but the device has {}",
                bitmap.total_blocks(),
                total_blocks
            )));
        }

        Ok(Self {
            block_size,
            size,
            bitmap,
        })
    }

    /// Build a layout from raw bitmap bytes
    pub fn from_bitmap_bytes(block_size: u64, size: u64, bitmap: Vec<u8>) -> Result<Self> {
        if block_size == 0 {
            return Err(ImageError::InvalidLayout(
                "block size must be non-zero".to_string(),
            ));
        }
        let bitmap = BlockBitmap::new(bitmap, size / block_size)?;
        Self::new(block_size, size, bitmap)
    }

    /// Load a packed bitmap stored in a sidecar file next to the image
    pub fn from_bitmap_file(path: impl AsRef<Path>, block_size: u64, size: u64) -> Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        log::debug!(
            "LAYOUT: Loaded {} bitmap bytes from {:?}",
            bytes.len(),
            path
        );
        Self::from_bitmap_bytes(block_size, size, bytes)
    }

    /// Number of addressable blocks
    pub fn total_blocks(&self) -> u64 {
        self.size / self.block_size
    }

    /// Byte offset of a block on the device
    pub fn block_offset(&self, block: u64) -> u64 {
        block * self.block_size
    }

    /// Bytes occupied by filesystem data
    pub fn used_space(&self) -> u64 {
        self.bitmap.count_used() * self.block_size
    }
}

/// Get the size of an image file or block device
pub fn device_size(path: &Path) -> Result<u64> {
    #[cfg(unix)]
    {
        device_size_unix(path)
    }
    #[cfg(not(unix))]
    {
        Ok(std::fs::metadata(path)?.len())
    }
}

/// Unix-specific block device size detection
#[cfg(unix)]
fn device_size_unix(path: &Path) -> Result<u64> {
    use std::fs::File as StdFile;
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::io::AsRawFd;

    // Regular files report their length directly
    let metadata = std::fs::metadata(path)?;
    if !metadata.file_type().is_block_device() {
        return Ok(metadata.len());
    }

    let file = StdFile::open(path).map_err(|source| ImageError::DeviceOpenFailed {
        path: path.to_path_buf(),
        source,
    })?;
    let fd = file.as_raw_fd();

    // BLKGETSIZE64 = 0x80081272 on Linux
    const BLKGETSIZE64: libc::c_ulong = 0x80081272;

    let mut size: u64 = 0;
    let result = unsafe { libc::ioctl(fd, BLKGETSIZE64 as _, &mut size as *mut u64) };

    if result == -1 {
        return Err(ImageError::Io(std::io::Error::last_os_error()));
    }

    Ok(size)
}
