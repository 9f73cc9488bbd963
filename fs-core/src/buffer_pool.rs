//! Block-sized buffer recycling
//!
//! Every block handed out by an [`ImageDevice`](crate::ImageDevice) lives in a
//! [`BlockBuffer`] borrowed from the device's [`BufferPool`]. Dropping the
//! buffer (or passing it to [`BufferPool::release`]) returns the memory to the
//! pool, so a buffer can only ever be given back once.

use parking_lot::Mutex;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Default number of idle buffers kept for reuse
pub const DEFAULT_MAX_IDLE_BUFFERS: usize = 64;

/// Pool of block-sized buffers
pub struct BufferPool {
    block_size: usize,
    max_idle: usize,
    idle: Mutex<Vec<Box<[u8]>>>,
    /// Buffers currently allocated, idle or handed out
    live: AtomicUsize,
}

impl BufferPool {
    /// Create a pool handing out `block_size` byte buffers and keeping at most
    /// `max_idle` of them around once returned
    pub fn new(block_size: usize, max_idle: usize) -> Arc<Self> {
        Arc::new(Self {
            block_size,
            max_idle,
            idle: Mutex::new(Vec::with_capacity(max_idle)),
            live: AtomicUsize::new(0),
        })
    }

    /// Take a buffer from the pool, allocating one if none is idle.
    ///
    /// The most recently released buffer is reused first. Contents are
    /// whatever the previous owner left behind.
    pub fn acquire(self: &Arc<Self>) -> BlockBuffer {
        let recycled = self.idle.lock().pop();
        let data = recycled.unwrap_or_else(|| {
            self.live.fetch_add(1, Ordering::Relaxed);
            vec![0u8; self.block_size].into_boxed_slice()
        });

        BlockBuffer {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    /// Give a buffer back to the pool
    pub fn release(&self, buffer: BlockBuffer) {
        drop(buffer);
    }

    /// Number of buffers currently waiting for reuse
    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Number of buffers handed out and not yet returned
    pub fn outstanding(&self) -> usize {
        let idle = self.idle.lock();
        self.live.load(Ordering::Relaxed) - idle.len()
    }

    /// Size of every buffer handed out by this pool
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Upper bound on idle buffers
    pub fn max_idle(&self) -> usize {
        self.max_idle
    }

    fn put_back(&self, data: Box<[u8]>) {
        let mut idle = self.idle.lock();
        if idle.len() < self.max_idle {
            idle.push(data);
        } else {
            // Pool is full; `data` is freed on return
            self.live.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("block_size", &self.block_size)
            .field("max_idle", &self.max_idle)
            .field("idle", &self.idle_count())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Exclusively owned block buffer that returns to its pool on drop
pub struct BlockBuffer {
    data: Option<Box<[u8]>>,
    pool: Arc<BufferPool>,
}

impl BlockBuffer {
    /// Copy the contents out into a plain vector, releasing the buffer
    pub fn into_vec(self) -> Vec<u8> {
        self.to_vec()
    }

    /// Give the buffer back explicitly; same as dropping it
    pub fn release(self) {}
}

impl Deref for BlockBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for BlockBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl AsRef<[u8]> for BlockBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl Drop for BlockBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.put_back(data);
        }
    }
}

impl fmt::Debug for BlockBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockBuffer").field("len", &self.len()).finish()
    }
}
