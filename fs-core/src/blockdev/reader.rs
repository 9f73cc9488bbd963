//! Low-level block reads with short-read retry

use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeek, AsyncSeekExt};

use crate::buffer_pool::{BlockBuffer, BufferPool};
use crate::config::DeviceOptions;
use crate::error::{ImageError, Result};
use crate::layout::ImageLayout;

/// Anything a volume image can be read from: a device file, a regular file,
/// or an in-memory cursor
pub trait BlockSource: AsyncRead + AsyncSeek + Send + Unpin + 'static {}

impl<T> BlockSource for T where T: AsyncRead + AsyncSeek + Send + Unpin + 'static {}

/// Reads whole blocks from a source into pooled buffers.
///
/// Short reads are retried after a pause until the retry budget runs out.
/// Any I/O failure sets the shared error flag, which stays set.
pub struct BlockReader<S> {
    source: S,
    layout: Arc<ImageLayout>,
    pool: Arc<BufferPool>,
    has_error: Arc<AtomicBool>,
    retries: u32,
    retry_delay: Duration,
}

impl<S: BlockSource> BlockReader<S> {
    /// Create a reader over `source`
    pub fn new(
        source: S,
        layout: Arc<ImageLayout>,
        pool: Arc<BufferPool>,
        has_error: Arc<AtomicBool>,
        options: &DeviceOptions,
    ) -> Self {
        Self {
            source,
            layout,
            pool,
            has_error,
            retries: options.read_retries,
            retry_delay: options.retry_delay(),
        }
    }

    /// Read one block into a buffer taken from the pool.
    ///
    /// The bitmap is not consulted here; callers decide whether the block is
    /// worth reading.
    pub async fn read_block(&mut self, block: u64) -> Result<BlockBuffer> {
        let offset = self.layout.block_offset(block);

        if let Err(source) = self.source.seek(SeekFrom::Start(offset)).await {
            log::error!("Seeking to block {} (offset {}) failed: {}", block, offset, source);
            self.has_error.store(true, Ordering::Release);
            return Err(ImageError::SeekFailed { block, source });
        }

        // On failure the buffer drops here and goes back to the pool
        let mut buf = self.pool.acquire();
        if let Err(err) = self.read_full(block, &mut buf).await {
            if err.is_io_failure() {
                self.has_error.store(true, Ordering::Release);
            }
            return Err(err);
        }

        log::trace!("Read block {} from device", block);
        Ok(buf)
    }

    async fn read_full(&mut self, block: u64, buf: &mut [u8]) -> Result<()> {
        let expected = buf.len();
        let mut read = self.read_some(&mut buf[..]).await;
        let mut retries_left = self.retries;

        while read < expected {
            if retries_left == 0 {
                log::error!(
                    "Reading block {} from device failed: got {} of {} bytes",
                    block,
                    read,
                    expected
                );
                return Err(ImageError::ShortReadExhausted {
                    block,
                    read,
                    expected,
                });
            }
            retries_left -= 1;

            tokio::time::sleep(self.retry_delay).await;
            log::warn!(
                "Short read on block {} ({} of {} bytes). Retrying",
                block,
                read,
                expected
            );
            read += self.read_some(&mut buf[read..]).await;
        }

        Ok(())
    }

    /// A failed read counts as a read of zero bytes
    async fn read_some(&mut self, buf: &mut [u8]) -> usize {
        match self.source.read(buf).await {
            Ok(n) => n,
            Err(e) => {
                log::warn!("Reading from device failed: {}", e);
                0
            }
        }
    }

    /// Geometry of the image being read
    pub fn layout(&self) -> &Arc<ImageLayout> {
        &self.layout
    }

    /// Whether an I/O failure has been seen on this device
    pub fn has_error(&self) -> bool {
        self.has_error.load(Ordering::Acquire)
    }

    /// Hand back the underlying source
    pub fn into_source(self) -> S {
        self.source
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block_bitmap::BlockBitmap;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    /// Serves at most `chunk` bytes per read call and stops producing data
    /// once `limit` bytes have been read in total
    struct ChunkedSource {
        inner: Cursor<Vec<u8>>,
        chunk: usize,
        limit: Option<usize>,
        served: usize,
    }

    impl AsyncRead for ChunkedSource {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let mut allowed = self.chunk.min(buf.remaining());
            if let Some(limit) = self.limit {
                allowed = allowed.min(limit.saturating_sub(self.served));
            }
            let mut scratch = vec![0u8; allowed];
            let mut limited = ReadBuf::new(&mut scratch);
            let polled = Pin::new(&mut self.inner).poll_read(cx, &mut limited);
            if let Poll::Ready(Ok(())) = polled {
                let n = limited.filled().len();
                buf.put_slice(&scratch[..n]);
                self.served += n;
            }
            polled
        }
    }

    impl AsyncSeek for ChunkedSource {
        fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
            Pin::new(&mut self.inner).start_seek(position)
        }

        fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
            Pin::new(&mut self.inner).poll_complete(cx)
        }
    }

    fn reader_over<S: BlockSource>(source: S, blocks: u64, block_size: u64) -> BlockReader<S> {
        let bitmap = BlockBitmap::from_used_blocks(blocks, 0..blocks).unwrap();
        let layout = Arc::new(ImageLayout::new(block_size, blocks * block_size, bitmap).unwrap());
        let pool = BufferPool::new(block_size as usize, 4);
        let options = DeviceOptions::new().with_retry_delay(Duration::from_millis(1));
        BlockReader::new(source, layout, pool, Arc::new(AtomicBool::new(false)), &options)
    }

    fn patterned(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_reads_block_at_offset() {
        let data = patterned(4 * 512);
        let mut reader = reader_over(Cursor::new(data.clone()), 4, 512);

        let buf = reader.read_block(2).await.unwrap();
        assert_eq!(&buf[..], &data[1024..1536]);
        assert!(!reader.has_error());
    }

    #[tokio::test]
    async fn test_fragmented_reads_are_reassembled() {
        let data = patterned(2 * 4096);
        // 4096 bytes arrive as 1500 + 1500 + 1096
        let source = ChunkedSource {
            inner: Cursor::new(data.clone()),
            chunk: 1500,
            limit: None,
            served: 0,
        };
        let mut reader = reader_over(source, 2, 4096);

        let buf = reader.read_block(1).await.unwrap();
        assert_eq!(&buf[..], &data[4096..]);
        assert!(!reader.has_error());
    }

    #[tokio::test]
    async fn test_stalled_device_exhausts_retries() {
        let source = ChunkedSource {
            inner: Cursor::new(patterned(2 * 4096)),
            chunk: 4096,
            limit: Some(1000),
            served: 0,
        };
        let mut reader = reader_over(source, 2, 4096);

        let result = reader.read_block(0).await;
        assert!(matches!(
            result,
            Err(ImageError::ShortReadExhausted {
                block: 0,
                read: 1000,
                expected: 4096
            })
        ));
        assert!(reader.has_error());

        // The failed buffer was handed back rather than leaked
        assert_eq!(reader.pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_read_past_end_fails() {
        // Layout claims 4 blocks but the source only holds 3
        let mut reader = reader_over(Cursor::new(patterned(3 * 512)), 4, 512);

        let result = reader.read_block(3).await;
        assert!(matches!(result, Err(ImageError::ShortReadExhausted { .. })));
        assert!(reader.has_error());
    }
}
