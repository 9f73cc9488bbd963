//! Shared helpers for image device tests

#![allow(dead_code)]

use std::future::Future;
use std::io::{Cursor, SeekFrom};
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use sparseimg::{BlockBitmap, DeviceOptions, ImageDevice, ImageLayout};
use tokio::io::{AsyncRead, AsyncSeek, ReadBuf};
use tokio::time::Sleep;

pub const BLOCK_SIZE: u64 = 512;

/// Image contents where every block is distinguishable from its neighbours
pub fn patterned_image(blocks: u64) -> Vec<u8> {
    (0..blocks * BLOCK_SIZE)
        .map(|i| ((i / BLOCK_SIZE) as u8).wrapping_mul(37) ^ (i % 253) as u8)
        .collect()
}

pub fn block_of(data: &[u8], block: u64) -> &[u8] {
    let start = (block * BLOCK_SIZE) as usize;
    &data[start..start + BLOCK_SIZE as usize]
}

pub fn layout_for(data: &[u8], used: impl IntoIterator<Item = u64>) -> ImageLayout {
    let blocks = data.len() as u64 / BLOCK_SIZE;
    let bitmap = BlockBitmap::from_used_blocks(blocks, used).unwrap();
    ImageLayout::new(BLOCK_SIZE, data.len() as u64, bitmap).unwrap()
}

/// Options that keep retry loops fast in tests
pub fn fast_options() -> DeviceOptions {
    DeviceOptions::new().with_retry_delay(Duration::from_millis(1))
}

pub fn cursor_device<S>(
    source: S,
    layout: ImageLayout,
    options: DeviceOptions,
) -> ImageDevice<S>
where
    S: sparseimg::BlockSource,
{
    ImageDevice::with_source(source, layout, options).unwrap()
}

/// Source that waits `delay` before every read
pub struct SlowSource {
    inner: Cursor<Vec<u8>>,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl SlowSource {
    pub fn new(data: Vec<u8>, delay: Duration) -> Self {
        Self {
            inner: Cursor::new(data),
            delay,
            sleep: None,
        }
    }
}

impl AsyncRead for SlowSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let delay = self.delay;
        let sleep = self
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep(delay)));
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }
        self.sleep = None;
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for SlowSource {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Source whose reads fail inside one block
pub struct FaultySource {
    inner: Cursor<Vec<u8>>,
    bad_block: u64,
}

impl FaultySource {
    pub fn new(data: Vec<u8>, bad_block: u64) -> Self {
        Self {
            inner: Cursor::new(data),
            bad_block,
        }
    }
}

impl AsyncRead for FaultySource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.inner.position() / BLOCK_SIZE == self.bad_block {
            return Poll::Ready(Err(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected media error",
            )));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for FaultySource {
    fn start_seek(mut self: Pin<&mut Self>, position: SeekFrom) -> std::io::Result<()> {
        Pin::new(&mut self.inner).start_seek(position)
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}

/// Source whose seeks always fail, as on a detached device
pub struct UnseekableSource {
    inner: Cursor<Vec<u8>>,
}

impl UnseekableSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            inner: Cursor::new(data),
        }
    }
}

impl AsyncRead for UnseekableSource {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncSeek for UnseekableSource {
    fn start_seek(self: Pin<&mut Self>, _position: SeekFrom) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "injected seek error",
        ))
    }

    fn poll_complete(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<u64>> {
        Pin::new(&mut self.inner).poll_complete(cx)
    }
}
