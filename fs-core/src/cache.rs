//! Readahead cache for sequential image reads
//!
//! A background task owns a window of prefetched blocks and serves requests
//! arriving over a channel. The task walks the occupancy bitmap ahead of the
//! consumer, reading every occupied block not already cached, and pauses once
//! the window is full until consumption drains it to the low watermark. A
//! request for an uncached block redirects the task to that block right away,
//! even while paused.
//!
//! Consumption is assumed to move forward: every request evicts cached blocks
//! below the requested index. Going backwards still works but refetches.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::blockdev::{BlockReader, BlockSource};
use crate::buffer_pool::BlockBuffer;
use crate::config::DeviceOptions;
use crate::error::{ImageError, Result};

type BlockReply = oneshot::Sender<Result<Option<BlockBuffer>>>;

/// Commands accepted by the readahead task
#[derive(Debug)]
pub enum ReadaheadTask {
    /// Hand over one block, fetching it first if it is not cached
    GetBlock {
        /// Requested block
        block: u64,
        /// Where to deliver the block
        reply: BlockReply,
    },
    /// Stop the task
    Shutdown,
}

/// Snapshot of readahead counters
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReadaheadStats {
    /// Blocks currently held in the cache
    pub cached: usize,
    /// Largest cache size observed
    pub peak_cached: usize,
    /// Blocks read from the device by the task
    pub fetched: u64,
    /// Requests served straight from the cache
    pub hits: u64,
    /// Requests that had to wait for a directed fetch
    pub misses: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    cached: AtomicUsize,
    peak_cached: AtomicUsize,
    fetched: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> ReadaheadStats {
        ReadaheadStats {
            cached: self.cached.load(Ordering::Relaxed),
            peak_cached: self.peak_cached.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    fn record_len(&self, len: usize) {
        self.cached.store(len, Ordering::Relaxed);
        self.peak_cached.fetch_max(len, Ordering::Relaxed);
    }
}

/// Hysteresis between the high and low cache watermarks
#[derive(Debug, Clone, Copy)]
struct Watermark {
    high: usize,
    low: usize,
    paused: bool,
}

impl Watermark {
    fn new(high: usize, low: usize) -> Self {
        Self {
            high,
            low,
            paused: false,
        }
    }

    /// Update with the current cache size; returns whether prefetching is paused
    fn update(&mut self, len: usize) -> bool {
        if self.paused {
            if len <= self.low {
                self.paused = false;
            }
        } else if len >= self.high {
            self.paused = true;
        }
        self.paused
    }
}

/// Handle to a running readahead task
pub struct ReadaheadCache<S> {
    sender: mpsc::UnboundedSender<ReadaheadTask>,
    handle: JoinHandle<BlockReader<S>>,
    stats: Arc<StatsCounters>,
}

impl<S: BlockSource> ReadaheadCache<S> {
    /// Start the readahead task on the current tokio runtime.
    ///
    /// The task stays idle until the first request arrives.
    pub fn spawn(reader: BlockReader<S>, options: &DeviceOptions) -> Result<Self> {
        options.validate()?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let stats = Arc::new(StatsCounters::default());

        let prefetcher = Prefetcher {
            reader,
            cache: BTreeMap::new(),
            target: None,
            waiters: Vec::new(),
            watermark: Watermark::new(options.readahead_blocks, options.low_watermark()),
            stats: Arc::clone(&stats),
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            ImageError::InvalidOptions("readahead requires a running tokio runtime".to_string())
        })?;
        let handle = runtime.spawn(prefetcher.run(receiver));

        log::info!(
            "READAHEAD: Started with window of {} blocks (resume at {})",
            options.readahead_blocks,
            options.low_watermark()
        );

        Ok(Self {
            sender,
            handle,
            stats,
        })
    }

    /// Get a block, waiting for the task to fetch it on a miss.
    ///
    /// Returns `Ok(None)` for blocks the bitmap marks as unoccupied and
    /// `ImageError::OutOfRange` past the end of the image.
    pub async fn get_block(&self, block: u64) -> Result<Option<BlockBuffer>> {
        let (reply, response) = oneshot::channel();
        self.sender
            .send(ReadaheadTask::GetBlock { block, reply })
            .map_err(|_| ImageError::ReadaheadStopped)?;

        response.await.map_err(|_| ImageError::ReadaheadStopped)?
    }

    /// Current counters
    pub fn stats(&self) -> ReadaheadStats {
        self.stats.snapshot()
    }

    /// Stop the task and wait for it to exit.
    ///
    /// A fetch in progress completes first. Every cached buffer is returned
    /// to the pool before this returns.
    pub async fn shutdown(self) -> Result<BlockReader<S>> {
        let _ = self.sender.send(ReadaheadTask::Shutdown);

        match self.handle.await {
            Ok(reader) => {
                log::info!("READAHEAD: Shutdown complete");
                Ok(reader)
            }
            Err(e) => {
                log::error!("READAHEAD: Task ended abnormally: {}", e);
                Err(ImageError::ReadaheadStopped)
            }
        }
    }
}

/// State owned by the background task
struct Prefetcher<S> {
    reader: BlockReader<S>,
    cache: BTreeMap<u64, BlockBuffer>,
    /// Next block to fetch; `None` while idle
    target: Option<u64>,
    /// Requests waiting for a directed fetch
    waiters: Vec<(u64, BlockReply)>,
    watermark: Watermark,
    stats: Arc<StatsCounters>,
}

impl<S: BlockSource> Prefetcher<S> {
    async fn run(mut self, mut receiver: mpsc::UnboundedReceiver<ReadaheadTask>) -> BlockReader<S> {
        let mut stop = false;

        while !stop {
            // Commands that arrived while we were reading
            loop {
                match receiver.try_recv() {
                    Ok(task) => stop |= self.handle(task),
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => {
                        stop = true;
                        break;
                    }
                }
            }
            if stop {
                break;
            }

            if let Some(block) = self.next_fetch() {
                self.fetch(block).await;
                tokio::task::yield_now().await;
                continue;
            }

            // Idle or paused: sleep until someone asks for something
            match receiver.recv().await {
                Some(task) => stop = self.handle(task),
                None => stop = true,
            }
        }

        let released = self.cache.len();
        self.cache.clear();
        self.stats.record_len(0);
        log::debug!(
            "READAHEAD: Released {} cached blocks, dropped {} waiting requests",
            released,
            self.waiters.len()
        );
        self.waiters.clear();

        self.reader
    }

    /// Apply one command; returns true on shutdown
    fn handle(&mut self, task: ReadaheadTask) -> bool {
        match task {
            ReadaheadTask::GetBlock { block, reply } => {
                self.request(block, reply);
                false
            }
            ReadaheadTask::Shutdown => true,
        }
    }

    fn request(&mut self, block: u64, reply: BlockReply) {
        let total = self.reader.layout().total_blocks();
        if block >= total {
            let _ = reply.send(Err(ImageError::OutOfRange { block, total }));
            return;
        }

        self.evict_below(block);

        if !self.reader.layout().bitmap.is_used(block) {
            let _ = reply.send(Ok(None));
            return;
        }

        if let Some(buf) = self.cache.remove(&block) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            self.stats.record_len(self.cache.len());
            // If the requester has gone away the buffer drops back into the pool
            let _ = reply.send(Ok(Some(buf)));
            return;
        }

        log::debug!("READAHEAD: Miss on block {}", block);
        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        self.target = Some(block);
        self.waiters.push((block, reply));
    }

    /// Drop cached blocks the consumer has moved past
    fn evict_below(&mut self, block: u64) {
        let keep = self.cache.split_off(&block);
        let evicted = std::mem::replace(&mut self.cache, keep);
        if !evicted.is_empty() {
            log::debug!(
                "READAHEAD: Evicted {} blocks below {}",
                evicted.len(),
                block
            );
            self.stats.record_len(self.cache.len());
        }

        if matches!(self.target, Some(target) if target < block) {
            self.target = Some(block);
        }
    }

    /// Pick the next block to read, or `None` if idle or paused
    fn next_fetch(&mut self) -> Option<u64> {
        let paused = self.watermark.update(self.cache.len());
        if paused && self.waiters.is_empty() {
            return None;
        }

        self.advance_target();
        self.target
    }

    /// Move the target forward past blocks that are unoccupied or already cached
    fn advance_target(&mut self) {
        let Some(mut candidate) = self.target else {
            return;
        };

        let bitmap = &self.reader.layout().bitmap;
        self.target = loop {
            match bitmap.next_used(candidate) {
                Some(block) if self.cache.contains_key(&block) => candidate = block + 1,
                next => break next,
            }
        };
    }

    async fn fetch(&mut self, block: u64) {
        match self.reader.read_block(block).await {
            Ok(buf) => {
                self.stats.fetched.fetch_add(1, Ordering::Relaxed);
                self.cache.insert(block, buf);
            }
            Err(err) => {
                log::warn!("READAHEAD: Fetching block {} failed: {}", block, err);
                self.fail_waiters(block, err);
            }
        }

        self.target = Some(block + 1);
        self.serve_waiters();
        self.stats.record_len(self.cache.len());
    }

    /// Answer every waiter whose block is now cached
    fn serve_waiters(&mut self) {
        if self.waiters.is_empty() {
            return;
        }

        let mut pending = Vec::with_capacity(self.waiters.len());
        for (block, reply) in self.waiters.drain(..) {
            match self.cache.remove(&block) {
                Some(buf) => {
                    let _ = reply.send(Ok(Some(buf)));
                }
                None => pending.push((block, reply)),
            }
        }
        self.waiters = pending;

        if let Some((block, _)) = self.waiters.first() {
            self.target = Some(*block);
        }
    }

    /// Deliver a fetch failure to everyone waiting on that block
    fn fail_waiters(&mut self, block: u64, err: ImageError) {
        let mut err = Some(err);
        let (failed, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|(waiting_on, _)| *waiting_on == block);
        self.waiters = pending;

        for (_, reply) in failed {
            let reply_err = err.take().unwrap_or_else(|| {
                ImageError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("reading block {} failed", block),
                ))
            });
            let _ = reply.send(Err(reply_err));
        }
    }
}
