//! Checksum command: CRC32 over every occupied block

use anyhow::{bail, Result};
use clap::Parser;
use log::{debug, info};
use std::time::Instant;

use super::ImageArgs;

/// Checksum the occupied blocks of an image
#[derive(Parser, Debug)]
#[command(about = "Compute a CRC32 over the occupied blocks of an image")]
pub struct ChecksumArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Prefetch blocks in the background
    #[arg(short, long)]
    pub readahead: bool,
}

pub async fn run(args: ChecksumArgs) -> Result<()> {
    let device = args.image.open(args.readahead.then_some(true)).await?;
    let start = Instant::now();

    let mut hasher = crc32fast::Hasher::new();
    let mut blocks = 0u64;
    let used: Vec<u64> = device.used_blocks().collect();

    for block in used {
        match device.read_block(block).await? {
            Some(buf) => {
                hasher.update(&buf);
                blocks += 1;
            }
            None => debug!("Block {} vanished from the bitmap", block),
        }
    }

    if let Some(stats) = device.readahead_stats() {
        info!(
            "Readahead: {} fetched, {} hits, {} misses, peak {} cached",
            stats.fetched, stats.hits, stats.misses, stats.peak_cached
        );
    }

    let failed = device.has_error();
    device.close().await?;
    if failed {
        bail!("Device reported read errors; checksum is not reliable");
    }

    println!("crc32 {:08x} over {} blocks", hasher.finalize(), blocks);
    info!("Checksum took {:.2}s", start.elapsed().as_secs_f64());
    Ok(())
}
