//! Export command: copy occupied blocks into a sparse output file

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Instant;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::{format_bytes, ImageArgs};

/// Copy the occupied blocks of an image to a new file
#[derive(Parser, Debug)]
#[command(about = "Copy occupied blocks to a sparse output file")]
pub struct ExportArgs {
    #[command(flatten)]
    pub image: ImageArgs,

    /// Output file
    pub output: PathBuf,

    /// Prefetch blocks in the background
    #[arg(short, long)]
    pub readahead: bool,

    /// Blocks requested per bulk read
    #[arg(long, default_value_t = 64)]
    pub batch: u64,

    /// Overwrite the output if it exists
    #[arg(short, long)]
    pub force: bool,
}

pub async fn run(args: ExportArgs) -> Result<()> {
    if args.batch == 0 {
        bail!("--batch must be at least 1");
    }
    if args.output.exists() && !args.force {
        bail!("{:?} already exists (use --force to overwrite)", args.output);
    }

    let device = args.image.open(args.readahead.then_some(true)).await?;
    let block_size = device.block_size();

    let mut output = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&args.output)
        .await
        .with_context(|| format!("Failed to create {:?}", args.output))?;
    output.set_len(device.size()).await?;

    let start = Instant::now();
    let mut dest = vec![vec![0u8; block_size as usize]; args.batch as usize];
    let mut exported = 0u64;
    let mut next = 0;

    while next < device.total_blocks() {
        let count = args.batch.min(device.total_blocks() - next);
        let filled = device.read_blocks(next, count, &mut dest, 0).await?;

        for (slot, block) in filled.iter().enumerate() {
            output.seek(SeekFrom::Start(block * block_size)).await?;
            output.write_all(&dest[slot]).await?;
        }
        exported += filled.len() as u64;
        next += count;
    }
    output.flush().await?;
    output.sync_all().await?;

    let failed = device.has_error();
    device.close().await?;
    if failed {
        warn!("Device reported read errors during export");
        bail!("Export of {:?} is incomplete", args.image.image);
    }

    let elapsed = start.elapsed();
    println!(
        "Exported {} blocks ({}) to {}",
        exported,
        format_bytes(exported * block_size),
        args.output.display()
    );
    info!("Export took {:.2}s", elapsed.as_secs_f64());
    Ok(())
}
