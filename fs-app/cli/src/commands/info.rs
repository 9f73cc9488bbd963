//! Info command: geometry and used space of an image

use anyhow::Result;
use clap::Parser;

use super::{format_bytes, ImageArgs};

/// Show block counts and used space
#[derive(Parser, Debug)]
#[command(about = "Show block counts and used space of an image")]
pub struct InfoArgs {
    #[command(flatten)]
    pub image: ImageArgs,
}

pub async fn run(args: InfoArgs) -> Result<()> {
    let device = args.image.open(Some(false)).await?;

    let used_blocks = device.used_blocks().count();
    let used_space = device.calculate_used_space();

    println!("Image:        {}", args.image.image.display());
    println!("Device size:  {}", format_bytes(device.size()));
    println!("Block size:   {} bytes", device.block_size());
    println!("Total blocks: {}", device.total_blocks());
    println!("Used blocks:  {}", used_blocks);
    println!("Used space:   {}", format_bytes(used_space));
    if device.total_blocks() > 0 {
        println!(
            "Occupancy:    {:.2}%",
            used_blocks as f64 * 100.0 / device.total_blocks() as f64
        );
    }

    device.close().await?;
    Ok(())
}
