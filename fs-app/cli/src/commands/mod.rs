//! Subcommands of the sparseimg CLI

pub mod checksum;
pub mod export;
pub mod info;

use anyhow::{Context, Result};
use clap::Args;
use log::info;
use std::path::PathBuf;

use sparseimg::{DeviceOptions, ImageDevice};
use tokio::fs::File;

/// Image selection shared by every subcommand
#[derive(Args, Debug)]
pub struct ImageArgs {
    /// Raw volume image or block device
    pub image: PathBuf,

    /// Packed occupancy bitmap for the image
    #[arg(short, long)]
    pub bitmap: PathBuf,

    /// Block size the bitmap was built with
    #[arg(long = "block-size", default_value_t = 4096)]
    pub block_size: u64,

    /// JSON file with device options
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl ImageArgs {
    /// Open the image, overriding the configured readahead mode if requested
    pub async fn open(&self, readahead: Option<bool>) -> Result<ImageDevice<File>> {
        let mut options = match &self.config {
            Some(path) => DeviceOptions::from_json_file(path)
                .with_context(|| format!("Failed to load options from {:?}", path))?,
            None => DeviceOptions::default(),
        };
        if let Some(readahead) = readahead {
            options.readahead = readahead;
        }

        info!(
            "Opening {:?} with bitmap {:?} (block size {}, readahead {})",
            self.image, self.bitmap, self.block_size, options.readahead
        );

        ImageDevice::open_with_bitmap(&self.image, &self.bitmap, self.block_size, options)
            .await
            .with_context(|| format!("Failed to open image {:?}", self.image))
    }
}

/// Human-readable byte count
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.2} {}", value, UNITS[unit])
    }
}
