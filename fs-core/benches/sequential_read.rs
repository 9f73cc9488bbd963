use criterion::{black_box, criterion_group, criterion_main, Criterion};
use sparseimg::{BlockBitmap, DeviceOptions, ImageDevice, ImageLayout};
use std::io::Write;
use tempfile::NamedTempFile;

const BLOCK_SIZE: u64 = 4096;
const BLOCKS: u64 = 2048;

fn image_file() -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    let block = vec![0x5Au8; BLOCK_SIZE as usize];
    for _ in 0..BLOCKS {
        file.write_all(&block).unwrap();
    }
    file.flush().unwrap();
    file
}

fn layout() -> ImageLayout {
    // Three of every four blocks occupied
    let bitmap = BlockBitmap::from_used_blocks(BLOCKS, (0..BLOCKS).filter(|b| b % 4 != 3)).unwrap();
    ImageLayout::new(BLOCK_SIZE, BLOCKS * BLOCK_SIZE, bitmap).unwrap()
}

async fn read_all(path: &std::path::Path, readahead: bool) {
    let options = DeviceOptions::new()
        .with_readahead(readahead)
        .with_readahead_blocks(256);
    let device = ImageDevice::open(path, layout(), options).await.unwrap();

    for block in 0..BLOCKS {
        if let Some(buf) = device.read_block(block).await.unwrap() {
            black_box(&buf[..]);
        }
    }
    device.close().await.unwrap();
}

fn benchmark_sequential_reads(c: &mut Criterion) {
    let file = image_file();
    let runtime = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("sequential_read_direct", |b| {
        b.to_async(&runtime).iter(|| read_all(file.path(), false));
    });

    c.bench_function("sequential_read_readahead", |b| {
        b.to_async(&runtime).iter(|| read_all(file.path(), true));
    });
}

criterion_group!(benches, benchmark_sequential_reads);
criterion_main!(benches);
