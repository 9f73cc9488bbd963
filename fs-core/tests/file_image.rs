//! Images stored in regular files

use sparseimg::{DeviceOptions, ImageDevice};
use tempfile::tempdir;

const BS: usize = 4096;

/// Ten 4K blocks with bitmap bits {0,2,4,6,8}; padding bits in the second
/// byte are set to make sure nothing reads them
fn write_test_image(dir: &std::path::Path) -> (std::path::PathBuf, std::path::PathBuf, Vec<u8>) {
    let data: Vec<u8> = (0..10 * BS).map(|i| (i / BS) as u8 + 1).collect();

    let image_path = dir.join("volume.raw");
    let bitmap_path = dir.join("volume.bitmap");
    std::fs::write(&image_path, &data).unwrap();
    std::fs::write(&bitmap_path, [0b0101_0101u8, 0b1111_1101]).unwrap();

    (image_path, bitmap_path, data)
}

#[tokio::test]
async fn test_used_space_from_file_bitmap() {
    let dir = tempdir().unwrap();
    let (image, bitmap, _) = write_test_image(dir.path());

    let device = ImageDevice::open_with_bitmap(&image, &bitmap, BS as u64, DeviceOptions::default())
        .await
        .unwrap();

    assert_eq!(device.total_blocks(), 10);
    assert_eq!(device.size(), 10 * BS as u64);
    assert_eq!(device.calculate_used_space(), 5 * 4096);
    assert!(!device.has_block(9));
    assert!(!device.has_block(10));
    device.close().await.unwrap();
}

#[tokio::test]
async fn test_export_occupied_blocks() {
    let dir = tempdir().unwrap();
    let (image, bitmap, data) = write_test_image(dir.path());

    for readahead in [false, true] {
        let options = DeviceOptions::new().with_readahead(readahead);
        let device = ImageDevice::open_with_bitmap(&image, &bitmap, BS as u64, options)
            .await
            .unwrap();

        let mut dest = vec![vec![0u8; BS]; 5];
        let filled = device.read_blocks(0, 10, &mut dest, 0).await.unwrap();
        assert_eq!(filled, vec![0, 2, 4, 6, 8]);

        for (slot, block) in filled.iter().enumerate() {
            let start = *block as usize * BS;
            assert_eq!(dest[slot], data[start..start + BS], "readahead={}", readahead);
        }

        assert!(!device.has_error());
        device.close().await.unwrap();
    }
}

#[tokio::test]
async fn test_open_block_device_path_errors() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("missing.raw");
    let bitmap = dir.path().join("missing.bitmap");

    let result =
        ImageDevice::open_with_bitmap(&missing, &bitmap, BS as u64, DeviceOptions::default()).await;
    assert!(matches!(
        result,
        Err(sparseimg::ImageError::DeviceOpenFailed { .. })
    ));
}
