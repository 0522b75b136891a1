#![no_main]

use libfuzzer_sys::fuzz_target;
use reborn_protocol::utils::compression::{compress, decompress, CompressionMode};

const MAX_SIZE: usize = 1024 * 1024;

fuzz_target!(|data: &[u8]| {
    // Round trip through both real codecs
    for mode in [CompressionMode::Deflate, CompressionMode::Bzip2] {
        if let Ok(compressed) = compress(data, mode, 6) {
            if let Ok(restored) = decompress(&compressed, mode, MAX_SIZE) {
                assert_eq!(restored, data);
            }
        }
    }

    // Malformed input must fail cleanly and respect the size limit
    for mode in [CompressionMode::Deflate, CompressionMode::Bzip2] {
        if let Ok(out) = decompress(data, mode, MAX_SIZE) {
            assert!(out.len() <= MAX_SIZE);
        }
    }
});
