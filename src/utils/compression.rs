//! Per-frame compression negotiation.
//!
//! Every frame starts with a marker byte naming how its payload was
//! compressed. The sender tries the available codecs and keeps whichever
//! output is smallest; the receiver reads the marker and inverts it.

use std::io::{Read, Write};

use crate::config::MAX_PAYLOAD_SIZE;
use crate::error::{ProtocolError, Result};

/// Payloads shorter than this are sent uncompressed without trying.
pub const DEFAULT_THRESHOLD_BYTES: usize = 55;

/// Default compression level shared by zlib and bzip2 (1 fastest, 9 best).
pub const DEFAULT_LEVEL: u32 = 6;

/// Compression applied to a frame payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionMode {
    None,
    Deflate,
    Bzip2,
}

impl CompressionMode {
    /// Marker byte written before the payload.
    pub const fn marker(self) -> u8 {
        match self {
            CompressionMode::None => 0x02,
            CompressionMode::Deflate => 0x04,
            CompressionMode::Bzip2 => 0x06,
        }
    }

    /// Parse a marker byte.
    ///
    /// # Errors
    /// Returns `ProtocolError::InvalidCompressionMarker` for unknown markers
    pub fn from_marker(marker: u8) -> Result<Self> {
        match marker {
            0x02 => Ok(CompressionMode::None),
            0x04 => Ok(CompressionMode::Deflate),
            0x06 => Ok(CompressionMode::Bzip2),
            other => Err(ProtocolError::InvalidCompressionMarker(other)),
        }
    }

    /// Number of leading 4-byte blocks the legacy client encrypts per frame.
    pub const fn cipher_block_limit(self) -> usize {
        match self {
            CompressionMode::None => 12,
            CompressionMode::Deflate | CompressionMode::Bzip2 => 4,
        }
    }
}

/// Outbound compression settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressionPolicy {
    pub enabled: bool,
    pub threshold_bytes: usize,
    pub level: u32,
}

impl Default for CompressionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: DEFAULT_THRESHOLD_BYTES,
            level: DEFAULT_LEVEL,
        }
    }
}

impl CompressionPolicy {
    /// Policy that always sends payloads uncompressed.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Compresses data with the given mode.
///
/// # Errors
/// Returns `ProtocolError::CompressionFailure` if the encoder fails
pub fn compress(data: &[u8], mode: CompressionMode, level: u32) -> Result<Vec<u8>> {
    let level = level.clamp(1, 9);
    match mode {
        CompressionMode::None => Ok(data.to_vec()),
        CompressionMode::Deflate => {
            let mut encoder =
                flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
        }
        CompressionMode::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::new(level));
            encoder
                .write_all(data)
                .map_err(|_| ProtocolError::CompressionFailure)?;
            encoder.finish().map_err(|_| ProtocolError::CompressionFailure)
        }
    }
}

/// Decompresses data, refusing to produce more than `max_size` bytes.
///
/// # Errors
/// Returns `ProtocolError::DecompressionFailure` if:
/// - The stream is corrupt or truncated
/// - Output size exceeds `max_size`
pub fn decompress(data: &[u8], mode: CompressionMode, max_size: usize) -> Result<Vec<u8>> {
    match mode {
        CompressionMode::None => {
            if data.len() > max_size {
                return Err(ProtocolError::DecompressionFailure);
            }
            Ok(data.to_vec())
        }
        CompressionMode::Deflate => read_limited(flate2::read::ZlibDecoder::new(data), max_size),
        CompressionMode::Bzip2 => read_limited(bzip2::read::BzDecoder::new(data), max_size),
    }
}

fn read_limited<R: Read>(mut reader: R, max_size: usize) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut buffer = [0u8; 8192];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                out.extend_from_slice(&buffer[..n]);
                if out.len() > max_size {
                    return Err(ProtocolError::DecompressionFailure);
                }
            }
            Err(_) => return Err(ProtocolError::DecompressionFailure),
        }
    }
    Ok(out)
}

/// Pick the smallest encoding of `payload` allowed by `policy`.
///
/// Ties favor `None`, then `Deflate` over `Bzip2`, so the result is never
/// larger than the input.
pub fn choose_and_encode(
    payload: &[u8],
    policy: &CompressionPolicy,
) -> Result<(CompressionMode, Vec<u8>)> {
    if !policy.enabled || payload.len() < policy.threshold_bytes {
        return Ok((CompressionMode::None, payload.to_vec()));
    }

    let deflated = compress(payload, CompressionMode::Deflate, policy.level)?;
    let bzipped = compress(payload, CompressionMode::Bzip2, policy.level)?;

    let best = if deflated.len() <= bzipped.len() {
        (CompressionMode::Deflate, deflated)
    } else {
        (CompressionMode::Bzip2, bzipped)
    };

    if best.1.len() < payload.len() {
        Ok(best)
    } else {
        Ok((CompressionMode::None, payload.to_vec()))
    }
}

/// Invert [`choose_and_encode`] for a payload carrying `mode`.
pub fn decode(mode: CompressionMode, bytes: &[u8], max_size: usize) -> Result<Vec<u8>> {
    decompress(bytes, mode, max_size)
}

/// Decode with the crate-wide payload ceiling.
pub fn decode_default(mode: CompressionMode, bytes: &[u8]) -> Result<Vec<u8>> {
    decode(mode, bytes, MAX_PAYLOAD_SIZE)
}
