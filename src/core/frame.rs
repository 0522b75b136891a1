//! # Frame Reassembly
//!
//! Splits a byte stream into frames and writes frames back out.
//!
//! ## Framing
//! ```text
//! Delimited (default):  [stuffed body] [0x0a]
//! LengthPrefixed:       [length: u16 BE] [body]
//! ```
//! Delimited bodies escape the terminator and the escape byte itself as
//! `[0x7d, byte ^ 0x20]`, so ciphertext may contain any byte value.
//!
//! [`FrameCodec`] plugs into `tokio_util::codec::Framed*`. It remembers how
//! far it has already scanned for a terminator, so a frame arriving in many
//! small reads is scanned once. [`FrameReassembler`] wraps the same codec
//! for callers that push raw chunks by hand.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::constants::{ERR_DANGLING_ESCAPE, ERR_INVALID_ESCAPE};
use crate::error::{ProtocolError, Result};

/// Frame terminator for delimited framing.
pub const FRAME_TERMINATOR: u8 = 0x0a;

/// Escape byte for delimited framing.
pub const FRAME_ESCAPE: u8 = 0x7d;

const ESCAPE_MASK: u8 = 0x20;

/// Length prefix size for legacy framing.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// How frames are delimited on the byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framing {
    /// Terminator-delimited frames with byte stuffing.
    #[default]
    Delimited,
    /// u16 big-endian length prefix, as spoken by the legacy client.
    LengthPrefixed,
}

/// Escape `body` into `dst`.
pub fn stuff(body: &[u8], dst: &mut BytesMut) {
    dst.reserve(body.len() + body.len() / 16 + 1);
    for &byte in body {
        if byte == FRAME_TERMINATOR || byte == FRAME_ESCAPE {
            dst.put_u8(FRAME_ESCAPE);
            dst.put_u8(byte ^ ESCAPE_MASK);
        } else {
            dst.put_u8(byte);
        }
    }
}

/// Reverse [`stuff`].
///
/// # Errors
/// Returns `ProtocolError::MalformedFrame` on a trailing escape byte or an
/// escape sequence that does not decode to an escaped byte
pub fn unstuff(stuffed: &[u8]) -> Result<BytesMut> {
    let mut out = BytesMut::with_capacity(stuffed.len());
    let mut bytes = stuffed.iter();
    while let Some(&byte) = bytes.next() {
        if byte != FRAME_ESCAPE {
            out.put_u8(byte);
            continue;
        }
        let escaped = bytes
            .next()
            .ok_or(ProtocolError::MalformedFrame(ERR_DANGLING_ESCAPE))?
            ^ ESCAPE_MASK;
        if escaped != FRAME_TERMINATOR && escaped != FRAME_ESCAPE {
            return Err(ProtocolError::MalformedFrame(ERR_INVALID_ESCAPE));
        }
        out.put_u8(escaped);
    }
    Ok(out)
}

/// Tokio codec producing one frame body per item.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    framing: Framing,
    max_frame_size: usize,
    next_index: usize,
}

impl FrameCodec {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            max_frame_size,
            next_index: 0,
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Forget scan progress, for use after the read buffer was discarded.
    pub fn reset(&mut self) {
        self.next_index = 0;
    }

    fn too_large(&self, size: usize) -> ProtocolError {
        ProtocolError::FrameTooLarge {
            size,
            max: self.max_frame_size,
        }
    }

    fn decode_delimited(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        let scan_from = self.next_index.min(src.len());
        let found = src[scan_from..]
            .iter()
            .position(|b| *b == FRAME_TERMINATOR)
            .map(|offset| scan_from + offset);

        match found {
            Some(end) => {
                self.next_index = 0;
                if end > self.max_frame_size {
                    return Err(self.too_large(end));
                }
                let mut raw = src.split_to(end + 1);
                raw.truncate(end);
                unstuff(&raw).map(Some)
            }
            None => {
                if src.len() > self.max_frame_size {
                    return Err(self.too_large(src.len()));
                }
                self.next_index = src.len();
                Ok(None)
            }
        }
    }

    fn decode_length_prefixed(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u16::from_be_bytes([src[0], src[1]]) as usize;
        if len > self.max_frame_size {
            return Err(self.too_large(len));
        }

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len)))
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        match self.framing {
            Framing::Delimited => self.decode_delimited(src),
            Framing::LengthPrefixed => self.decode_length_prefixed(src),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, body: Bytes, dst: &mut BytesMut) -> Result<()> {
        match self.framing {
            Framing::Delimited => {
                let start = dst.len();
                stuff(&body, dst);
                let stuffed = dst.len() - start;
                if stuffed > self.max_frame_size {
                    dst.truncate(start);
                    return Err(self.too_large(stuffed));
                }
                dst.put_u8(FRAME_TERMINATOR);
            }
            Framing::LengthPrefixed => {
                let limit = self.max_frame_size.min(u16::MAX as usize);
                if body.len() > limit {
                    return Err(ProtocolError::FrameTooLarge {
                        size: body.len(),
                        max: limit,
                    });
                }
                dst.reserve(LENGTH_PREFIX_SIZE + body.len());
                dst.put_u16(body.len() as u16);
                dst.put_slice(&body);
            }
        }
        Ok(())
    }
}

/// Push-style reassembler owning its own buffer.
#[derive(Debug)]
pub struct FrameReassembler {
    codec: FrameCodec,
    buffer: BytesMut,
}

impl FrameReassembler {
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            codec: FrameCodec::new(framing, max_frame_size),
            buffer: BytesMut::new(),
        }
    }

    /// Append a chunk and return every frame it completes, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<BytesMut>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(frame) = self.codec.decode(&mut self.buffer)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Bytes held waiting for a frame boundary.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Discard everything buffered.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.codec.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut FrameCodec, body: &[u8]) -> BytesMut {
        let mut dst = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(body), &mut dst)
            .expect("encode frame");
        dst
    }

    #[test]
    fn test_stuffing_escapes_terminator_and_escape() {
        let mut dst = BytesMut::new();
        stuff(&[0x01, 0x0a, 0x7d, 0x02], &mut dst);
        assert_eq!(&dst[..], &[0x01, 0x7d, 0x2a, 0x7d, 0x5d, 0x02]);
        assert_eq!(&unstuff(&dst).expect("unstuff")[..], &[0x01, 0x0a, 0x7d, 0x02]);
    }

    #[test]
    fn test_bad_escapes_rejected() {
        assert!(matches!(
            unstuff(&[0x01, 0x7d]),
            Err(ProtocolError::MalformedFrame(reason)) if reason == ERR_DANGLING_ESCAPE
        ));
        assert!(matches!(
            unstuff(&[0x7d, 0x41]),
            Err(ProtocolError::MalformedFrame(reason)) if reason == ERR_INVALID_ESCAPE
        ));
    }

    #[test]
    fn test_delimited_split_delivery() {
        let mut codec = FrameCodec::new(Framing::Delimited, 1024);
        let wire = encode(&mut codec, &[0x02, 0x0a, 0x0a, 0x33]);

        let mut reassembler = FrameReassembler::new(Framing::Delimited, 1024);
        let mut frames = Vec::new();
        for byte in wire.iter() {
            frames.extend(reassembler.push(&[*byte]).expect("push"));
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &[0x02, 0x0a, 0x0a, 0x33]);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_delimited_multiple_frames_one_chunk() {
        let mut codec = FrameCodec::new(Framing::Delimited, 1024);
        let mut wire = encode(&mut codec, b"\x02one");
        wire.extend_from_slice(&encode(&mut codec, b"\x02two"));
        wire.extend_from_slice(b"\x02thr");

        let mut reassembler = FrameReassembler::new(Framing::Delimited, 1024);
        let frames = reassembler.push(&wire).expect("push");
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[1][..], b"\x02two");
        assert_eq!(reassembler.buffered(), 4);

        reassembler.clear();
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_unterminated_oversized_buffer() {
        let mut reassembler = FrameReassembler::new(Framing::Delimited, 8);
        assert!(reassembler.push(&[0x41; 8]).expect("push").is_empty());
        assert!(matches!(
            reassembler.push(&[0x41]),
            Err(ProtocolError::FrameTooLarge { size: 9, max: 8 })
        ));
    }

    #[test]
    fn test_encode_rejects_oversized_frame() {
        let mut codec = FrameCodec::new(Framing::Delimited, 4);
        let mut dst = BytesMut::new();
        let result = codec.encode(Bytes::from_static(&[0x0a, 0x0a, 0x0a]), &mut dst);
        assert!(matches!(result, Err(ProtocolError::FrameTooLarge { size: 6, max: 4 })));
        assert!(dst.is_empty());
    }

    #[test]
    fn test_length_prefixed_roundtrip() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
        let mut wire = encode(&mut codec, b"\x02body\n");
        assert_eq!(&wire[..2], &[0x00, 0x06]);

        let mut partial = wire.split_to(3);
        assert!(codec.decode(&mut partial).expect("decode").is_none());
        partial.extend_from_slice(&wire);
        let frame = codec.decode(&mut partial).expect("decode").expect("frame");
        assert_eq!(&frame[..], b"\x02body\n");
    }

    #[test]
    fn test_length_prefixed_oversized() {
        let mut codec = FrameCodec::new(Framing::LengthPrefixed, 16);
        let mut src = BytesMut::from(&[0x00, 0x20][..]);
        assert!(matches!(
            codec.decode(&mut src),
            Err(ProtocolError::FrameTooLarge { size: 32, max: 16 })
        ));
    }
}
