//! Integration tests for the frame codec
//!
//! These tests drive the codec the way `FramedRead` does: partial buffers,
//! several frames per read, and buffer reuse across encodes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use bytes::{Bytes, BytesMut};
use reborn_protocol::core::frame::{FrameCodec, Framing, FRAME_TERMINATOR};
use tokio_util::codec::{Decoder, Encoder};

const BOTH: [Framing; 2] = [Framing::Delimited, Framing::LengthPrefixed];

#[test]
fn test_codec_partial_decode_preserves_buffer() {
    for framing in BOTH {
        let mut codec = FrameCodec::new(framing, 1024);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"partial frame"), &mut wire)
            .unwrap();

        let mut buffer = BytesMut::from(&wire[..5]);
        assert!(codec.decode(&mut buffer).unwrap().is_none());
        assert_eq!(buffer.len(), 5);
    }
}

#[test]
fn test_codec_encode_sizes() {
    let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
    let mut buffer = BytesMut::new();
    codec
        .encode(Bytes::from(vec![7u8; 100]), &mut buffer)
        .unwrap();
    assert_eq!(buffer.len(), 2 + 100);
    assert_eq!(&buffer[..2], &[0x00, 100]);

    let mut codec = FrameCodec::new(Framing::Delimited, 1024);
    let mut buffer = BytesMut::new();
    codec
        .encode(Bytes::from(vec![7u8; 100]), &mut buffer)
        .unwrap();
    assert_eq!(buffer.len(), 100 + 1);
    assert_eq!(buffer[100], FRAME_TERMINATOR);
}

#[test]
fn test_codec_multiple_frames_in_buffer() {
    for framing in BOTH {
        let mut codec = FrameCodec::new(framing, 1024);
        let mut buffer = BytesMut::new();
        codec.encode(Bytes::from_static(b"first"), &mut buffer).unwrap();
        codec
            .encode(Bytes::from_static(b"se\ncond\x7d"), &mut buffer)
            .unwrap();

        assert_eq!(&codec.decode(&mut buffer).unwrap().unwrap()[..], b"first");
        assert_eq!(
            &codec.decode(&mut buffer).unwrap().unwrap()[..],
            b"se\ncond\x7d"
        );
        assert!(buffer.is_empty());
        assert!(codec.decode(&mut buffer).unwrap().is_none());
    }
}

#[test]
fn test_codec_buffer_reuse() {
    let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
    let mut buffer = BytesMut::new();
    for i in 0..10u8 {
        codec.encode(Bytes::from(vec![i; 10]), &mut buffer).unwrap();
    }
    assert_eq!(buffer.len(), 10 * (2 + 10));

    for i in 0..10u8 {
        let frame = codec.decode(&mut buffer).unwrap().unwrap();
        assert_eq!(&frame[..], &[i; 10]);
    }
    assert!(buffer.is_empty());
}

#[test]
fn test_codec_incremental_buffer_fill() {
    for framing in BOTH {
        let mut codec = FrameCodec::new(framing, 1024);
        let mut wire = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"\n\x7dbyte by byte\n"), &mut wire)
            .unwrap();

        let mut buffer = BytesMut::new();
        let mut decoded = None;
        for (i, byte) in wire.iter().enumerate() {
            buffer.extend_from_slice(&[*byte]);
            let result = codec.decode(&mut buffer).unwrap();
            if i + 1 < wire.len() {
                assert!(result.is_none(), "frame completed early at byte {i}");
            } else {
                decoded = result;
            }
        }
        assert_eq!(&decoded.unwrap()[..], b"\n\x7dbyte by byte\n");
    }
}

#[test]
fn test_codec_length_prefixed_split_is_zero_copy() {
    let mut codec = FrameCodec::new(Framing::LengthPrefixed, 1024);
    let mut buffer = BytesMut::new();
    codec
        .encode(Bytes::from_static(b"zero copy body"), &mut buffer)
        .unwrap();

    let body_ptr = buffer[2..].as_ptr();
    let frame = codec.decode(&mut buffer).unwrap().unwrap();
    assert_eq!(frame.as_ptr(), body_ptr);
}

#[test]
fn test_codec_max_size_frames() {
    for framing in BOTH {
        let mut codec = FrameCodec::new(framing, 4096);
        assert_eq!(codec.max_frame_size(), 4096);
        assert_eq!(codec.framing(), framing);

        let body = vec![0x41u8; 4096];
        let mut buffer = BytesMut::new();
        codec.encode(Bytes::from(body.clone()), &mut buffer).unwrap();
        assert_eq!(&codec.decode(&mut buffer).unwrap().unwrap()[..], &body[..]);
    }
}
