#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use reborn_protocol::core::frame::{FrameReassembler, Framing};
use reborn_protocol::protocol::schema::{pli, Direction, DispatchTable};
use reborn_protocol::protocol::{InboundEvent, InboundPipeline, OutboundPipeline};
use reborn_protocol::utils::compression::CompressionPolicy;
use reborn_protocol::utils::crypto::{CipherState, Generation};
use reborn_protocol::{FieldValue, Packet};

fn run_series(framing: Framing, policy: CompressionPolicy) {
    let schema = Arc::new(DispatchTable::standard());
    let mut outbound = OutboundPipeline::new(
        CipherState::new(Generation::Gen5, 201),
        policy,
        framing,
        64 * 1024,
    );
    let mut inbound = InboundPipeline::new(
        CipherState::new(Generation::Gen5, 201),
        schema,
        Direction::ClientToServer,
        framing,
        16 * 1024 * 1024,
    );
    let mut reassembler = FrameReassembler::new(framing, 64 * 1024);

    for size in [0usize, 1, 54, 55, 56, 512, 4096, 30_000] {
        for round in 0..200usize {
            // Legacy plaintext ends each packet with a newline.
            let body: Vec<u8> = (0..size)
                .map(|i| ((i * 31 + round) % 251) as u8 + 1)
                .map(|b| if b == b'\n' { b'.' } else { b })
                .collect();
            let packet = Packet::new(pli::TOALL, vec![FieldValue::RawTail(body)]);

            let wire = outbound.encode_packet(&packet).unwrap();
            let frames = reassembler.push(&wire).unwrap();
            assert_eq!(frames.len(), 1);

            let events = inbound.decode_frame(&frames[0]).unwrap();
            assert_eq!(events, vec![InboundEvent::Packet(packet)]);
        }
    }
    assert_eq!(outbound.cipher().iterator(), inbound.cipher().iterator());
}

#[test]
fn stress_delimited_series() {
    run_series(Framing::Delimited, CompressionPolicy::default());
}

#[test]
fn stress_legacy_series_uncompressed() {
    run_series(Framing::LengthPrefixed, CompressionPolicy::disabled());
}

#[test]
fn stress_legacy_series_compressed() {
    run_series(Framing::LengthPrefixed, CompressionPolicy::default());
}
