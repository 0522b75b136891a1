#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use reborn_protocol::core::frame::{FrameReassembler, Framing};
use reborn_protocol::protocol::schema::{Direction, DispatchTable};
use reborn_protocol::protocol::InboundPipeline;
use reborn_protocol::utils::crypto::{CipherState, Generation};

fuzz_target!(|data: &[u8]| {
    let Some((&seed, stream)) = data.split_first() else {
        return;
    };
    let schema = Arc::new(DispatchTable::standard());

    for framing in [Framing::Delimited, Framing::LengthPrefixed] {
        let mut reassembler = FrameReassembler::new(framing, 64 * 1024);
        let mut pipeline = InboundPipeline::new(
            CipherState::new(Generation::Gen5, seed % 223),
            Arc::clone(&schema),
            Direction::ClientToServer,
            framing,
            1024 * 1024,
        );

        // Feed in uneven chunks to exercise partial frames
        for chunk in stream.chunks(usize::from(seed % 31) + 1) {
            let Ok(frames) = reassembler.push(chunk) else {
                break;
            };
            for frame in frames {
                if pipeline.decode_frame(&frame).is_err() {
                    break;
                }
            }
        }
    }
});
