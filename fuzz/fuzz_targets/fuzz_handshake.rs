#![no_main]

use libfuzzer_sys::fuzz_target;
use reborn_protocol::core::frame::Framing;
use reborn_protocol::protocol::pipeline::open_handshake;
use reborn_protocol::protocol::Handshake;

fuzz_target!(|data: &[u8]| {
    // Raw handshake bodies
    if let Ok(handshake) = Handshake::decode(data) {
        if let Ok(encoded) = handshake.encode() {
            let again = Handshake::decode(&encoded).expect("re-encoded handshake decodes");
            assert_eq!(again.seed(), handshake.seed());
            assert_eq!(again.version(), handshake.version());
        }
    }

    // Whole handshake frames, marker included
    let _ = open_handshake(data, Framing::Delimited, 64 * 1024);
    let _ = open_handshake(data, Framing::LengthPrefixed, 64 * 1024);
});
