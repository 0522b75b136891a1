//! Inbound and outbound packet pipelines.
//!
//! Outbound, a packet is serialized, compressed with whichever codec wins,
//! encrypted, and prefixed with its compression marker:
//!
//! ```text
//! Packet -> plaintext -> compress -> encrypt -> [marker][ciphertext]
//! ```
//!
//! Inbound runs the same steps backwards. Each pipeline owns the cipher
//! state of its direction, so frames must pass through in wire order.
//!
//! With length-prefixed framing, plaintext is a run of packets each closed
//! by `0x0a`, and only the leading blocks of each frame are encrypted. With
//! delimited framing, a frame carries exactly one packet and is encrypted in
//! full.

use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::Encoder;
use tracing::{debug, trace};

use crate::core::frame::{FrameCodec, Framing};
use crate::core::packet::Packet;
use crate::error::constants::{
    ERR_EMPTY_FRAME, ERR_EMPTY_PLAINTEXT, ERR_MISSING_TERMINATOR, ERR_TERMINATOR_IN_PACKET,
};
use crate::error::{ProtocolError, Result};
use crate::protocol::handshake::Handshake;
use crate::protocol::schema::{Direction, DispatchTable, InboundEvent};
use crate::utils::compression::{self, CompressionMode, CompressionPolicy};
use crate::utils::crypto::CipherState;

/// Packet terminator inside legacy plaintext.
pub const PACKET_TERMINATOR: u8 = b'\n';

/// A sealed frame body and the compression it carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedFrame {
    pub mode: CompressionMode,
    pub body: Bytes,
}

/// Compressed plaintext that has not been through the cipher yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedFrame {
    pub mode: CompressionMode,
    pub payload: Vec<u8>,
}

/// Outbound settings that do not depend on cipher state.
///
/// Every check that can reject an outbound packet runs here, so a packet
/// that prepares cleanly never fails once the cipher has consumed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePolicy {
    pub compression: CompressionPolicy,
    pub framing: Framing,
    pub max_frame_size: usize,
}

impl FramePolicy {
    pub fn new(compression: CompressionPolicy, framing: Framing, max_frame_size: usize) -> Self {
        Self {
            compression,
            framing,
            max_frame_size,
        }
    }

    /// Largest frame body the framing can carry.
    pub fn frame_limit(&self) -> usize {
        match self.framing {
            Framing::Delimited => self.max_frame_size,
            Framing::LengthPrefixed => self.max_frame_size.min(u16::MAX as usize),
        }
    }

    /// Serialize and compress one packet.
    ///
    /// # Errors
    /// - `ProtocolError::FieldOutOfRange` if a value does not fit its field
    /// - `ProtocolError::MalformedField` if legacy plaintext would contain the
    ///   packet terminator
    /// - `ProtocolError::FrameTooLarge` if the frame body exceeds the limit
    pub fn prepare_packet(&self, packet: &Packet) -> Result<PreparedFrame> {
        let mut plaintext = packet.encode()?;
        if self.framing == Framing::LengthPrefixed {
            check_terminator_free(&plaintext)?;
            plaintext.push(PACKET_TERMINATOR);
        }
        self.prepare(&plaintext)
    }

    /// Serialize several packets into one legacy frame.
    ///
    /// With delimited framing each packet needs its own frame, so this
    /// prepares only when given exactly one packet.
    pub fn prepare_batch(&self, packets: &[Packet]) -> Result<PreparedFrame> {
        if self.framing == Framing::Delimited {
            return match packets {
                [packet] => self.prepare_packet(packet),
                _ => Err(ProtocolError::Custom(
                    "Delimited framing carries one packet per frame".to_string(),
                )),
            };
        }

        let mut plaintext = Vec::new();
        for packet in packets {
            let start = plaintext.len();
            packet.write_to(&mut plaintext)?;
            check_terminator_free(&plaintext[start..])?;
            plaintext.push(PACKET_TERMINATOR);
        }
        self.prepare(&plaintext)
    }

    /// Compress `plaintext` and check the frame body it will become.
    pub fn prepare(&self, plaintext: &[u8]) -> Result<PreparedFrame> {
        let (mode, payload) = compression::choose_and_encode(plaintext, &self.compression)?;
        let size = 1 + payload.len();
        let max = self.frame_limit();
        if size > max {
            return Err(ProtocolError::FrameTooLarge { size, max });
        }
        Ok(PreparedFrame { mode, payload })
    }
}

/// Legacy plaintext splits packets on `0x0a`, so a packet may not contain it.
fn check_terminator_free(packet: &[u8]) -> Result<()> {
    match packet.iter().position(|b| *b == PACKET_TERMINATOR) {
        Some(offset) => Err(ProtocolError::malformed(offset, ERR_TERMINATOR_IN_PACKET)),
        None => Ok(()),
    }
}

fn encrypt(cipher: &mut CipherState, framing: Framing, prepared: PreparedFrame) -> SealedFrame {
    let PreparedFrame { mode, mut payload } = prepared;
    match framing {
        Framing::Delimited => cipher.transform(&mut payload),
        Framing::LengthPrefixed => cipher.transform_limited(&mut payload, mode),
    }

    let mut body = BytesMut::with_capacity(1 + payload.len());
    body.put_u8(mode.marker());
    body.put_slice(&payload);

    trace!(?mode, sealed = body.len(), "Sealed frame");
    SealedFrame {
        mode,
        body: body.freeze(),
    }
}

fn open_with(
    cipher: &mut CipherState,
    framing: Framing,
    max_payload: usize,
    frame: &[u8],
) -> Result<Vec<u8>> {
    let (marker, ciphertext) = frame
        .split_first()
        .ok_or(ProtocolError::MalformedFrame(ERR_EMPTY_FRAME))?;
    let mode = CompressionMode::from_marker(*marker)?;

    let mut payload = ciphertext.to_vec();
    match framing {
        Framing::Delimited => cipher.transform(&mut payload),
        Framing::LengthPrefixed => cipher.transform_limited(&mut payload, mode),
    }

    let plaintext = compression::decode(mode, &payload, max_payload)?;
    if plaintext.is_empty() {
        return Err(ProtocolError::CipherDesync(ERR_EMPTY_PLAINTEXT));
    }
    if framing == Framing::LengthPrefixed && plaintext.last() != Some(&PACKET_TERMINATOR) {
        return Err(ProtocolError::CipherDesync(ERR_MISSING_TERMINATOR));
    }

    trace!(?mode, frame = frame.len(), plain = plaintext.len(), "Opened frame");
    Ok(plaintext)
}

/// Packet → frame body transformation for one outbound direction.
#[derive(Debug)]
pub struct OutboundPipeline {
    cipher: CipherState,
    policy: FramePolicy,
    codec: FrameCodec,
}

impl OutboundPipeline {
    pub fn new(
        cipher: CipherState,
        compression: CompressionPolicy,
        framing: Framing,
        max_frame_size: usize,
    ) -> Self {
        Self {
            cipher,
            policy: FramePolicy::new(compression, framing, max_frame_size),
            codec: FrameCodec::new(framing, max_frame_size),
        }
    }

    pub fn cipher(&self) -> &CipherState {
        &self.cipher
    }

    pub fn policy(&self) -> FramePolicy {
        self.policy
    }

    /// Compress and encrypt `plaintext` into a frame body.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<SealedFrame> {
        let prepared = self.policy.prepare(plaintext)?;
        Ok(self.seal_prepared(prepared))
    }

    /// Encrypt an already prepared payload. Advances the cipher.
    pub fn seal_prepared(&mut self, prepared: PreparedFrame) -> SealedFrame {
        encrypt(&mut self.cipher, self.policy.framing, prepared)
    }

    /// Serialize and seal a single packet.
    ///
    /// A packet that fails to serialize leaves the cipher untouched.
    pub fn seal_packet(&mut self, packet: &Packet) -> Result<SealedFrame> {
        let prepared = self.policy.prepare_packet(packet)?;
        Ok(self.seal_prepared(prepared))
    }

    /// Serialize several packets into one legacy frame.
    pub fn seal_batch(&mut self, packets: &[Packet]) -> Result<SealedFrame> {
        let prepared = self.policy.prepare_batch(packets)?;
        Ok(self.seal_prepared(prepared))
    }

    /// Produce the complete wire bytes for `packet`, framing included.
    pub fn encode_packet(&mut self, packet: &Packet) -> Result<BytesMut> {
        let sealed = self.seal_packet(packet)?;
        let mut wire = BytesMut::with_capacity(sealed.body.len() + 4);
        self.codec.encode(sealed.body, &mut wire)?;
        debug!(id = packet.id, bytes = wire.len(), "Encoded packet");
        Ok(wire)
    }
}

/// Frame body → events transformation for one inbound direction.
#[derive(Debug)]
pub struct InboundPipeline {
    cipher: CipherState,
    schema: Arc<DispatchTable>,
    direction: Direction,
    framing: Framing,
    max_payload: usize,
}

impl InboundPipeline {
    pub fn new(
        cipher: CipherState,
        schema: Arc<DispatchTable>,
        direction: Direction,
        framing: Framing,
        max_payload: usize,
    ) -> Self {
        Self {
            cipher,
            schema,
            direction,
            framing,
            max_payload,
        }
    }

    pub fn cipher(&self) -> &CipherState {
        &self.cipher
    }

    /// Decrypt and decompress one frame body.
    ///
    /// # Errors
    /// - `ProtocolError::MalformedFrame` for an empty frame
    /// - `ProtocolError::InvalidCompressionMarker` for an unknown marker
    /// - `ProtocolError::DecompressionFailure` for a corrupt payload
    /// - `ProtocolError::CipherDesync` if the plaintext fails sanity checks
    pub fn open(&mut self, frame: &[u8]) -> Result<Vec<u8>> {
        open_with(&mut self.cipher, self.framing, self.max_payload, frame)
    }

    /// Decode every packet a frame carries, in order.
    pub fn decode_frame(&mut self, frame: &[u8]) -> Result<Vec<InboundEvent>> {
        let plaintext = self.open(frame)?;
        match self.framing {
            Framing::Delimited => Ok(vec![self.schema.decode(self.direction, &plaintext)?]),
            Framing::LengthPrefixed => plaintext
                .split(|b| *b == PACKET_TERMINATOR)
                .filter(|packet| !packet.is_empty())
                .map(|packet| self.schema.decode(self.direction, packet))
                .collect(),
        }
    }
}

/// Seal a handshake into its (unencrypted) frame body.
pub fn seal_handshake(
    handshake: &Handshake,
    policy: &CompressionPolicy,
    framing: Framing,
) -> Result<SealedFrame> {
    let mut plaintext = handshake.encode()?;
    if framing == Framing::LengthPrefixed {
        plaintext.push(PACKET_TERMINATOR);
    }
    let (mode, payload) = compression::choose_and_encode(&plaintext, policy)?;
    Ok(encrypt(
        &mut CipherState::disabled(),
        framing,
        PreparedFrame { mode, payload },
    ))
}

/// Open and parse a handshake frame body.
pub fn open_handshake(frame: &[u8], framing: Framing, max_payload: usize) -> Result<Handshake> {
    let mut plaintext = open_with(&mut CipherState::disabled(), framing, max_payload, frame)?;
    if framing == Framing::LengthPrefixed {
        plaintext.pop();
    }
    Handshake::decode(&plaintext)
}
