//! ENCRYPT_GEN_5 stream cipher.
//!
//! Each direction of a connection owns one [`CipherState`]. The keystream is
//! produced by a 32-bit linear congruential register: at the start of every
//! 4-byte block the register steps to `register * 0x0808_8405 + seed`, and the
//! bytes of the block are XORed with the register's little-endian bytes. The
//! register is the whole key table, so the table is 4 bytes wide and is
//! regenerated for every block.
//!
//! Block alignment restarts with every [`CipherState::transform`] call (one
//! call per frame), matching what the legacy client does. Encryption and
//! decryption are the same operation; both peers stay in sync as long as they
//! feed identical byte counts in identical order.

use crate::utils::compression::CompressionMode;

/// Register value before the first keystream block.
pub const ITERATOR_START: u32 = 0x04A8_0B38;

/// Multiplier applied to the register at every block.
pub const ITERATOR_MULTIPLIER: u32 = 0x0808_8405;

/// Bytes covered by one register step.
pub const BLOCK_SIZE: usize = 4;

/// Cipher generation negotiated in the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// No encryption; the transform is the identity.
    Disabled,
    /// ENCRYPT_GEN_5 keystream.
    Gen5,
}

impl Generation {
    /// Code carried in the handshake.
    pub const fn code(self) -> u8 {
        match self {
            Generation::Disabled => 0,
            Generation::Gen5 => 5,
        }
    }

    /// Parse a handshake code.
    pub const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Generation::Disabled),
            5 => Some(Generation::Gen5),
            _ => None,
        }
    }
}

/// Per-direction keystream state.
///
/// Not `Clone`: a state is consumed by exactly one direction of one
/// connection, and duplicating it would let two streams reuse the same
/// keystream offsets.
#[derive(Debug)]
pub struct CipherState {
    generation: Generation,
    seed: u8,
    register: u32,
    iterator: u64,
}

impl CipherState {
    /// Build the initial state for `generation` keyed by `seed`.
    pub fn new(generation: Generation, seed: u8) -> Self {
        Self {
            generation,
            seed,
            register: ITERATOR_START,
            iterator: 0,
        }
    }

    /// State for sessions without encryption.
    pub fn disabled() -> Self {
        Self::new(Generation::Disabled, 0)
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn seed(&self) -> u8 {
        self.seed
    }

    /// Total bytes that have passed through this state.
    pub fn iterator(&self) -> u64 {
        self.iterator
    }

    pub fn is_enabled(&self) -> bool {
        self.generation != Generation::Disabled
    }

    /// XOR `data` in place with the next keystream bytes.
    pub fn transform(&mut self, data: &mut [u8]) {
        self.apply(data, None);
    }

    /// Transform only the leading blocks the legacy client encrypts for a
    /// frame compressed with `mode`; the rest of the frame is left as is and
    /// the register does not step for it.
    pub fn transform_limited(&mut self, data: &mut [u8], mode: CompressionMode) {
        self.apply(data, Some(mode.cipher_block_limit()));
    }

    fn apply(&mut self, data: &mut [u8], block_limit: Option<usize>) {
        if self.generation == Generation::Gen5 {
            let mut key = self.register.to_le_bytes();
            let mut blocks_left = block_limit;

            for (i, byte) in data.iter_mut().enumerate() {
                if i % BLOCK_SIZE == 0 {
                    match blocks_left.as_mut() {
                        Some(0) => break,
                        Some(n) => *n -= 1,
                        None => {}
                    }
                    self.register = self
                        .register
                        .wrapping_mul(ITERATOR_MULTIPLIER)
                        .wrapping_add(u32::from(self.seed));
                    key = self.register.to_le_bytes();
                }
                *byte ^= key[i % BLOCK_SIZE];
            }
        }

        self.iterator += data.len() as u64;
    }
}
