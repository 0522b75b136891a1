//! # Field Codec
//!
//! Encoders and decoders for the offset-biased field encodings.
//!
//! Every digit on the wire is biased by +32 so payload bytes stay clear of
//! control characters.
//!
//! ## Variable-length integers
//! ```text
//! [digit count + 32] [digit + 32]...   digits base 223, most significant first
//! ```
//! The digit count is minimal (zero is a single `0` digit) and ranges over
//! `1..=9`, which covers the full `u64` range. Strings are a VarInt length
//! followed by the raw bytes.
//!
//! ## Fixed-width integers
//! `GChar` is one digit. `GShort`, `GInt3` and `GInt5` are 2, 3 and 5 digits:
//! the leading digit is base 223 and every following digit carries 7 bits.
//! `CharString` is a `GChar` length followed by the raw bytes.

use bytes::BufMut;

use crate::error::constants::{
    ERR_DIGIT_COUNT, ERR_DIGIT_RANGE, ERR_NON_CANONICAL, ERR_OVERFLOW, ERR_TRUNCATED_VALUE,
};
use crate::error::{ProtocolError, Result};

/// Bias added to every digit byte.
pub const DIGIT_OFFSET: u8 = 32;

/// Radix of variable-length integer digits and of leading fixed-width digits.
pub const DIGIT_BASE: u64 = 223;

/// Largest digit count a variable-length integer may carry.
pub const MAX_VAR_INT_DIGITS: usize = 9;

/// Largest value a single `GChar` digit holds.
pub const GCHAR_MAX: u8 = 222;

const LOW_DIGIT_BITS: u32 = 7;
const LOW_DIGIT_MASK: u64 = 0x7f;

/// Width in bytes of the fixed-width integer fields.
pub const GSHORT_WIDTH: usize = 2;
pub const GINT3_WIDTH: usize = 3;
pub const GINT5_WIDTH: usize = 5;

/// Largest value a fixed-width field of `width` bytes can carry.
pub const fn fixed_width_max(width: usize) -> u64 {
    DIGIT_BASE * (1u64 << (LOW_DIGIT_BITS as usize * (width - 1))) - 1
}

fn digit(bytes: &[u8], offset: usize) -> Result<u8> {
    let byte = *bytes
        .get(offset)
        .ok_or_else(|| ProtocolError::malformed(offset, ERR_TRUNCATED_VALUE))?;
    if byte < DIGIT_OFFSET || byte == u8::MAX {
        return Err(ProtocolError::malformed(offset, ERR_DIGIT_RANGE));
    }
    Ok(byte - DIGIT_OFFSET)
}

// ---------------------------------------------------------------------------
// Variable-length integers and strings
// ---------------------------------------------------------------------------

/// Append the encoding of `n` to `buf`.
pub fn write_var_int<B: BufMut>(buf: &mut B, n: u64) {
    let mut digits = [0u8; MAX_VAR_INT_DIGITS];
    let mut count = 0;
    let mut rest = n;
    loop {
        digits[count] = (rest % DIGIT_BASE) as u8 + DIGIT_OFFSET;
        count += 1;
        rest /= DIGIT_BASE;
        if rest == 0 {
            break;
        }
    }

    buf.put_u8(count as u8 + DIGIT_OFFSET);
    for d in digits[..count].iter().rev() {
        buf.put_u8(*d);
    }
}

/// Encode `n` as a standalone byte vector.
///
/// ```rust
/// use reborn_protocol::core::field::encode_var_int;
///
/// assert_eq!(encode_var_int(100), vec![33, 132]);
/// assert_eq!(encode_var_int(5000), vec![34, 54, 126]);
/// ```
pub fn encode_var_int(n: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + MAX_VAR_INT_DIGITS);
    write_var_int(&mut out, n);
    out
}

/// Decode a variable-length integer starting at `cursor`.
///
/// Returns the value and the cursor just past it.
///
/// # Errors
/// Returns `ProtocolError::MalformedField` if:
/// - The buffer ends before the value does
/// - The digit count is outside `1..=9`
/// - A digit byte lies outside `[32, 255)`
/// - The value has a leading zero digit
/// - The value overflows `u64`
pub fn decode_var_int(bytes: &[u8], cursor: usize) -> Result<(u64, usize)> {
    let count = digit(bytes, cursor)? as usize;
    if count == 0 || count > MAX_VAR_INT_DIGITS {
        return Err(ProtocolError::malformed(cursor, ERR_DIGIT_COUNT));
    }

    let mut value: u64 = 0;
    for i in 0..count {
        let offset = cursor + 1 + i;
        let d = digit(bytes, offset)?;
        if i == 0 && d == 0 && count > 1 {
            return Err(ProtocolError::malformed(offset, ERR_NON_CANONICAL));
        }
        value = value
            .checked_mul(DIGIT_BASE)
            .and_then(|v| v.checked_add(u64::from(d)))
            .ok_or_else(|| ProtocolError::malformed(offset, ERR_OVERFLOW))?;
    }

    Ok((value, cursor + 1 + count))
}

/// Append a length-prefixed string to `buf`.
pub fn write_string<B: BufMut>(buf: &mut B, s: &[u8]) {
    write_var_int(buf, s.len() as u64);
    buf.put_slice(s);
}

/// Encode a length-prefixed string.
pub fn encode_string(s: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len() + 3);
    write_string(&mut out, s);
    out
}

/// Decode a length-prefixed string starting at `cursor`.
pub fn decode_string(bytes: &[u8], cursor: usize) -> Result<(Vec<u8>, usize)> {
    let (len, start) = decode_var_int(bytes, cursor)?;
    let end = usize::try_from(len)
        .ok()
        .and_then(|len| start.checked_add(len))
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| ProtocolError::malformed(start, ERR_TRUNCATED_VALUE))?;
    Ok((bytes[start..end].to_vec(), end))
}

/// Everything from `cursor` to the end of the buffer.
pub fn decode_raw_tail(bytes: &[u8], cursor: usize) -> (Vec<u8>, usize) {
    let start = cursor.min(bytes.len());
    (bytes[start..].to_vec(), bytes.len())
}

// ---------------------------------------------------------------------------
// Fixed-width integers
// ---------------------------------------------------------------------------

/// Append a single-digit value.
pub fn write_gchar<B: BufMut>(buf: &mut B, value: u8) -> Result<()> {
    if value > GCHAR_MAX {
        return Err(ProtocolError::FieldOutOfRange {
            field: "GChar",
            value: u64::from(value),
        });
    }
    buf.put_u8(value + DIGIT_OFFSET);
    Ok(())
}

/// Append a fixed-width value spanning `width` bytes.
pub fn write_fixed<B: BufMut>(
    buf: &mut B,
    value: u64,
    width: usize,
    field: &'static str,
) -> Result<()> {
    if value > fixed_width_max(width) {
        return Err(ProtocolError::FieldOutOfRange { field, value });
    }
    for i in (0..width).rev() {
        let shift = LOW_DIGIT_BITS as usize * i;
        let d = if i == width - 1 {
            value >> shift
        } else {
            (value >> shift) & LOW_DIGIT_MASK
        };
        buf.put_u8(d as u8 + DIGIT_OFFSET);
    }
    Ok(())
}

/// Decode a fixed-width value spanning `width` bytes at `cursor`.
pub fn decode_fixed(bytes: &[u8], cursor: usize, width: usize) -> Result<(u64, usize)> {
    let mut value = 0u64;
    for i in 0..width {
        let offset = cursor + i;
        let d = u64::from(digit(bytes, offset)?);
        if i > 0 && d > LOW_DIGIT_MASK {
            return Err(ProtocolError::malformed(offset, ERR_DIGIT_RANGE));
        }
        value = (value << LOW_DIGIT_BITS) | d;
    }
    Ok((value, cursor + width))
}

/// Append a `GChar`-length-prefixed string.
pub fn write_char_string<B: BufMut>(buf: &mut B, s: &[u8]) -> Result<()> {
    let len = u8::try_from(s.len())
        .ok()
        .filter(|len| *len <= GCHAR_MAX)
        .ok_or(ProtocolError::FieldOutOfRange {
            field: "CharString",
            value: s.len() as u64,
        })?;
    write_gchar(buf, len)?;
    buf.put_slice(s);
    Ok(())
}

// ---------------------------------------------------------------------------
// Cursor
// ---------------------------------------------------------------------------

/// Sequential reader over a packet body.
#[derive(Debug, Clone)]
pub struct FieldReader<'a> {
    bytes: &'a [u8],
    cursor: usize,
}

impl<'a> FieldReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, cursor: 0 }
    }

    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn remaining(&self) -> &'a [u8] {
        &self.bytes[self.cursor.min(self.bytes.len())..]
    }

    pub fn is_empty(&self) -> bool {
        self.cursor >= self.bytes.len()
    }

    pub fn read_var_int(&mut self) -> Result<u64> {
        let (value, next) = decode_var_int(self.bytes, self.cursor)?;
        self.cursor = next;
        Ok(value)
    }

    pub fn read_string(&mut self) -> Result<Vec<u8>> {
        let (value, next) = decode_string(self.bytes, self.cursor)?;
        self.cursor = next;
        Ok(value)
    }

    pub fn read_raw_tail(&mut self) -> Vec<u8> {
        let (value, next) = decode_raw_tail(self.bytes, self.cursor);
        self.cursor = next;
        value
    }

    pub fn read_gchar(&mut self) -> Result<u8> {
        let d = digit(self.bytes, self.cursor)?;
        self.cursor += 1;
        Ok(d)
    }

    pub fn read_gshort(&mut self) -> Result<u16> {
        self.read_fixed(GSHORT_WIDTH).map(|v| v as u16)
    }

    pub fn read_gint3(&mut self) -> Result<u32> {
        self.read_fixed(GINT3_WIDTH).map(|v| v as u32)
    }

    pub fn read_gint5(&mut self) -> Result<u64> {
        self.read_fixed(GINT5_WIDTH)
    }

    pub fn read_char_string(&mut self) -> Result<Vec<u8>> {
        let start = self.cursor;
        let len = self.read_gchar()? as usize;
        let end = self.cursor + len;
        if end > self.bytes.len() {
            self.cursor = start;
            return Err(ProtocolError::malformed(start, ERR_TRUNCATED_VALUE));
        }
        let value = self.bytes[self.cursor..end].to_vec();
        self.cursor = end;
        Ok(value)
    }

    /// Take exactly `len` raw bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| ProtocolError::malformed(self.cursor, ERR_TRUNCATED_VALUE))?;
        let value = &self.bytes[self.cursor..end];
        self.cursor = end;
        Ok(value)
    }

    fn read_fixed(&mut self, width: usize) -> Result<u64> {
        let (value, next) = decode_fixed(self.bytes, self.cursor, width)?;
        self.cursor = next;
        Ok(value)
    }
}
