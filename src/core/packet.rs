//! # Packet
//!
//! A decoded packet: an identifier plus an ordered list of typed field
//! values.
//!
//! ## Wire Format
//! ```text
//! [id + 32] [field]...
//! ```
//! Field bytes follow the encodings in [`crate::core::field`]. A
//! [`FieldValue::RawTail`] swallows everything up to the end of the packet
//! and may only appear last.

use bytes::BufMut;

use crate::core::field::{
    self, write_char_string, write_fixed, write_gchar, write_string, write_var_int, FieldReader,
    GINT3_WIDTH, GINT5_WIDTH, GSHORT_WIDTH,
};
use crate::error::constants::{ERR_RAW_TAIL_POSITION, ERR_TRUNCATED_VALUE};
use crate::error::{ProtocolError, Result};

/// Map a packet id to its wire byte.
pub const fn id_to_wire(id: u8) -> u8 {
    id.wrapping_add(field::DIGIT_OFFSET)
}

/// Map a wire byte back to a packet id.
pub const fn id_from_wire(byte: u8) -> u8 {
    byte.wrapping_sub(field::DIGIT_OFFSET)
}

/// Encoding kind of a single field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FieldType {
    VarInt,
    GString,
    RawTail,
    GChar,
    GShort,
    GInt3,
    GInt5,
    CharString,
}

/// A typed field value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldValue {
    VarInt(u64),
    GString(Vec<u8>),
    RawTail(Vec<u8>),
    GChar(u8),
    GShort(u16),
    GInt3(u32),
    GInt5(u64),
    CharString(Vec<u8>),
}

impl FieldValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            FieldValue::VarInt(_) => FieldType::VarInt,
            FieldValue::GString(_) => FieldType::GString,
            FieldValue::RawTail(_) => FieldType::RawTail,
            FieldValue::GChar(_) => FieldType::GChar,
            FieldValue::GShort(_) => FieldType::GShort,
            FieldValue::GInt3(_) => FieldType::GInt3,
            FieldValue::GInt5(_) => FieldType::GInt5,
            FieldValue::CharString(_) => FieldType::CharString,
        }
    }

    /// Numeric value, if this is an integer field.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::VarInt(v) | FieldValue::GInt5(v) => Some(*v),
            FieldValue::GChar(v) => Some(u64::from(*v)),
            FieldValue::GShort(v) => Some(u64::from(*v)),
            FieldValue::GInt3(v) => Some(u64::from(*v)),
            _ => None,
        }
    }

    /// Byte content, if this is a string or tail field.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::GString(b) | FieldValue::RawTail(b) | FieldValue::CharString(b) => {
                Some(b.as_slice())
            }
            _ => None,
        }
    }

    /// Append this value's wire encoding to `buf`.
    ///
    /// # Errors
    /// Returns `ProtocolError::FieldOutOfRange` when a fixed-width value does
    /// not fit its width
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        match self {
            FieldValue::VarInt(v) => write_var_int(buf, *v),
            FieldValue::GString(b) => write_string(buf, b),
            FieldValue::RawTail(b) => buf.put_slice(b),
            FieldValue::GChar(v) => write_gchar(buf, *v)?,
            FieldValue::GShort(v) => write_fixed(buf, u64::from(*v), GSHORT_WIDTH, "GShort")?,
            FieldValue::GInt3(v) => write_fixed(buf, u64::from(*v), GINT3_WIDTH, "GInt3")?,
            FieldValue::GInt5(v) => write_fixed(buf, *v, GINT5_WIDTH, "GInt5")?,
            FieldValue::CharString(b) => write_char_string(buf, b)?,
        }
        Ok(())
    }

    /// Read one value of type `ty` from `reader`.
    pub fn read_from(reader: &mut FieldReader<'_>, ty: FieldType) -> Result<Self> {
        Ok(match ty {
            FieldType::VarInt => FieldValue::VarInt(reader.read_var_int()?),
            FieldType::GString => FieldValue::GString(reader.read_string()?),
            FieldType::RawTail => FieldValue::RawTail(reader.read_raw_tail()),
            FieldType::GChar => FieldValue::GChar(reader.read_gchar()?),
            FieldType::GShort => FieldValue::GShort(reader.read_gshort()?),
            FieldType::GInt3 => FieldValue::GInt3(reader.read_gint3()?),
            FieldType::GInt5 => FieldValue::GInt5(reader.read_gint5()?),
            FieldType::CharString => FieldValue::CharString(reader.read_char_string()?),
        })
    }
}

/// An identified packet with its ordered field values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub id: u8,
    pub fields: Vec<FieldValue>,
}

impl Packet {
    pub fn new(id: u8, fields: Vec<FieldValue>) -> Self {
        Self { id, fields }
    }

    /// Serialize the packet to plaintext wire bytes: id byte then fields.
    ///
    /// # Errors
    /// - `ProtocolError::MalformedField` if a raw tail is not the last field
    /// - `ProtocolError::FieldOutOfRange` if a fixed-width value overflows
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(1 + self.encoded_hint());
        self.write_to(&mut out)?;
        Ok(out)
    }

    /// Append the plaintext wire bytes to `buf`.
    pub fn write_to<B: BufMut>(&self, buf: &mut B) -> Result<()> {
        let last = self.fields.len().saturating_sub(1);
        for (index, value) in self.fields.iter().enumerate() {
            if matches!(value, FieldValue::RawTail(_)) && index != last {
                return Err(ProtocolError::malformed(index, ERR_RAW_TAIL_POSITION));
            }
        }

        buf.put_u8(id_to_wire(self.id));
        for value in &self.fields {
            value.write_to(buf)?;
        }
        Ok(())
    }

    /// Decode a packet body (the bytes after the id) against `fields`.
    ///
    /// Bytes left after the last field are ignored.
    pub fn decode_body(id: u8, body: &[u8], fields: &[FieldType]) -> Result<Self> {
        let mut reader = FieldReader::new(body);
        let mut values = Vec::with_capacity(fields.len());
        for ty in fields {
            values.push(FieldValue::read_from(&mut reader, *ty)?);
        }
        Ok(Self::new(id, values))
    }

    /// Split plaintext into its id and body.
    pub fn split_id(plaintext: &[u8]) -> Result<(u8, &[u8])> {
        match plaintext.split_first() {
            Some((byte, body)) => Ok((id_from_wire(*byte), body)),
            None => Err(ProtocolError::malformed(0, ERR_TRUNCATED_VALUE)),
        }
    }

    fn encoded_hint(&self) -> usize {
        self.fields
            .iter()
            .map(|v| v.as_bytes().map_or(10, |b| b.len() + 10))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_encode_known_packet() {
        let packet = Packet::new(
            42,
            vec![
                FieldValue::VarInt(100),
                FieldValue::VarInt(5000),
                FieldValue::GString(b"hello".to_vec()),
            ],
        );
        assert_eq!(
            packet.encode().unwrap(),
            vec![74, 33, 132, 34, 54, 126, 33, 37, b'h', b'e', b'l', b'l', b'o']
        );
    }

    #[test]
    fn test_id_wraps() {
        assert_eq!(id_to_wire(0), 32);
        assert_eq!(id_to_wire(230), 6);
        assert_eq!(id_from_wire(6), 230);
    }

    #[test]
    fn test_raw_tail_must_be_last() {
        let packet = Packet::new(
            1,
            vec![FieldValue::RawTail(b"x".to_vec()), FieldValue::VarInt(1)],
        );
        assert!(matches!(
            packet.encode(),
            Err(ProtocolError::MalformedField { reason, .. }) if reason == ERR_RAW_TAIL_POSITION
        ));
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_body_ignores_trailing_bytes() {
        let mut body = Vec::new();
        write_var_int(&mut body, 9);
        body.extend_from_slice(b"extra");
        let packet = Packet::decode_body(3, &body, &[FieldType::VarInt]).unwrap();
        assert_eq!(packet.fields, vec![FieldValue::VarInt(9)]);
    }

    #[test]
    fn test_field_accessors() {
        assert_eq!(FieldValue::GShort(300).as_u64(), Some(300));
        assert_eq!(FieldValue::GString(b"a".to_vec()).as_bytes(), Some(&b"a"[..]));
        assert_eq!(FieldValue::VarInt(1).as_bytes(), None);
        assert_eq!(FieldValue::CharString(vec![]).field_type(), FieldType::CharString);
    }

    #[test]
    fn test_split_id_empty() {
        assert!(Packet::split_id(&[]).is_err());
    }
}
