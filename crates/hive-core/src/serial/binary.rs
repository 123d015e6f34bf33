//! Binary serializer: big-endian integers, varint sequence lengths,
//! length-prefixed UTF-8 strings.
//!
//! ## Wire layout
//!
//! - Integers: network byte order (big-endian), fixed width.
//! - Floats: the IEEE-754 bit pattern written as the same-width integer.
//! - `bool`: one byte, 0 or 1.
//! - Strings: varint byte length + UTF-8 bytes.
//! - Sequences: varint element count, then the elements.
//! - Object framing: `u16` type number; number 0 is followed by a
//!   varint-prefixed type name.
//!
//! Varints use 7-bit little-endian groups with a continuation bit, the
//! classic LEB128 scheme.

use crate::error::{Error, SecCode};
use crate::types::{type_nr, TypeToken};

use super::{Deserializer, Serializer};

/// Maximum string/blob length accepted by the deserializer (16 MiB).
/// Guards against allocation bombs from a malicious or buggy peer.
const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;

/// Maximum sequence element count accepted by the deserializer.
const MAX_SEQUENCE_LEN: u64 = 1_000_000;

// ---------------------------------------------------------------------------
// Varint helpers
// ---------------------------------------------------------------------------

/// Append `value` as a 7-bit continuation varint.
pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Read a varint from the front of `buf`, returning the value and the
/// number of bytes consumed.
pub fn read_varint(buf: &[u8]) -> Result<(u64, usize), Error> {
    let mut value = 0u64;
    let mut shift = 0u32;
    for (i, &byte) in buf.iter().enumerate() {
        if shift >= 64 {
            return Err(Error::sec(SecCode::IntegerOverflow));
        }
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok((value, i + 1));
        }
        shift += 7;
    }
    Err(Error::sec(SecCode::UnexpectedEof))
}

// ---------------------------------------------------------------------------
// BinarySerializer
// ---------------------------------------------------------------------------

/// Serializer writing into an owned byte buffer.
#[derive(Default)]
pub struct BinarySerializer {
    buf: Vec<u8>,
}

impl BinarySerializer {
    pub fn new() -> BinarySerializer {
        BinarySerializer::default()
    }

    /// Consume the serializer, yielding the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }
}

macro_rules! write_be {
    ($($fn_name:ident => $ty:ty),* $(,)?) => {
        $(fn $fn_name(&mut self, value: $ty) -> Result<(), Error> {
            self.buf.extend_from_slice(&value.to_be_bytes());
            Ok(())
        })*
    };
}

impl Serializer for BinarySerializer {
    fn begin_object(&mut self, token: &TypeToken) -> Result<(), Error> {
        self.buf.extend_from_slice(&token.nr().to_be_bytes());
        if token.nr() == type_nr::USER {
            let name = token.name().ok_or(Error::sec(SecCode::InvalidArgument))?;
            write_varint(&mut self.buf, name.len() as u64);
            self.buf.extend_from_slice(name.as_bytes());
        }
        Ok(())
    }

    fn end_object(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn begin_sequence(&mut self, len: usize) -> Result<(), Error> {
        write_varint(&mut self.buf, len as u64);
        Ok(())
    }

    fn end_sequence(&mut self) -> Result<(), Error> {
        Ok(())
    }

    write_be! {
        write_i8 => i8,
        write_u8 => u8,
        write_i16 => i16,
        write_u16 => u16,
        write_i32 => i32,
        write_u32 => u32,
        write_i64 => i64,
        write_u64 => u64,
    }

    fn write_f32(&mut self, value: f32) -> Result<(), Error> {
        self.write_u32(value.to_bits())
    }

    fn write_f64(&mut self, value: f64) -> Result<(), Error> {
        self.write_u64(value.to_bits())
    }

    fn write_bool(&mut self, value: bool) -> Result<(), Error> {
        self.write_u8(value as u8)
    }

    fn write_str(&mut self, value: &str) -> Result<(), Error> {
        write_varint(&mut self.buf, value.len() as u64);
        self.buf.extend_from_slice(value.as_bytes());
        Ok(())
    }

    fn write_raw(&mut self, value: &[u8]) -> Result<(), Error> {
        self.buf.extend_from_slice(value);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// BinaryDeserializer
// ---------------------------------------------------------------------------

/// Deserializer reading from a borrowed byte slice.
pub struct BinaryDeserializer<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> BinaryDeserializer<'a> {
    pub fn new(buf: &'a [u8]) -> BinaryDeserializer<'a> {
        BinaryDeserializer { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], Error> {
        if self.remaining() < n {
            return Err(Error::sec(SecCode::UnexpectedEof));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_varint(&mut self) -> Result<u64, Error> {
        let (value, used) = read_varint(&self.buf[self.pos..])?;
        self.pos += used;
        Ok(value)
    }
}

macro_rules! read_be {
    ($($fn_name:ident => $ty:ty),* $(,)?) => {
        $(fn $fn_name(&mut self) -> Result<$ty, Error> {
            let bytes = self.take(std::mem::size_of::<$ty>())?;
            Ok(<$ty>::from_be_bytes(bytes.try_into().expect("sized slice")))
        })*
    };
}

impl<'a> Deserializer for BinaryDeserializer<'a> {
    fn begin_object(&mut self) -> Result<TypeToken, Error> {
        let nr = self.read_u16()?;
        if nr != type_nr::USER {
            return Ok(TypeToken::builtin(nr));
        }
        let name = self.read_str()?;
        Ok(TypeToken::named(name))
    }

    fn end_object(&mut self) -> Result<(), Error> {
        Ok(())
    }

    fn begin_sequence(&mut self) -> Result<usize, Error> {
        let len = self.take_varint()?;
        if len > MAX_SEQUENCE_LEN {
            return Err(Error::sec(SecCode::TooManyCharacters));
        }
        Ok(len as usize)
    }

    fn end_sequence(&mut self) -> Result<(), Error> {
        Ok(())
    }

    read_be! {
        read_i8 => i8,
        read_u8 => u8,
        read_i16 => i16,
        read_u16 => u16,
        read_i32 => i32,
        read_u32 => u32,
        read_i64 => i64,
        read_u64 => u64,
    }

    fn read_f32(&mut self) -> Result<f32, Error> {
        self.read_u32().map(f32::from_bits)
    }

    fn read_f64(&mut self) -> Result<f64, Error> {
        self.read_u64().map(f64::from_bits)
    }

    fn read_bool(&mut self) -> Result<bool, Error> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(Error::sec(SecCode::UnexpectedCharacter)),
        }
    }

    fn read_str(&mut self) -> Result<String, Error> {
        let len = self.take_varint()?;
        if len > MAX_STRING_LEN {
            return Err(Error::sec(SecCode::TooManyCharacters));
        }
        let bytes = self.take(len as usize)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| Error::sec(SecCode::UnexpectedCharacter))
    }

    fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, Error> {
        if len as u64 > MAX_STRING_LEN {
            return Err(Error::sec(SecCode::TooManyCharacters));
        }
        self.take(len).map(|s| s.to_vec())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        let samples = [
            0u64,
            1,
            127,
            128,
            300,
            16_383,
            16_384,
            u32::MAX as u64,
            u64::MAX,
        ];
        for n in samples {
            let mut buf = Vec::new();
            write_varint(&mut buf, n);
            let (decoded, used) = read_varint(&buf).unwrap();
            assert_eq!(decoded, n);
            assert_eq!(used, buf.len());
        }
    }

    #[test]
    fn test_varint_single_byte_below_128() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 127);
        assert_eq!(buf, vec![127]);
    }

    #[test]
    fn test_varint_truncated_input() {
        assert!(read_varint(&[0x80]).is_err());
        assert!(read_varint(&[]).is_err());
    }

    #[test]
    fn test_primitive_round_trip() {
        let mut sink = BinarySerializer::new();
        sink.write_i8(-7).unwrap();
        sink.write_u8(200).unwrap();
        sink.write_i16(-30_000).unwrap();
        sink.write_u16(60_000).unwrap();
        sink.write_i32(-2_000_000).unwrap();
        sink.write_u32(4_000_000_000).unwrap();
        sink.write_i64(i64::MIN).unwrap();
        sink.write_u64(u64::MAX).unwrap();
        sink.write_f32(3.5).unwrap();
        sink.write_f64(-0.25).unwrap();
        sink.write_bool(true).unwrap();
        sink.write_str("héllo").unwrap();

        let bytes = sink.into_bytes();
        let mut source = BinaryDeserializer::new(&bytes);
        assert_eq!(source.read_i8().unwrap(), -7);
        assert_eq!(source.read_u8().unwrap(), 200);
        assert_eq!(source.read_i16().unwrap(), -30_000);
        assert_eq!(source.read_u16().unwrap(), 60_000);
        assert_eq!(source.read_i32().unwrap(), -2_000_000);
        assert_eq!(source.read_u32().unwrap(), 4_000_000_000);
        assert_eq!(source.read_i64().unwrap(), i64::MIN);
        assert_eq!(source.read_u64().unwrap(), u64::MAX);
        assert_eq!(source.read_f32().unwrap(), 3.5);
        assert_eq!(source.read_f64().unwrap(), -0.25);
        assert!(source.read_bool().unwrap());
        assert_eq!(source.read_str().unwrap(), "héllo");
        assert_eq!(source.remaining(), 0);
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut sink = BinarySerializer::new();
        sink.write_u32(0x0102_0304).unwrap();
        assert_eq!(sink.as_bytes(), &[1, 2, 3, 4]);
    }

    #[test]
    fn test_float_is_bit_pattern() {
        let mut sink = BinarySerializer::new();
        sink.write_f32(1.0).unwrap();
        assert_eq!(sink.as_bytes(), &0x3F80_0000u32.to_be_bytes());
    }

    #[test]
    fn test_object_framing_round_trip() {
        let mut sink = BinarySerializer::new();
        sink.begin_object(&TypeToken::builtin(type_nr::I64)).unwrap();
        sink.write_i64(99).unwrap();
        sink.end_object().unwrap();
        sink.begin_object(&TypeToken::named("point")).unwrap();
        sink.write_i32(3).unwrap();
        sink.write_i32(4).unwrap();
        sink.end_object().unwrap();

        let bytes = sink.into_bytes();
        let mut source = BinaryDeserializer::new(&bytes);
        let t1 = source.begin_object().unwrap();
        assert_eq!(t1, TypeToken::builtin(type_nr::I64));
        assert_eq!(source.read_i64().unwrap(), 99);
        source.end_object().unwrap();
        let t2 = source.begin_object().unwrap();
        assert_eq!(t2, TypeToken::named("point"));
        assert_eq!(source.read_i32().unwrap(), 3);
        assert_eq!(source.read_i32().unwrap(), 4);
        source.end_object().unwrap();
    }

    #[test]
    fn test_sequence_round_trip() {
        let mut sink = BinarySerializer::new();
        sink.begin_sequence(3).unwrap();
        for v in [1i64, 2, 3] {
            sink.write_i64(v).unwrap();
        }
        sink.end_sequence().unwrap();

        let bytes = sink.into_bytes();
        let mut source = BinaryDeserializer::new(&bytes);
        let n = source.begin_sequence().unwrap();
        assert_eq!(n, 3);
        for expected in [1i64, 2, 3] {
            assert_eq!(source.read_i64().unwrap(), expected);
        }
        source.end_sequence().unwrap();
    }

    #[test]
    fn test_truncated_string_rejected() {
        let mut sink = BinarySerializer::new();
        sink.write_str("hello").unwrap();
        let mut bytes = sink.into_bytes();
        bytes.truncate(3);
        let mut source = BinaryDeserializer::new(&bytes);
        assert!(source.read_str().is_err());
    }
}
