//! Pluggable serialization for message payloads.
//!
//! The runtime never fixes a wire encoding for user payloads; it talks
//! to an abstract [`Serializer`]/[`Deserializer`] pair. The BASP layer
//! uses the [`binary`] implementation, which writes big-endian wire
//! integers, varint-prefixed sequences and length-prefixed UTF-8
//! strings.
//!
//! Object framing brackets each element with its [`TypeToken`]; sequence
//! framing carries an element count. IEEE-754 floats travel as the
//! same-width integer bit pattern.

pub mod binary;

pub use binary::{BinaryDeserializer, BinarySerializer};

use crate::error::Error;
use crate::types::TypeToken;

/// Streaming encoder for message elements.
pub trait Serializer {
    /// Open an element of the given type.
    fn begin_object(&mut self, token: &TypeToken) -> Result<(), Error>;

    /// Close the current element.
    fn end_object(&mut self) -> Result<(), Error>;

    /// Open a sequence of `len` items.
    fn begin_sequence(&mut self, len: usize) -> Result<(), Error>;

    /// Close the current sequence.
    fn end_sequence(&mut self) -> Result<(), Error>;

    fn write_i8(&mut self, value: i8) -> Result<(), Error>;
    fn write_u8(&mut self, value: u8) -> Result<(), Error>;
    fn write_i16(&mut self, value: i16) -> Result<(), Error>;
    fn write_u16(&mut self, value: u16) -> Result<(), Error>;
    fn write_i32(&mut self, value: i32) -> Result<(), Error>;
    fn write_u32(&mut self, value: u32) -> Result<(), Error>;
    fn write_i64(&mut self, value: i64) -> Result<(), Error>;
    fn write_u64(&mut self, value: u64) -> Result<(), Error>;
    fn write_f32(&mut self, value: f32) -> Result<(), Error>;
    fn write_f64(&mut self, value: f64) -> Result<(), Error>;
    fn write_bool(&mut self, value: bool) -> Result<(), Error>;

    /// Length-prefixed UTF-8 string.
    fn write_str(&mut self, value: &str) -> Result<(), Error>;

    /// Fixed-width blob, no length prefix. The reader must know the
    /// width.
    fn write_raw(&mut self, value: &[u8]) -> Result<(), Error>;
}

/// Streaming decoder mirroring [`Serializer`].
pub trait Deserializer {
    /// Open the next element, returning its type.
    fn begin_object(&mut self) -> Result<TypeToken, Error>;

    fn end_object(&mut self) -> Result<(), Error>;

    /// Open a sequence, returning its item count.
    fn begin_sequence(&mut self) -> Result<usize, Error>;

    fn end_sequence(&mut self) -> Result<(), Error>;

    fn read_i8(&mut self) -> Result<i8, Error>;
    fn read_u8(&mut self) -> Result<u8, Error>;
    fn read_i16(&mut self) -> Result<i16, Error>;
    fn read_u16(&mut self) -> Result<u16, Error>;
    fn read_i32(&mut self) -> Result<i32, Error>;
    fn read_u32(&mut self) -> Result<u32, Error>;
    fn read_i64(&mut self) -> Result<i64, Error>;
    fn read_u64(&mut self) -> Result<u64, Error>;
    fn read_f32(&mut self) -> Result<f32, Error>;
    fn read_f64(&mut self) -> Result<f64, Error>;
    fn read_bool(&mut self) -> Result<bool, Error>;
    fn read_str(&mut self) -> Result<String, Error>;

    /// Fixed-width blob of exactly `len` bytes.
    fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, Error>;
}
