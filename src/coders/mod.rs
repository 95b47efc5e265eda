//! Byte serializers for values that leave a worker.
//!
//! A [`Coder`] turns a value into bytes and back. Coders compose:
//! [`NullableCoder`] wraps any other coder, and
//! [`FailsafeElementCoder`] is built from one coder per payload.
//!
//! Every length-prefixed layout in here uses an unsigned LEB128
//! varint for the prefix. Decoding never trusts a prefix blindly; a
//! length above [`MAX_LEN`] is rejected before anything is allocated.

use std::io::Read;
use std::io::Write;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

mod failsafe;

pub use failsafe::FailsafeElementCoder;

/// Largest length prefix a decoder will accept.
pub const MAX_LEN: u64 = 64 * 1024 * 1024;

/// Longest valid varint encoding of a `u64`.
const MAX_VARINT_BYTES: usize = 10;

const NULL_MARKER: u8 = 0x00;
const PRESENT_MARKER: u8 = 0x01;

#[derive(Debug, Error)]
pub enum CoderError {
    #[error("unexpected end of input")]
    Truncated,
    #[error("varint is longer than 10 bytes")]
    VarIntOverflow,
    #[error("length prefix {0} is larger than the 64 MiB limit")]
    LengthTooLarge(u64),
    #[error("invalid null marker byte {0:#04x}")]
    InvalidNullMarker(u8),
    #[error("string is not valid UTF-8")]
    InvalidUtf8(#[source] std::string::FromUtf8Error),
    #[error("{0} trailing bytes after decoded value")]
    TrailingBytes(usize),
    #[error("{coder} is not deterministic: {reason}")]
    NonDeterministic { coder: &'static str, reason: String },
    #[error("error in bincode payload")]
    Bincode(#[source] bincode::Error),
    #[error("I/O error")]
    Io(#[source] std::io::Error),
}

impl From<std::io::Error> for CoderError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Self::Truncated
        } else {
            Self::Io(err)
        }
    }
}

/// Serializes values of one type to bytes and back.
pub trait Coder {
    type Value;

    fn encode(&self, value: &Self::Value, out: &mut dyn Write) -> Result<(), CoderError>;

    /// Read exactly one value. Truncated or malformed input is an
    /// error, never a partial value.
    fn decode(&self, input: &mut dyn Read) -> Result<Self::Value, CoderError>;

    /// Succeed only if equal values always encode to equal bytes.
    ///
    /// Dead letters are deduplicated by the hash of their encoding,
    /// which only works with a deterministic coder.
    fn verify_deterministic(&self) -> Result<(), CoderError> {
        Ok(())
    }

    fn encode_to_vec(&self, value: &Self::Value) -> Result<Vec<u8>, CoderError> {
        let mut buf = Vec::new();
        self.encode(value, &mut buf)?;
        Ok(buf)
    }

    /// Decode a value that must span the whole slice.
    fn decode_from_slice(&self, bytes: &[u8]) -> Result<Self::Value, CoderError> {
        let mut rest = bytes;
        let value = self.decode(&mut rest)?;
        if rest.is_empty() {
            Ok(value)
        } else {
            Err(CoderError::TrailingBytes(rest.len()))
        }
    }
}

pub fn write_varint(mut value: u64, out: &mut dyn Write) -> Result<(), CoderError> {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.write_all(&[byte])?;
        if value == 0 {
            return Ok(());
        }
    }
}

pub fn read_varint(input: &mut dyn Read) -> Result<u64, CoderError> {
    let mut value = 0u64;
    for i in 0..MAX_VARINT_BYTES {
        let byte = read_byte(input)?;
        // The tenth byte only has room for the top bit of a u64.
        if i == MAX_VARINT_BYTES - 1 && byte > 0x01 {
            return Err(CoderError::VarIntOverflow);
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(CoderError::VarIntOverflow)
}

fn read_byte(input: &mut dyn Read) -> Result<u8, CoderError> {
    let mut buf = [0u8; 1];
    input.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn write_len_prefixed(bytes: &[u8], out: &mut dyn Write) -> Result<(), CoderError> {
    write_varint(bytes.len() as u64, out)?;
    out.write_all(bytes)?;
    Ok(())
}

fn read_len_prefixed(input: &mut dyn Read) -> Result<Vec<u8>, CoderError> {
    let len = read_varint(input)?;
    if len > MAX_LEN {
        return Err(CoderError::LengthTooLarge(len));
    }
    // Grow with the bytes actually present so a corrupt prefix can't
    // allocate up front.
    let mut buf = Vec::new();
    Read::take(&mut *input, len).read_to_end(&mut buf)?;
    if buf.len() as u64 != len {
        return Err(CoderError::Truncated);
    }
    Ok(buf)
}

/// UTF-8 strings, varint byte length first.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringUtf8Coder;

impl Coder for StringUtf8Coder {
    type Value = String;

    fn encode(&self, value: &String, out: &mut dyn Write) -> Result<(), CoderError> {
        write_len_prefixed(value.as_bytes(), out)
    }

    fn decode(&self, input: &mut dyn Read) -> Result<String, CoderError> {
        String::from_utf8(read_len_prefixed(input)?).map_err(CoderError::InvalidUtf8)
    }
}

/// Raw bytes, varint length first.
#[derive(Debug, Clone, Copy, Default)]
pub struct ByteArrayCoder;

impl Coder for ByteArrayCoder {
    type Value = Vec<u8>;

    fn encode(&self, value: &Vec<u8>, out: &mut dyn Write) -> Result<(), CoderError> {
        write_len_prefixed(value, out)
    }

    fn decode(&self, input: &mut dyn Read) -> Result<Vec<u8>, CoderError> {
        read_len_prefixed(input)
    }
}

/// Fixed four byte big-endian `i32`.
#[derive(Debug, Clone, Copy, Default)]
pub struct BigEndianIntCoder;

impl Coder for BigEndianIntCoder {
    type Value = i32;

    fn encode(&self, value: &i32, out: &mut dyn Write) -> Result<(), CoderError> {
        out.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn decode(&self, input: &mut dyn Read) -> Result<i32, CoderError> {
        let mut buf = [0u8; 4];
        input.read_exact(&mut buf)?;
        Ok(i32::from_be_bytes(buf))
    }
}

/// Optional values: a `0x00` marker for `None`, or `0x01` followed by
/// the inner coder's bytes.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullableCoder<C>(pub C);

impl<C> NullableCoder<C> {
    pub fn of(inner: C) -> Self {
        Self(inner)
    }
}

impl<C> Coder for NullableCoder<C>
where
    C: Coder,
{
    type Value = Option<C::Value>;

    fn encode(&self, value: &Option<C::Value>, out: &mut dyn Write) -> Result<(), CoderError> {
        match value {
            None => {
                out.write_all(&[NULL_MARKER])?;
                Ok(())
            }
            Some(value) => {
                out.write_all(&[PRESENT_MARKER])?;
                self.0.encode(value, out)
            }
        }
    }

    fn decode(&self, input: &mut dyn Read) -> Result<Option<C::Value>, CoderError> {
        match read_byte(input)? {
            NULL_MARKER => Ok(None),
            PRESENT_MARKER => self.0.decode(input).map(Some),
            other => Err(CoderError::InvalidNullMarker(other)),
        }
    }

    fn verify_deterministic(&self) -> Result<(), CoderError> {
        self.0.verify_deterministic()
    }
}

/// Any serde type, as a varint length followed by its bincode bytes.
///
/// Serde gives no guarantee that equal values serialize the same way
/// (think `HashMap` iteration order), so this coder always reports
/// itself as non-deterministic.
pub struct BincodeCoder<T>(PhantomData<fn() -> T>);

impl<T> BincodeCoder<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for BincodeCoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for BincodeCoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> Copy for BincodeCoder<T> {}

impl<T> std::fmt::Debug for BincodeCoder<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "BincodeCoder<{}>", std::any::type_name::<T>())
    }
}

impl<T> Coder for BincodeCoder<T>
where
    T: Serialize + DeserializeOwned,
{
    type Value = T;

    fn encode(&self, value: &T, out: &mut dyn Write) -> Result<(), CoderError> {
        let bytes = bincode::serialize(value).map_err(CoderError::Bincode)?;
        write_len_prefixed(&bytes, out)
    }

    fn decode(&self, input: &mut dyn Read) -> Result<T, CoderError> {
        let bytes = read_len_prefixed(input)?;
        bincode::deserialize(&bytes).map_err(CoderError::Bincode)
    }

    fn verify_deterministic(&self) -> Result<(), CoderError> {
        Err(CoderError::NonDeterministic {
            coder: "BincodeCoder",
            reason: format!(
                "serde encoding of `{}` is not guaranteed to be stable",
                std::any::type_name::<T>()
            ),
        })
    }
}
