//! Wire serialization.
//!
//! All integers are big-endian fixed width. Byte strings carry a `u32`
//! length prefix. Nested arrays are encoded as a `u32` prefix over the
//! array bytes, then each element as its own `u32` length prefix followed
//! by the element bytes, so a reader can skip an array it does not
//! understand without decoding the elements.

use bytes::{Buf, BufMut, BytesMut};
use curve25519_dalek_ng::{
    ristretto::{CompressedRistretto, RistrettoPoint},
    scalar::Scalar,
};
use thiserror::Error;

pub mod frame;

/// Maximum number of elements accepted in any length-prefixed array.
///
/// Bounds allocation when decoding untrusted input; generous compared to
/// any roster or transcript this protocol produces.
pub const MAX_ELEMENTS: usize = 1 << 16;

/// Maximum byte length accepted for any length-prefixed byte string.
pub const MAX_BYTES: usize = 1 << 24;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("end of buffer")]
    EndOfBuffer,
    #[error("extra data: {0} bytes remaining")]
    ExtraData(usize),
    #[error("invalid length: {0}")]
    InvalidLength(usize),
    #[error("invalid group element")]
    InvalidPoint,
    #[error("invalid scalar")]
    InvalidScalar,
    #[error("invalid bool: {0}")]
    InvalidBool(u8),
    #[error("invalid enum discriminant: {0}")]
    InvalidEnum(u8),
    #[error("unknown message type: {0}")]
    UnknownMessage(u16),
    #[error("invalid utf-8 string")]
    InvalidString,
}

/// Trait for types that can be encoded to and decoded from wire bytes.
pub trait Codec: Sized {
    /// Encodes this value to a writer.
    fn write<B: BufMut>(&self, buf: &mut B);

    /// Returns the encoded length of this value.
    fn len_encoded(&self) -> usize;

    /// Reads a value from a buffer, consuming exactly the encoded bytes.
    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error>;

    /// Encodes a value to a fresh buffer.
    fn encode(&self) -> BytesMut {
        let len = self.len_encoded();
        let mut buf = BytesMut::with_capacity(len);
        self.write(&mut buf);
        debug_assert_eq!(buf.len(), len);
        buf
    }

    /// Decodes a value from a buffer, rejecting trailing bytes.
    fn decode<B: Buf>(mut buf: B) -> Result<Self, Error> {
        let result = Self::read(&mut buf)?;
        let remaining = buf.remaining();
        if remaining > 0 {
            return Err(Error::ExtraData(remaining));
        }
        Ok(result)
    }
}

/// Ensures at least `len` readable bytes remain.
#[inline]
pub fn at_least<B: Buf>(buf: &mut B, len: usize) -> Result<(), Error> {
    if buf.remaining() < len {
        return Err(Error::EndOfBuffer);
    }
    Ok(())
}

macro_rules! impl_int {
    ($t:ty, $put:ident, $get:ident) => {
        impl Codec for $t {
            #[inline]
            fn write<B: BufMut>(&self, buf: &mut B) {
                buf.$put(*self);
            }

            #[inline]
            fn len_encoded(&self) -> usize {
                std::mem::size_of::<$t>()
            }

            #[inline]
            fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
                at_least(buf, std::mem::size_of::<$t>())?;
                Ok(buf.$get())
            }
        }
    };
}

impl_int!(u8, put_u8, get_u8);
impl_int!(u16, put_u16, get_u16);
impl_int!(u32, put_u32, get_u32);
impl_int!(u64, put_u64, get_u64);
impl_int!(i32, put_i32, get_i32);
impl_int!(i64, put_i64, get_i64);

impl Codec for bool {
    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(*self as u8);
    }

    fn len_encoded(&self) -> usize {
        1
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        match u8::read(buf)? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(Error::InvalidBool(other)),
        }
    }
}

impl<const N: usize> Codec for [u8; N] {
    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self);
    }

    fn len_encoded(&self) -> usize {
        N
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        at_least(buf, N)?;
        let mut out = [0u8; N];
        buf.copy_to_slice(&mut out);
        Ok(out)
    }
}

/// Writes a byte string as `u32` length + raw bytes.
pub fn write_bytes<B: BufMut>(buf: &mut B, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

/// Encoded size of a byte string.
pub fn bytes_len(bytes: &[u8]) -> usize {
    4 + bytes.len()
}

/// Reads a `u32`-length-prefixed byte string.
pub fn read_bytes<B: Buf>(buf: &mut B) -> Result<Vec<u8>, Error> {
    let len = u32::read(buf)? as usize;
    if len > MAX_BYTES {
        return Err(Error::InvalidLength(len));
    }
    at_least(buf, len)?;
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

impl Codec for String {
    fn write<B: BufMut>(&self, buf: &mut B) {
        write_bytes(buf, self.as_bytes());
    }

    fn len_encoded(&self) -> usize {
        bytes_len(self.as_bytes())
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let bytes = read_bytes(buf)?;
        String::from_utf8(bytes).map_err(|_| Error::InvalidString)
    }
}

/// Group elements travel in compressed Ristretto form (32 bytes).
impl Codec for RistrettoPoint {
    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.compress().as_bytes());
    }

    fn len_encoded(&self) -> usize {
        32
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let bytes = <[u8; 32]>::read(buf)?;
        CompressedRistretto(bytes)
            .decompress()
            .ok_or(Error::InvalidPoint)
    }
}

/// Scalars travel in canonical little-endian form and are rejected if
/// non-canonical.
impl Codec for Scalar {
    fn write<B: BufMut>(&self, buf: &mut B) {
        buf.put_slice(self.as_bytes());
    }

    fn len_encoded(&self) -> usize {
        32
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let bytes = <[u8; 32]>::read(buf)?;
        Scalar::from_canonical_bytes(bytes).ok_or(Error::InvalidScalar)
    }
}

/// Arrays: `u32` total-bytes prefix, then per element a `u32` length prefix
/// and the element bytes.
impl<T: Codec> Codec for Vec<T> {
    fn write<B: BufMut>(&self, buf: &mut B) {
        let body: usize = self.iter().map(|e| 4 + e.len_encoded()).sum();
        buf.put_u32(body as u32);
        for element in self {
            buf.put_u32(element.len_encoded() as u32);
            element.write(buf);
        }
    }

    fn len_encoded(&self) -> usize {
        4 + self
            .iter()
            .map(|e| 4 + e.len_encoded())
            .sum::<usize>()
    }

    fn read<B: Buf>(buf: &mut B) -> Result<Self, Error> {
        let body = u32::read(buf)? as usize;
        if body > MAX_BYTES {
            return Err(Error::InvalidLength(body));
        }
        at_least(buf, body)?;
        let mut remaining = body;
        let mut out = Vec::new();
        while remaining > 0 {
            let elem_len = u32::read(buf)? as usize;
            if elem_len + 4 > remaining {
                return Err(Error::InvalidLength(elem_len));
            }
            if out.len() == MAX_ELEMENTS {
                return Err(Error::InvalidLength(out.len() + 1));
            }
            let mut elem = buf.copy_to_bytes(elem_len);
            out.push(T::decode(&mut elem)?);
            remaining -= 4 + elem_len;
        }
        Ok(out)
    }
}
