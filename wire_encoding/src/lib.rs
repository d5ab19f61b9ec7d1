// QChan Core Library implementing elkrem-revoked payment channels
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

//! Fixed-width big-endian encoding used by qchan peer messages.
//!
//! Every encodable type has a size known in advance ([`FixedSize::LEN`]),
//! so messages never carry length prefixes and a decoder can reject any
//! buffer whose size differs from the expected one before parsing a single
//! field.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;

mod bitcoin_types;
mod error;
mod primitives;
mod schema;
pub mod strategies;

pub use error::Error;
pub use strategies::Strategy;

// -----------------------------------------------------------------------------

use std::io;

/// Types with a fixed encoded size
pub trait FixedSize {
    /// Number of bytes taken by the encoded value
    const LEN: usize;
}

/// Fixed-width big-endian wire encoding
pub trait WireEncode {
    fn wire_encode<E: io::Write>(&self, e: E) -> Result<usize, io::Error>;
    fn wire_serialize(&self) -> Vec<u8> {
        let mut encoder = vec![];
        self.wire_encode(&mut encoder)
            .expect("Memory encoders can't fail");
        encoder
    }
}

/// Fixed-width big-endian wire decoding
pub trait WireDecode
where
    Self: Sized,
{
    fn wire_decode<D: io::Read>(d: D) -> Result<Self, Error>;

    /// Decodes value from a buffer which must have exactly
    /// [`FixedSize::LEN`] bytes; the length is checked before any field is
    /// parsed.
    fn wire_deserialize(data: impl AsRef<[u8]>) -> Result<Self, Error>
    where
        Self: FixedSize,
    {
        let data = data.as_ref();
        if data.len() != Self::LEN {
            return Err(Error::LengthMismatch {
                expected: Self::LEN,
                actual: data.len(),
            });
        }
        let mut decoder = io::Cursor::new(data);
        let rv = Self::wire_decode(&mut decoder)?;
        let consumed = decoder.position() as usize;

        // Fail if data are not consumed entirely.
        if consumed == data.len() {
            Ok(rv)
        } else {
            Err(Error::DataNotEntirelyConsumed)
        }
    }
}

pub fn wire_serialize<T>(data: &T) -> Vec<u8>
where
    T: WireEncode,
{
    data.wire_serialize()
}

pub fn wire_deserialize<T>(data: impl AsRef<[u8]>) -> Result<T, Error>
where
    T: WireDecode + FixedSize,
{
    T::wire_deserialize(data)
}
