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

use std::io;

use crate::{Error, FixedSize, WireDecode, WireEncode};

// Defining strategies:
pub struct AsBigEndian;
pub struct AsBitcoinHash;

pub trait Strategy {
    type Strategy;
}

/// Unsigned integers serialized with a fixed width in network byte order
pub trait BigEndianInt: Copy + FixedSize {
    fn write_be<E: io::Write>(self, e: E) -> Result<usize, io::Error>;
    fn read_be<D: io::Read>(d: D) -> Result<Self, Error>;
}

impl<T> WireEncode for T
where
    T: Strategy + Clone,
    amplify::Holder<T, <T as Strategy>::Strategy>: WireEncode,
{
    #[inline]
    fn wire_encode<E: io::Write>(&self, e: E) -> Result<usize, io::Error> {
        amplify::Holder::new(self.clone()).wire_encode(e)
    }
}

impl<T> WireDecode for T
where
    T: Strategy,
    amplify::Holder<T, <T as Strategy>::Strategy>: WireDecode,
{
    #[inline]
    fn wire_decode<D: io::Read>(d: D) -> Result<Self, Error> {
        Ok(amplify::Holder::wire_decode(d)?.into_inner())
    }
}

impl<T> WireEncode for amplify::Holder<T, AsBigEndian>
where
    T: BigEndianInt,
{
    #[inline]
    fn wire_encode<E: io::Write>(&self, e: E) -> Result<usize, io::Error> {
        self.as_inner().write_be(e)
    }
}

impl<T> WireDecode for amplify::Holder<T, AsBigEndian>
where
    T: BigEndianInt,
{
    #[inline]
    fn wire_decode<D: io::Read>(d: D) -> Result<Self, Error> {
        Ok(Self::new(T::read_be(d)?))
    }
}

impl<T> WireEncode for amplify::Holder<T, AsBitcoinHash>
where
    T: bitcoin::hashes::Hash,
{
    #[inline]
    fn wire_encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        e.write_all(&self.as_inner()[..])?;
        Ok(T::LEN)
    }
}

impl<T> WireDecode for amplify::Holder<T, AsBitcoinHash>
where
    T: bitcoin::hashes::Hash,
{
    #[inline]
    fn wire_decode<D: io::Read>(mut d: D) -> Result<Self, Error> {
        let mut buf = vec![0u8; T::LEN];
        d.read_exact(&mut buf)?;
        Ok(Self::new(T::from_slice(&buf).map_err(|err| {
            Error::DataIntegrityError(err.to_string())
        })?))
    }
}
