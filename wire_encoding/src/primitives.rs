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

use super::strategies::{self, BigEndianInt};
use crate::{Error, FixedSize, Strategy, WireDecode, WireEncode};

macro_rules! impl_big_endian {
    ($($ty:ty),+) => {
        $(
            impl Strategy for $ty {
                type Strategy = strategies::AsBigEndian;
            }

            impl FixedSize for $ty {
                const LEN: usize = std::mem::size_of::<$ty>();
            }

            impl BigEndianInt for $ty {
                #[inline]
                fn write_be<E: io::Write>(
                    self,
                    mut e: E,
                ) -> Result<usize, io::Error> {
                    e.write_all(&self.to_be_bytes())?;
                    Ok(<$ty as FixedSize>::LEN)
                }

                #[inline]
                fn read_be<D: io::Read>(mut d: D) -> Result<Self, Error> {
                    let mut buf = [0u8; std::mem::size_of::<$ty>()];
                    d.read_exact(&mut buf)?;
                    Ok(<$ty>::from_be_bytes(buf))
                }
            }
        )+
    };
}

impl_big_endian!(u8, u16, u32, u64);

impl<const N: usize> FixedSize for [u8; N] {
    const LEN: usize = N;
}

impl<const N: usize> WireEncode for [u8; N] {
    #[inline]
    fn wire_encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        e.write_all(self)?;
        Ok(N)
    }
}

impl<const N: usize> WireDecode for [u8; N] {
    #[inline]
    fn wire_decode<D: io::Read>(mut d: D) -> Result<Self, Error> {
        let mut buf = [0u8; N];
        d.read_exact(&mut buf)?;
        Ok(buf)
    }
}
