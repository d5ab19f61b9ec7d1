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

use bitcoin::hashes::{hash160, sha256, sha256d, Hash};
use bitcoin::{OutPoint, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::{strategies, Strategy};
use crate::{Error, FixedSize, WireDecode, WireEncode};

macro_rules! impl_bitcoin_hash {
    ($($ty:ty),+) => {
        $(
            impl Strategy for $ty {
                type Strategy = strategies::AsBitcoinHash;
            }

            impl FixedSize for $ty {
                const LEN: usize = <$ty as Hash>::LEN;
            }
        )+
    };
}

impl_bitcoin_hash!(Txid, sha256d::Hash, sha256::Hash, hash160::Hash);

/// Transaction id in its internal byte order followed by the big-endian
/// output index
impl FixedSize for OutPoint {
    const LEN: usize = 32 + 4;
}

impl WireEncode for OutPoint {
    fn wire_encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        Ok(self.txid.wire_encode(&mut e)? + self.vout.wire_encode(&mut e)?)
    }
}

impl WireDecode for OutPoint {
    fn wire_decode<D: io::Read>(mut d: D) -> Result<Self, Error> {
        Ok(OutPoint {
            txid: Txid::wire_decode(&mut d)?,
            vout: u32::wire_decode(&mut d)?,
        })
    }
}

impl FixedSize for PublicKey {
    const LEN: usize = secp256k1::constants::PUBLIC_KEY_SIZE;
}

impl WireEncode for PublicKey {
    #[inline]
    fn wire_encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        e.write_all(&self.serialize())?;
        Ok(<Self as FixedSize>::LEN)
    }
}

impl WireDecode for PublicKey {
    fn wire_decode<D: io::Read>(d: D) -> Result<Self, Error> {
        let buf = <[u8; secp256k1::constants::PUBLIC_KEY_SIZE]>::wire_decode(d)?;
        PublicKey::from_slice(&buf).map_err(|_| Error::InvalidPubkey)
    }
}

/// Signatures travel in the 64-byte compact form
impl FixedSize for Signature {
    const LEN: usize = secp256k1::constants::COMPACT_SIGNATURE_SIZE;
}

impl WireEncode for Signature {
    #[inline]
    fn wire_encode<E: io::Write>(&self, mut e: E) -> Result<usize, io::Error> {
        e.write_all(&self.serialize_compact())?;
        Ok(<Self as FixedSize>::LEN)
    }
}

impl WireDecode for Signature {
    fn wire_decode<D: io::Read>(d: D) -> Result<Self, Error> {
        let buf =
            <[u8; secp256k1::constants::COMPACT_SIGNATURE_SIZE]>::wire_decode(d)?;
        Signature::from_compact(&buf).map_err(|_| Error::InvalidSignature)
    }
}
