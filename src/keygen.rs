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

//! Deterministic derivation of every channel key from a single root secret.
//!
//! A channel persists only its [`KeyGen`] path; all of its private keys are
//! re-derived on demand from the node [`KeyChain`].

use core::fmt::{self, Display, Formatter};

use bitcoin::hashes::{sha256d, Hash};
use bitcoin::network::constants::Network;
use bitcoin::util::bip32::{self, ChildNumber, ExtendedPrivKey};
use secp256k1::{PublicKey, SecretKey, SECP256K1};

use crate::elkrem::ElkremSender;

/// Number of levels in every channel key path
pub const KEYGEN_DEPTH: u8 = 5;

/// Bit marking hardened derivation of a path step
pub const HARDENED: u32 = 0x8000_0000;

/// BIP-44 purpose step which starts every path
pub const PURPOSE: u32 = 44;

#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// key path has depth {0}, while channel keys require exactly 5
    /// derivation levels
    WrongDepth(u8),

    /// extended key derivation failure: {0}
    #[from]
    Bip32(bip32::Error),
}

/// Role codes taking the third level of a channel key path
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display)]
#[display(Debug)]
#[repr(u32)]
pub enum UseRole {
    /// Regular on-chain wallet keys
    Wallet = 0,
    /// Funding 2-of-2 multisig key
    ChannelFund = 20,
    /// Key receiving the non-revocable refund output
    ChannelRefund = 30,
    /// Key receiving revoked outputs swept by justice transactions
    WatchRefund = 31,
    /// Base of the homomorphic revocable keys and of the per-HTLC keys
    /// tweaked from it
    HakdBase = 40,
    /// Key receiving HTLC outputs claimed on-chain
    HtlcBase = 41,
    /// Source of the elkrem tree root
    Elkrem = 8888,
}

impl UseRole {
    /// Hardened path step for the role
    #[inline]
    pub fn step(self) -> u32 {
        self as u32 | HARDENED
    }
}

/// Key derivation path: depth plus per-level steps, with the top bit of a
/// step marking hardened derivation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct KeyGen {
    pub depth: u8,
    pub step: [u32; 5],
}

impl Display for KeyGen {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str("m")?;
        for step in self.step.iter().take(self.depth as usize) {
            if step & HARDENED != 0 {
                write!(f, "/{}'", step & !HARDENED)?;
            } else {
                write!(f, "/{}", step)?;
            }
        }
        Ok(())
    }
}

impl KeyGen {
    /// Path `m/44'/coin'/role/peer'/chan'` selecting a key used by channel
    /// `chan` with peer `peer`
    pub fn channel(coin: u32, role: UseRole, peer: u32, chan: u32) -> KeyGen {
        KeyGen {
            depth: KEYGEN_DEPTH,
            step: [
                PURPOSE | HARDENED,
                coin | HARDENED,
                role.step(),
                peer | HARDENED,
                chan | HARDENED,
            ],
        }
    }

    /// The same path with the role level replaced
    #[inline]
    pub fn with_role(mut self, role: UseRole) -> KeyGen {
        self.step[2] = role.step();
        self
    }

    #[inline]
    pub fn peer_idx(&self) -> u32 {
        self.step[3] & !HARDENED
    }

    #[inline]
    pub fn chan_idx(&self) -> u32 {
        self.step[4] & !HARDENED
    }

    fn child_numbers(&self) -> Result<Vec<ChildNumber>, Error> {
        if self.depth != KEYGEN_DEPTH {
            return Err(Error::WrongDepth(self.depth));
        }
        Ok(self.step.iter().copied().map(ChildNumber::from).collect())
    }
}

/// Private keys of one channel. Never persisted: re-derived from the
/// [`KeyChain`] every time they are needed.
#[derive(Clone, Debug)]
pub struct ChannelKeys {
    /// Funding multisig key
    pub fund: SecretKey,
    /// Refund key
    pub refund: SecretKey,
    /// HAKD base key
    pub hakd: SecretKey,
    /// Receives justice sweeps
    pub watch_refund: SecretKey,
    /// Receives HTLC outputs claimed on-chain
    pub htlc_base: SecretKey,
    /// Generator of own revocation hashes
    pub elk_snd: ElkremSender,
}

/// Root of all node keys
#[derive(Clone, Debug)]
pub struct KeyChain {
    master: ExtendedPrivKey,
}

impl KeyChain {
    pub fn with_seed(seed: &[u8]) -> Result<KeyChain, Error> {
        Ok(KeyChain {
            master: ExtendedPrivKey::new_master(Network::Bitcoin, seed)?,
        })
    }

    /// Derives key pair at `path`; fails if the path has a depth other than
    /// [`KEYGEN_DEPTH`]
    pub fn derive(&self, path: &KeyGen) -> Result<(SecretKey, PublicKey), Error> {
        let xpriv = self.master.derive_priv(SECP256K1, &path.child_numbers()?)?;
        let seckey = xpriv.private_key;
        Ok((seckey, PublicKey::from_secret_key(SECP256K1, &seckey)))
    }

    #[inline]
    pub fn derive_pubkey(&self, path: &KeyGen) -> Result<PublicKey, Error> {
        self.derive(path).map(|(_, pubkey)| pubkey)
    }

    /// Seed of the channel elkrem tree: double SHA-256 of the public key at
    /// the elkrem role of the same path
    pub fn derive_elkrem_root(
        &self,
        path: &KeyGen,
    ) -> Result<sha256d::Hash, Error> {
        let pubkey = self.derive_pubkey(&path.with_role(UseRole::Elkrem))?;
        Ok(sha256d::Hash::hash(&pubkey.serialize()))
    }

    /// Derives all private material of the channel whose funding key sits at
    /// `path`
    pub fn channel_keys(&self, path: &KeyGen) -> Result<ChannelKeys, Error> {
        Ok(ChannelKeys {
            fund: self.derive(&path.with_role(UseRole::ChannelFund))?.0,
            refund: self.derive(&path.with_role(UseRole::ChannelRefund))?.0,
            hakd: self.derive(&path.with_role(UseRole::HakdBase))?.0,
            watch_refund: self.derive(&path.with_role(UseRole::WatchRefund))?.0,
            htlc_base: self.derive(&path.with_role(UseRole::HtlcBase))?.0,
            elk_snd: ElkremSender::new(self.derive_elkrem_root(path)?),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn keychain() -> KeyChain {
        KeyChain::with_seed(&[0x5a; 32]).unwrap()
    }

    #[test]
    fn derivation_is_deterministic() {
        let path = KeyGen::channel(0, UseRole::ChannelFund, 1, 7);
        let (sk1, pk1) = keychain().derive(&path).unwrap();
        let (sk2, pk2) = keychain().derive(&path).unwrap();
        assert_eq!(sk1, sk2);
        assert_eq!(pk1, pk2);
        assert_eq!(pk1, PublicKey::from_secret_key(SECP256K1, &sk1));

        let other = keychain()
            .derive_pubkey(&KeyGen::channel(0, UseRole::ChannelFund, 1, 8))
            .unwrap();
        assert_ne!(pk1, other);
        let refund = keychain()
            .derive_pubkey(&path.with_role(UseRole::ChannelRefund))
            .unwrap();
        assert_ne!(pk1, refund);
    }

    #[test]
    fn wrong_depth_fails() {
        let mut path = KeyGen::channel(0, UseRole::ChannelFund, 1, 7);
        path.depth = 4;
        assert_eq!(keychain().derive(&path), Err(Error::WrongDepth(4)));
        assert_eq!(
            keychain().derive_pubkey(&KeyGen::default()),
            Err(Error::WrongDepth(0))
        );
    }

    #[test]
    fn elkrem_root_uses_elkrem_role() {
        let path = KeyGen::channel(0, UseRole::ChannelFund, 2, 3);
        let pubkey = keychain()
            .derive_pubkey(&path.with_role(UseRole::Elkrem))
            .unwrap();
        assert_eq!(
            keychain().derive_elkrem_root(&path).unwrap(),
            sha256d::Hash::hash(&pubkey.serialize())
        );
        assert_ne!(
            keychain().derive_elkrem_root(&path).unwrap(),
            keychain()
                .derive_elkrem_root(&KeyGen::channel(0, UseRole::ChannelFund, 2, 4))
                .unwrap()
        );
    }

    #[test]
    fn channel_keys_follow_roles() {
        let path = KeyGen::channel(0, UseRole::ChannelFund, 4, 2);
        let keys = keychain().channel_keys(&path).unwrap();
        for (role, key) in [
            (UseRole::ChannelFund, keys.fund),
            (UseRole::ChannelRefund, keys.refund),
            (UseRole::WatchRefund, keys.watch_refund),
            (UseRole::HakdBase, keys.hakd),
            (UseRole::HtlcBase, keys.htlc_base),
        ] {
            assert_eq!(keychain().derive(&path.with_role(role)).unwrap().0, key);
        }
        assert_ne!(keys.watch_refund, keys.refund);
    }

    #[test]
    fn path_display() {
        let path = KeyGen::channel(1, UseRole::HakdBase, 3, 9);
        assert_eq!(path.to_string(), "m/44'/1'/40'/3'/9'");
        assert_eq!(path.peer_idx(), 3);
        assert_eq!(path.chan_idx(), 9);
    }
}
