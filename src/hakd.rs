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

//! Homomorphic key arithmetic used to build revocable keys.
//!
//! Revocable keys are built from a long-term base key and a per-state elkrem
//! point. Publishing the elkrem scalar of a state later lets the counterparty
//! compute the private key of that state's revocable output without ever
//! learning the base private key.

use bitcoin::hashes::{sha256, sha256d, Hash, HashEngine};
use secp256k1::{PublicKey, Scalar, SecretKey, SECP256K1};

/// Suffix hashed together with an elkrem hash to produce its scalar
pub const ELK_SCALAR_TAG: &[u8] = b"ELKSCALAR";

/// Suffix hashed together with an HTLC base and index to produce the HTLC
/// key tweak
pub const HTLC_TWEAK_TAG: &[u8] = b"HTLC";

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// at least two keys are required for the combination
    NotEnoughKeys,

    /// hash value can't be used as a curve scalar
    InvalidScalar,

    /// key tweak resulted in an invalid key
    InvalidTweak,
}

impl From<secp256k1::Error> for Error {
    fn from(_: secp256k1::Error) -> Self {
        Error::InvalidTweak
    }
}

fn scalar(hash: impl Hash<Inner = [u8; 32]>) -> Result<Scalar, Error> {
    Scalar::from_be_bytes(hash.into_inner()).map_err(|_| Error::InvalidScalar)
}

/// Commitment to the sorted set of keys participating in a combination
fn combo_commit(keys: &mut Vec<PublicKey>) -> sha256::Hash {
    keys.sort_by_key(PublicKey::serialize);
    let mut engine = sha256::Hash::engine();
    for key in keys.iter() {
        engine.input(&key.serialize());
    }
    sha256::Hash::from_engine(engine)
}

fn combo_factor(z: sha256::Hash, key: &PublicKey) -> Result<Scalar, Error> {
    let mut engine = sha256::Hash::engine();
    engine.input(&z[..]);
    engine.input(&key.serialize());
    scalar(sha256::Hash::from_engine(engine))
}

/// Delinearized key combination `C = Σ H(z‖Kᵢ)·Kᵢ`, where `z` commits to
/// the byte-sorted set of all keys
pub fn combine_pubs(keys: &[PublicKey]) -> Result<PublicKey, Error> {
    if keys.len() < 2 {
        return Err(Error::NotEnoughKeys);
    }
    let mut keys = keys.to_vec();
    let z = combo_commit(&mut keys);
    let terms = keys
        .iter()
        .map(|key| -> Result<PublicKey, Error> {
            Ok(key.mul_tweak(SECP256K1, &combo_factor(z, key)?)?)
        })
        .collect::<Result<Vec<_>, _>>()?;
    let refs = terms.iter().collect::<Vec<_>>();
    Ok(PublicKey::combine_keys(&refs)?)
}

/// Private key matching [`combine_pubs`] for the same set of keys
pub fn combine_privkeys(keys: &[SecretKey]) -> Result<SecretKey, Error> {
    if keys.len() < 2 {
        return Err(Error::NotEnoughKeys);
    }
    let mut pubkeys = keys
        .iter()
        .map(|key| PublicKey::from_secret_key(SECP256K1, key))
        .collect::<Vec<_>>();
    let z = combo_commit(&mut pubkeys);
    let mut sum: Option<SecretKey> = None;
    for key in keys {
        let pubkey = PublicKey::from_secret_key(SECP256K1, key);
        let term = key.mul_tweak(&combo_factor(z, &pubkey)?)?;
        sum = Some(match sum {
            None => term,
            Some(acc) => acc.add_tweak(
                &Scalar::from_be_bytes(term.secret_bytes())
                    .map_err(|_| Error::InvalidScalar)?,
            )?,
        });
    }
    let sum = sum.ok_or(Error::NotEnoughKeys)?;
    Ok(sum)
}

fn ez_tweak(point: &PublicKey, base: &PublicKey) -> Result<Scalar, Error> {
    let mut engine = sha256d::Hash::engine();
    engine.input(&point.serialize());
    engine.input(&base.serialize());
    scalar(sha256d::Hash::from_engine(engine))
}

/// Additive key tweak `A + H(B‖A)·G`. Cheaper than [`combine_pubs`] and
/// enough for keys where the counterparty can't pick `A` adversarially.
pub fn add_pubs_ez(a: PublicKey, b: PublicKey) -> Result<PublicKey, Error> {
    Ok(a.add_exp_tweak(SECP256K1, &ez_tweak(&b, &a)?)?)
}

/// Private key matching [`add_pubs_ez`]
pub fn add_privs_ez(a: SecretKey, b: PublicKey) -> Result<SecretKey, Error> {
    let a_pub = PublicKey::from_secret_key(SECP256K1, &a);
    Ok(a.add_tweak(&ez_tweak(&b, &a_pub)?)?)
}

/// Scalar behind the elkrem point of hash `elk`
pub fn elk_scalar(elk: sha256d::Hash) -> Result<SecretKey, Error> {
    let mut engine = sha256d::Hash::engine();
    engine.input(&elk[..]);
    engine.input(ELK_SCALAR_TAG);
    SecretKey::from_slice(&sha256d::Hash::from_engine(engine)[..])
        .map_err(|_| Error::InvalidScalar)
}

/// Public elkrem point of hash `elk`
pub fn elk_point(elk: sha256d::Hash) -> Result<PublicKey, Error> {
    Ok(PublicKey::from_secret_key(SECP256K1, &elk_scalar(elk)?))
}

fn htlc_tweak(base: &PublicKey, idx: u32) -> Result<Scalar, Error> {
    let mut engine = sha256d::Hash::engine();
    engine.input(&base.serialize());
    engine.input(&idx.to_be_bytes());
    engine.input(HTLC_TWEAK_TAG);
    scalar(sha256d::Hash::from_engine(engine))
}

/// Per-HTLC public key derived from a base key and HTLC index
pub fn htlc_pub(base: PublicKey, idx: u32) -> Result<PublicKey, Error> {
    Ok(base.add_exp_tweak(SECP256K1, &htlc_tweak(&base, idx)?)?)
}

/// Private key matching [`htlc_pub`]
pub fn htlc_priv(base: SecretKey, idx: u32) -> Result<SecretKey, Error> {
    let base_pub = PublicKey::from_secret_key(SECP256K1, &base);
    Ok(base.add_tweak(&htlc_tweak(&base_pub, idx)?)?)
}
