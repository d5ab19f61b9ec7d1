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

use amplify::Wrapper;
use bitcoin::blockdata::opcodes::all::*;
use bitcoin::blockdata::script;
use bitcoin::hashes::{hash160, Hash};
use bitcoin::{Script, WPubkeyHash};
use secp256k1::PublicKey;

use super::lex_order::LexOrder;

/// Size of HTLC preimages
pub const PREIMAGE_LEN: i64 = 16;

/// Script committed to by a P2WSH output and revealed in the witness when
/// spending it
#[derive(Wrapper, Clone, PartialEq, Eq, Hash, Debug, Default, From)]
pub struct WitnessScript(Script);

/// Script placed into `scriptPubkey` of a transaction output
#[derive(Wrapper, Clone, PartialEq, Eq, Hash, Debug, Default, From)]
pub struct PubkeyScript(Script);

impl WitnessScript {
    #[inline]
    pub fn to_p2wsh(&self) -> PubkeyScript {
        PubkeyScript::from_inner(Script::new_v0_p2wsh(
            &self.as_inner().wscript_hash(),
        ))
    }
}

impl PubkeyScript {
    /// Pay-to-witness-pubkey-hash output paying to `pubkey`
    pub fn ln_refund(pubkey: PublicKey) -> Self {
        PubkeyScript::from_inner(Script::new_v0_p2wpkh(&WPubkeyHash::hash(
            &pubkey.serialize(),
        )))
    }
}

pub trait ScriptGenerators {
    /// 2-of-2 multisig with the keys in lexicographic order
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self;

    /// Revocable output of a commitment: spendable at once with the
    /// revocation key or after `delay` blocks with the timeout key.
    ///
    /// NB: on the commitment built for the remote node, `timeout_pubkey` is
    /// the remote one.
    fn ln_commit(
        revocation_pubkey: PublicKey,
        timeout_pubkey: PublicKey,
        delay: u16,
    ) -> Self;

    /// HTLC offered by the commitment owner: claimable by the remote party
    /// with the preimage, returned to the owner after `locktime` and
    /// `delay`
    fn ln_offered_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self;

    /// HTLC received by the commitment owner: claimable by the owner with
    /// the preimage after `delay`, returned to the remote party after
    /// `locktime`
    fn ln_received_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self;
}

fn htlc_script(
    revocation_pubkey: PublicKey,
    preimage_pubkey: PublicKey,
    timeout_pubkey: PublicKey,
    payment_hash: [u8; 32],
    locktime: u32,
    owner_delay: (bool, u16),
) -> Script {
    let (preimage_path_owned, delay) = owner_delay;
    let rev_pkh = hash160::Hash::hash(&revocation_pubkey.serialize());

    let mut builder = script::Builder::new()
        .push_opcode(OP_DUP)
        .push_opcode(OP_HASH160)
        .push_slice(&rev_pkh[..])
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_key(&bitcoin::PublicKey::new(preimage_pubkey))
        .push_opcode(OP_SWAP)
        .push_opcode(OP_SIZE)
        .push_int(PREIMAGE_LEN)
        .push_opcode(OP_EQUAL)
        .push_opcode(OP_IF)
        .push_opcode(OP_SHA256)
        .push_slice(&payment_hash)
        .push_opcode(OP_EQUALVERIFY);
    if preimage_path_owned {
        builder = builder
            .push_int(delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);
    }
    builder = builder
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ELSE)
        .push_opcode(OP_DROP)
        .push_opcode(OP_DROP)
        .push_int(locktime as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP);
    if !preimage_path_owned {
        builder = builder
            .push_int(delay as i64)
            .push_opcode(OP_CSV)
            .push_opcode(OP_DROP);
    }
    builder
        .push_key(&bitcoin::PublicKey::new(timeout_pubkey))
        .push_opcode(OP_CHECKSIG)
        .push_opcode(OP_ENDIF)
        .push_opcode(OP_ENDIF)
        .into_script()
}

impl ScriptGenerators for WitnessScript {
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        let pk = vec![
            bitcoin::PublicKey::new(local_pubkey),
            bitcoin::PublicKey::new(remote_pubkey),
        ]
        .lex_ordered();

        WitnessScript::from_inner(
            script::Builder::new()
                .push_int(2)
                .push_key(&pk[0])
                .push_key(&pk[1])
                .push_int(2)
                .push_opcode(OP_CHECKMULTISIG)
                .into_script(),
        )
    }

    fn ln_commit(
        revocation_pubkey: PublicKey,
        timeout_pubkey: PublicKey,
        delay: u16,
    ) -> Self {
        WitnessScript::from_inner(
            script::Builder::new()
                .push_opcode(OP_IF)
                .push_key(&bitcoin::PublicKey::new(revocation_pubkey))
                .push_opcode(OP_ELSE)
                .push_int(delay as i64)
                .push_opcode(OP_CSV)
                .push_opcode(OP_DROP)
                .push_key(&bitcoin::PublicKey::new(timeout_pubkey))
                .push_opcode(OP_ENDIF)
                .push_opcode(OP_CHECKSIG)
                .into_script(),
        )
    }

    fn ln_offered_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self {
        WitnessScript::from_inner(htlc_script(
            revocation_pubkey,
            remote_htlcpubkey,
            local_htlcpubkey,
            payment_hash,
            locktime,
            (false, delay),
        ))
    }

    fn ln_received_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self {
        WitnessScript::from_inner(htlc_script(
            revocation_pubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
            locktime,
            (true, delay),
        ))
    }
}

impl ScriptGenerators for PubkeyScript {
    #[inline]
    fn ln_funding(local_pubkey: PublicKey, remote_pubkey: PublicKey) -> Self {
        WitnessScript::ln_funding(local_pubkey, remote_pubkey).to_p2wsh()
    }

    #[inline]
    fn ln_commit(
        revocation_pubkey: PublicKey,
        timeout_pubkey: PublicKey,
        delay: u16,
    ) -> Self {
        WitnessScript::ln_commit(revocation_pubkey, timeout_pubkey, delay)
            .to_p2wsh()
    }

    #[inline]
    fn ln_offered_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self {
        WitnessScript::ln_offered_htlc(
            revocation_pubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
            locktime,
            delay,
        )
        .to_p2wsh()
    }

    #[inline]
    fn ln_received_htlc(
        revocation_pubkey: PublicKey,
        local_htlcpubkey: PublicKey,
        remote_htlcpubkey: PublicKey,
        payment_hash: [u8; 32],
        locktime: u32,
        delay: u16,
    ) -> Self {
        WitnessScript::ln_received_htlc(
            revocation_pubkey,
            local_htlcpubkey,
            remote_htlcpubkey,
            payment_hash,
            locktime,
            delay,
        )
        .to_p2wsh()
    }
}
