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
//! Claims of the outputs a unilateral close leaves on-chain: HTLCs settled
//! with a preimage or by timeout, and our own delayed balance.

use amplify::Wrapper;
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    OutPoint, PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut,
    Witness,
};
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
use tracing::debug;

use super::commitment::{self, get_state_idx_from_tx, my_elk_point};
use super::scripts::{PubkeyScript, ScriptGenerators, WitnessScript};
use super::state::{Channel, Update};
use super::{Error, Policy};
use crate::hakd;
use crate::keygen::ChannelKeys;

/// Non-final sequence enabling the absolute locktime of a claim
const SEQUENCE_LOCKTIME: Sequence = Sequence(0xffff_fffe);

/// HTLC output claimed on-chain together with the channel record marking
/// the HTLC as cleared on-chain
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct HtlcClaim {
    pub channel: Channel,
    pub tx: Transaction,
}

/// P2WSH output about to be swept
#[derive(Clone, PartialEq, Eq, Debug)]
pub(super) struct SweptOutput {
    outpoint: OutPoint,
    value: u64,
    script: WitnessScript,
}

impl SweptOutput {
    /// Output of `tx` locked by `script`, if any
    pub(super) fn find(
        tx: &Transaction,
        script: WitnessScript,
    ) -> Option<SweptOutput> {
        let script_pubkey = script.to_p2wsh().into_inner();
        let txid = tx.txid();
        tx.output
            .iter()
            .enumerate()
            .find(|(_, out)| out.script_pubkey == script_pubkey)
            .map(|(vout, out)| SweptOutput {
                outpoint: OutPoint::new(txid, vout as u32),
                value: out.value,
                script,
            })
    }

    /// Unsigned transaction paying the output minus `fee` to `dest`
    pub(super) fn sweep_tx(
        &self,
        fee: u64,
        min_output: u64,
        dest: PublicKey,
        sequence: Sequence,
    ) -> Result<Transaction, Error> {
        if self.value <= fee + min_output {
            return Err(Error::SweepUnprofitable {
                value: self.value,
                fee,
            });
        }
        Ok(Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![TxIn {
                previous_output: self.outpoint,
                script_sig: Script::new(),
                sequence,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: self.value - fee,
                script_pubkey: PubkeyScript::ln_refund(dest).into_inner(),
            }],
        })
    }

    /// Signs the only input of `tx` with `key`. `selector` sits between the
    /// signature and the script and picks the script branch.
    pub(super) fn sign(
        &self,
        tx: &mut Transaction,
        key: &SecretKey,
        selector: Vec<u8>,
    ) -> Result<(), Error> {
        let sighash = SighashCache::new(&*tx)
            .segwit_signature_hash(
                0,
                self.script.as_inner(),
                self.value,
                EcdsaSighashType::All,
            )
            .map_err(|err| commitment::Error::Sighash(err.to_string()))?;
        let msg = Message::from_slice(&sighash[..])
            .map_err(|err| commitment::Error::Sighash(err.to_string()))?;
        let mut sig = SECP256K1.sign_ecdsa(&msg, key).serialize_der().to_vec();
        sig.push(EcdsaSighashType::All as u8);
        tx.input[0].witness = Witness::from_vec(vec![
            sig,
            selector,
            self.script.as_inner().to_bytes(),
        ]);
        Ok(())
    }
}

impl Channel {
    fn close_tx(&self) -> Result<&Transaction, Error> {
        match (self.close_data.closed, &self.close_data.close_tx) {
            (true, Some(tx)) => Ok(tx),
            _ => Err(Error::NotClosed(self.outpoint)),
        }
    }

    /// Counterparty elkrem point of its commitment at state `idx`: the
    /// current one, the one under negotiation or a revoked one
    fn their_point(&self, idx: u64) -> Option<PublicKey> {
        if idx == self.state.state_idx {
            Some(self.state.elk_point)
        } else if idx == self.state.state_idx + 1 {
            Some(self.state.next_elk_point)
        } else if !self.elk_rcv.is_empty() && idx <= self.elk_rcv.up_to() {
            let elk = self.elk_rcv.at_index(idx).ok()?;
            hakd::elk_point(elk).ok()
        } else {
            None
        }
    }

    /// Claims HTLC `idx` from the commitment which closed the channel: an
    /// incoming HTLC with its `preimage`, or one we offered by timeout once
    /// `height` reaches its locktime. The claim pays to our HTLC-base key.
    pub fn claim_htlc_on_chain(
        &self,
        idx: u32,
        preimage: Option<[u8; 16]>,
        keys: &ChannelKeys,
        policy: &Policy,
        height: u32,
    ) -> Result<HtlcClaim, Error> {
        let tx = self.close_tx()?;
        let htlc = self.htlc(idx)?;
        if htlc.cleared_on_chain {
            return Err(Error::HtlcCleared(idx));
        }
        self.validate_update(
            &Update::Clear {
                idx,
                preimage,
                data: [0; 32],
            },
            false,
            policy,
            height,
        )?;

        let (mine, output) = [true, false]
            .into_iter()
            .find_map(|mine| {
                let state_idx = get_state_idx_from_tx(tx, self.chan_hint(mine));
                let point = if mine {
                    my_elk_point(&keys.elk_snd, state_idx).ok()?
                } else {
                    self.their_point(state_idx)?
                };
                let commitment_keys =
                    self.commitment_keys_with(mine, point).ok()?;
                let script = self
                    .htlc_witness_script(htlc, &commitment_keys, mine)
                    .ok()?;
                SweptOutput::find(tx, script).map(|output| (mine, output))
            })
            .ok_or(Error::HtlcOutputNotFound {
                txid: tx.txid(),
                idx,
            })?;

        // on its own commitment the owner waits for the CSV delay
        let sequence = if mine {
            Sequence(self.delay as u32)
        } else {
            SEQUENCE_LOCKTIME
        };
        let mut claim = output.sweep_tx(
            self.fee,
            self.min_output,
            PublicKey::from_secret_key(SECP256K1, &keys.htlc_base),
            sequence,
        )?;
        if preimage.is_none() {
            claim.lock_time = PackedLockTime(htlc.locktime);
        }
        let seckey = hakd::htlc_priv(keys.hakd, idx)?;
        // a preimage-sized element selects the preimage branch
        let selector = preimage.map(|preimage| preimage.to_vec()).unwrap_or_default();
        output.sign(&mut claim, &seckey, selector)?;

        let mut channel = self.clone();
        channel.state.htlcs[idx as usize].cleared_on_chain = true;
        debug!(
            channel = %self.outpoint,
            idx,
            txid = %claim.txid(),
            timeout = preimage.is_none(),
            "HTLC claimed on-chain"
        );
        Ok(HtlcClaim { channel, tx: claim })
    }

    /// Spends our delayed balance from our own commitment which closed the
    /// channel to the refund key. The transaction is valid once the CSV
    /// delay has passed since the close.
    pub fn sweep_timeout(
        &self,
        keys: &ChannelKeys,
    ) -> Result<Transaction, Error> {
        let tx = self.close_tx()?;
        let state_idx = get_state_idx_from_tx(tx, self.chan_hint(true));
        let (point, output) = my_elk_point(&keys.elk_snd, state_idx)
            .ok()
            .and_then(|point| {
                let commitment_keys =
                    self.commitment_keys_with(true, point).ok()?;
                let script = WitnessScript::ln_commit(
                    commitment_keys.revocation,
                    commitment_keys.timeout,
                    self.delay,
                );
                SweptOutput::find(tx, script).map(|output| (point, output))
            })
            .ok_or_else(|| Error::RevocableOutputNotFound(tx.txid()))?;

        let mut sweep = output.sweep_tx(
            self.fee,
            self.min_output,
            self.my_refund_pub,
            Sequence(self.delay as u32),
        )?;
        let seckey = hakd::add_privs_ez(keys.hakd, point)?;
        // empty element selects the delayed branch
        output.sign(&mut sweep, &seckey, vec![])?;
        Ok(sweep)
    }
}

#[cfg(test)]
mod test {
    use secp256k1::ecdsa::Signature;

    use super::*;
    use crate::channel::fund::test::{open_pair, policy, round, Party};
    use crate::channel::payment_hash;

    const PREIMAGE: [u8; 16] = [0x6c; 16];

    fn signed_by(tx: &Transaction, value: u64, pubkey: &PublicKey) -> bool {
        let witness = tx.input[0].witness.to_vec();
        let sig = &witness[0];
        let script = Script::from(witness[witness.len() - 1].clone());
        let sighash = SighashCache::new(tx)
            .segwit_signature_hash(0, &script, value, EcdsaSighashType::All)
            .unwrap();
        let msg = Message::from_slice(&sighash[..]).unwrap();
        let sig = Signature::from_der(&sig[..sig.len() - 1]).unwrap();
        SECP256K1.verify_ecdsa(&msg, &sig, pubkey).is_ok()
    }

    /// A offers B a 50 000 sat HTLC, then B breaks the channel
    fn broken_with_htlc() -> (Party, Party, Transaction) {
        let (mut a, mut b) = open_pair(1_000_000, 300_000);
        round(&mut a, &mut b, Update::Offer {
            amount: 50_000,
            rhash: payment_hash(PREIMAGE),
            locktime: 2_000,
            data: [0; 32],
        });
        let broken = b.chan.break_tx(&b.keys, 1_100).unwrap();
        b.chan = broken.channel;
        assert!(a.chan.close_data.mark_closed(&broken.tx, 1_100));
        (a, b, broken.tx)
    }

    #[test]
    fn preimage_claim_from_own_commitment() {
        let (_, b, broken) = broken_with_htlc();
        let claim = b
            .chan
            .claim_htlc_on_chain(0, Some(PREIMAGE), &b.keys, &policy(), 1_100)
            .unwrap();
        let tx = &claim.tx;
        let spent = &broken.output[tx.input[0].previous_output.vout as usize];
        assert_eq!(tx.input[0].previous_output.txid, broken.txid());
        assert_eq!(spent.value, 50_000);
        assert_eq!(tx.output[0].value, 50_000 - b.chan.fee);
        assert_eq!(
            tx.output[0].script_pubkey,
            PubkeyScript::ln_refund(PublicKey::from_secret_key(
                SECP256K1,
                &b.keys.htlc_base
            ))
            .into_inner()
        );
        // the HTLC was received on the commitment of its owner
        assert_eq!(tx.input[0].sequence, Sequence(b.chan.delay as u32));
        assert_eq!(tx.lock_time, PackedLockTime::ZERO);
        assert_eq!(tx.input[0].witness.to_vec()[1], PREIMAGE.to_vec());
        let htlc_pub = hakd::htlc_pub(b.chan.my_hakd_base, 0).unwrap();
        assert!(signed_by(tx, spent.value, &htlc_pub));

        assert!(claim.channel.state.htlcs[0].cleared_on_chain);
        assert_eq!(claim.channel.claimable_htlcs(PREIMAGE), Vec::<u32>::new());
        assert_eq!(
            claim.channel.claim_htlc_on_chain(
                0,
                Some(PREIMAGE),
                &b.keys,
                &policy(),
                1_100
            ),
            Err(Error::HtlcCleared(0))
        );
    }

    #[test]
    fn timeout_claim_from_counterparty_commitment() {
        let (a, _, broken) = broken_with_htlc();
        assert_eq!(
            a.chan
                .claim_htlc_on_chain(0, None, &a.keys, &policy(), 1_999)
                .unwrap_err(),
            Error::LocktimeNotReached {
                idx: 0,
                locktime: 2_000,
                height: 1_999
            }
        );
        assert_eq!(
            a.chan
                .claim_htlc_on_chain(0, Some(PREIMAGE), &a.keys, &policy(), 2_000)
                .unwrap_err(),
            Error::WrongClearDirection(0)
        );

        let claim = a
            .chan
            .claim_htlc_on_chain(0, None, &a.keys, &policy(), 2_000)
            .unwrap();
        let tx = &claim.tx;
        assert_eq!(tx.input[0].previous_output.txid, broken.txid());
        assert_eq!(tx.lock_time, PackedLockTime(2_000));
        assert_eq!(tx.input[0].sequence, SEQUENCE_LOCKTIME);
        assert!(tx.input[0].witness.to_vec()[1].is_empty());
        let htlc_pub = hakd::htlc_pub(a.chan.my_hakd_base, 0).unwrap();
        assert!(signed_by(tx, 50_000, &htlc_pub));
        assert!(claim.channel.state.htlcs[0].cleared_on_chain);
        assert_eq!(claim.channel.expired_htlcs(2_000), Vec::<u32>::new());
    }

    #[test]
    fn open_channel_settles_off_chain() {
        let (a, _) = open_pair(1_000_000, 300_000);
        assert_eq!(
            a.chan.sweep_timeout(&a.keys),
            Err(Error::NotClosed(a.chan.outpoint))
        );
        assert!(matches!(
            a.chan.claim_htlc_on_chain(0, None, &a.keys, &policy(), 0),
            Err(Error::NotClosed(_))
        ));
    }

    #[test]
    fn delayed_balance_swept() {
        let (mut a, mut b) = open_pair(1_000_000, 300_000);
        round(&mut a, &mut b, Update::Push { amount: 40_000 });
        let broken = a.chan.break_tx(&a.keys, 1_200).unwrap();
        a.chan = broken.channel;

        let sweep = a.chan.sweep_timeout(&a.keys).unwrap();
        let vout = sweep.input[0].previous_output.vout as usize;
        let spent = &broken.tx.output[vout];
        assert_eq!(spent.value, 660_000 - a.chan.fee);
        assert_eq!(sweep.output[0].value, spent.value - a.chan.fee);
        assert_eq!(sweep.input[0].sequence, Sequence(a.chan.delay as u32));
        assert!(sweep.input[0].witness.to_vec()[1].is_empty());
        let timeout = a
            .chan
            .commitment_keys(&a.keys.elk_snd, true)
            .unwrap()
            .timeout;
        assert!(signed_by(&sweep, spent.value, &timeout));

        // the counterparty has no delayed output in our commitment
        assert!(b.chan.close_data.mark_closed(&broken.tx, 1_200));
        assert_eq!(
            b.chan.sweep_timeout(&b.keys),
            Err(Error::RevocableOutputNotFound(broken.tx.txid()))
        );
    }
}
