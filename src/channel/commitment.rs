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
//! Construction of the asymmetric commitment transactions, the cooperative
//! close transaction and the signatures over them.

use amplify::Wrapper;
use bitcoin::blockdata::transaction::EcdsaSighashType;
use bitcoin::hashes::{sha256d, Hash, HashEngine};
use bitcoin::util::sighash::SighashCache;
use bitcoin::{
    PackedLockTime, Script, Sequence, Transaction, TxIn, TxOut, Witness,
};
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};

use super::lex_order::LexOrder;
use super::scripts::{PubkeyScript, ScriptGenerators, WitnessScript};
use super::state::{Channel, Htlc, Phase};
use crate::elkrem::{self, ElkremSender};
use crate::hakd;

/// Exclusive upper bound of state indexes encodable into a transaction
pub const STATE_IDX_LIMIT: u64 = 1 << 48;

/// Marker in the top byte of the input sequence
const SEQ_MASK: u32 = 0xff00_0000;

/// Marker in the top byte of the locktime; a timestamp long in the past
const TIME_MASK: u32 = 0x2100_0000;

const LOW_24_BITS: u64 = 0x00ff_ffff;

#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// commitment can't be built while the channel is in {0} phase
    UpdateInFlight(Phase),

    /// state index {0} does not fit into 48 bits
    StateIdxOverflow(u64),

    /// state index can be encoded only into a transaction with a single
    /// input, while this one has {0}
    InputCount(usize),

    /// balance of {amount} sat produces an output below the dust floor; at
    /// least {minimum} sat is required
    Dust { amount: u64, minimum: u64 },

    /// transaction has no outputs
    NoOutputs,

    /// signature over state {0} does not verify
    InvalidSignature(u64),

    /// unable to compute signature hash: {0}
    Sighash(String),

    /// key arithmetic failure: {0}
    #[from]
    Hakd(hakd::Error),

    /// own elkrem tree failure: {0}
    #[from]
    Elkrem(elkrem::Error),
}

/// Encodes state index `idx`, masked by `hint`, into the sequence of the
/// only input and the locktime
pub fn set_state_idx_bits(
    tx: &mut Transaction,
    idx: u64,
    hint: u64,
) -> Result<(), Error> {
    if tx.input.len() != 1 {
        return Err(Error::InputCount(tx.input.len()));
    }
    if idx >= STATE_IDX_LIMIT {
        return Err(Error::StateIdxOverflow(idx));
    }
    let x = idx ^ hint;
    tx.input[0].sequence = Sequence((x >> 24) as u32 | SEQ_MASK);
    tx.lock_time = PackedLockTime((x & LOW_24_BITS) as u32 | TIME_MASK);
    Ok(())
}

/// Recovers the state index from a commitment; zero for transactions which
/// do not carry one
pub fn get_state_idx_from_tx(tx: &Transaction, hint: u64) -> u64 {
    if tx.input.len() != 1 || hint > STATE_IDX_LIMIT {
        return 0;
    }
    let seq = tx.input[0].sequence.0;
    let lock_time = tx.lock_time.0;
    if seq >> 24 != SEQ_MASK >> 24 || lock_time >> 24 != TIME_MASK >> 24 {
        return 0;
    }
    let seq_bits = seq as u64 & LOW_24_BITS;
    let time_bits = lock_time as u64 & LOW_24_BITS;
    (seq_bits << 24 | time_bits) ^ hint
}

/// Keys locking the outputs of one of the commitments
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct CommitmentKeys {
    /// Spends the revocable output once the state is revoked
    pub revocation: PublicKey,
    /// Spends the revocable output after the CSV delay
    pub timeout: PublicKey,
    /// Receives the non-revocable output
    pub refund: PublicKey,
}

/// Elkrem point of our own state `idx`
pub fn my_elk_point(
    elk_snd: &ElkremSender,
    idx: u64,
) -> Result<PublicKey, Error> {
    Ok(hakd::elk_point(elk_snd.at_index(idx)?)?)
}

impl Channel {
    /// 48-bit mask applied to state indexes of the commitment held by us
    /// (`mine`) or by the counterparty
    pub fn chan_hint(&self, mine: bool) -> u64 {
        let (first, second) = if mine {
            (self.my_refund_pub, self.their_refund_pub)
        } else {
            (self.their_refund_pub, self.my_refund_pub)
        };
        let mut engine = sha256d::Hash::engine();
        engine.input(&first.serialize());
        engine.input(&second.serialize());
        let h = sha256d::Hash::from_engine(engine);
        let mut x = [0u8; 8];
        x[2..8].copy_from_slice(&h[2..8]);
        u64::from_be_bytes(x)
    }

    #[inline]
    pub fn funding_script(&self) -> WitnessScript {
        WitnessScript::ln_funding(self.my_pub, self.their_pub)
    }

    /// Keys of our commitment (`mine`) or the counterparty's one at the
    /// current state
    pub fn commitment_keys(
        &self,
        elk_snd: &ElkremSender,
        mine: bool,
    ) -> Result<CommitmentKeys, Error> {
        let point = if mine {
            my_elk_point(elk_snd, self.state.state_idx)?
        } else {
            self.state.elk_point
        };
        self.commitment_keys_with(mine, point)
    }

    /// Keys of our commitment (`mine`) or the counterparty's one at the
    /// state whose elkrem point, chosen by the commitment owner, is `point`
    pub fn commitment_keys_with(
        &self,
        mine: bool,
        point: PublicKey,
    ) -> Result<CommitmentKeys, Error> {
        Ok(if mine {
            CommitmentKeys {
                revocation: hakd::combine_pubs(&[self.their_hakd_base, point])?,
                timeout: hakd::add_pubs_ez(self.my_hakd_base, point)?,
                refund: self.their_refund_pub,
            }
        } else {
            CommitmentKeys {
                revocation: hakd::combine_pubs(&[self.my_hakd_base, point])?,
                timeout: hakd::add_pubs_ez(self.their_hakd_base, point)?,
                refund: self.my_refund_pub,
            }
        })
    }

    /// Script of the output holding `htlc` in our commitment (`mine`) or
    /// the counterparty's one
    pub fn htlc_witness_script(
        &self,
        htlc: &Htlc,
        keys: &CommitmentKeys,
        mine: bool,
    ) -> Result<WitnessScript, Error> {
        let my_htlc_pub = hakd::htlc_pub(self.my_hakd_base, htlc.idx)?;
        let their_htlc_pub = hakd::htlc_pub(self.their_hakd_base, htlc.idx)?;
        let (local, remote) = if mine {
            (my_htlc_pub, their_htlc_pub)
        } else {
            (their_htlc_pub, my_htlc_pub)
        };
        // the commitment owner offered the HTLC
        let offered = htlc.incoming != mine;
        Ok(if offered {
            WitnessScript::ln_offered_htlc(
                keys.revocation,
                local,
                remote,
                htlc.rhash,
                htlc.locktime,
                self.delay,
            )
        } else {
            WitnessScript::ln_received_htlc(
                keys.revocation,
                local,
                remote,
                htlc.rhash,
                htlc.locktime,
                self.delay,
            )
        })
    }

    /// Balance output value after the fee, if the balance is non-zero
    fn balance_output(&self, amount: u64) -> Result<Option<u64>, Error> {
        if amount == 0 {
            return Ok(None);
        }
        let minimum = self.min_output + self.fee;
        if amount < minimum {
            return Err(Error::Dust { amount, minimum });
        }
        Ok(Some(amount - self.fee))
    }

    fn funding_input(&self) -> TxIn {
        TxIn {
            previous_output: self.outpoint,
            script_sig: Script::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }
    }

    /// Builds our commitment (`mine`) or the counterparty's one for the
    /// current state. The channel must be at rest: commitments for states
    /// under negotiation are built from settled copies.
    pub fn build_state_tx(
        &self,
        elk_snd: &ElkremSender,
        mine: bool,
    ) -> Result<Transaction, Error> {
        if self.state.is_busy() {
            return Err(Error::UpdateInFlight(self.state.phase));
        }
        let keys = self.commitment_keys(elk_snd, mine)?;

        let my_amt = self.state.my_amt;
        let their_amt = self.their_amt();
        let (fancy_amt, pkh_amt) = if mine {
            (my_amt, their_amt)
        } else {
            (their_amt, my_amt)
        };

        let mut output = Vec::with_capacity(2 + self.state.htlcs.len());
        if let Some(value) = self.balance_output(fancy_amt)? {
            output.push(TxOut {
                value,
                script_pubkey: PubkeyScript::ln_commit(
                    keys.revocation,
                    keys.timeout,
                    self.delay,
                )
                .into_inner(),
            });
        }
        if let Some(value) = self.balance_output(pkh_amt)? {
            output.push(TxOut {
                value,
                script_pubkey: PubkeyScript::ln_refund(keys.refund)
                    .into_inner(),
            });
        }
        for htlc in self.state.active_htlcs() {
            if htlc.amount < self.min_output {
                return Err(Error::Dust {
                    amount: htlc.amount,
                    minimum: self.min_output,
                });
            }
            output.push(TxOut {
                value: htlc.amount,
                script_pubkey: self
                    .htlc_witness_script(htlc, &keys, mine)?
                    .to_p2wsh()
                    .into_inner(),
            });
        }
        if output.is_empty() {
            return Err(Error::NoOutputs);
        }

        let mut tx = Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![self.funding_input()],
            output,
        };
        set_state_idx_bits(&mut tx, self.state.state_idx, self.chan_hint(mine))?;
        tx.lex_order();
        Ok(tx)
    }

    /// Cooperative close: both balances paid to the refund keys, no scripts
    /// and no timelocks
    pub fn simple_close_tx(&self) -> Result<Transaction, Error> {
        let mut output = vec![];
        for (amount, refund) in [
            (self.state.my_amt, self.my_refund_pub),
            (self.their_amt(), self.their_refund_pub),
        ] {
            if let Some(value) = self.balance_output(amount)? {
                output.push(TxOut {
                    value,
                    script_pubkey: PubkeyScript::ln_refund(refund).into_inner(),
                });
            }
        }
        if output.is_empty() {
            return Err(Error::NoOutputs);
        }
        Ok(Transaction {
            version: 2,
            lock_time: PackedLockTime::ZERO,
            input: vec![self.funding_input()],
            output,
        }
        .lex_ordered())
    }

    /// Digest signed by both funding keys when spending the funding output
    /// with `tx`
    pub fn funding_sighash(&self, tx: &Transaction) -> Result<Message, Error> {
        let sighash = SighashCache::new(tx)
            .segwit_signature_hash(
                0,
                self.funding_script().as_inner(),
                self.capacity,
                EcdsaSighashType::All,
            )
            .map_err(|err| Error::Sighash(err.to_string()))?;
        Message::from_slice(&sighash[..])
            .map_err(|err| Error::Sighash(err.to_string()))
    }

    /// Signs the counterparty commitment for the current state
    pub fn sign_state(
        &self,
        fund_key: &SecretKey,
        elk_snd: &ElkremSender,
    ) -> Result<Signature, Error> {
        let tx = self.build_state_tx(elk_snd, false)?;
        Ok(SECP256K1.sign_ecdsa(&self.funding_sighash(&tx)?, fund_key))
    }

    /// Verifies the counterparty signature over our commitment for the
    /// current state
    pub fn verify_sig(
        &self,
        elk_snd: &ElkremSender,
        sig: &Signature,
    ) -> Result<(), Error> {
        let tx = self.build_state_tx(elk_snd, true)?;
        let msg = self.funding_sighash(&tx)?;
        let mut sig = *sig;
        sig.normalize_s();
        SECP256K1
            .verify_ecdsa(&msg, &sig, &self.their_pub)
            .map_err(|_| Error::InvalidSignature(self.state.state_idx))
    }

    /// Witness spending the funding output with both signatures
    pub fn funding_witness(
        &self,
        my_sig: &Signature,
        their_sig: &Signature,
    ) -> Witness {
        let mut my_sig = my_sig.serialize_der().to_vec();
        my_sig.push(EcdsaSighashType::All as u8);
        let mut their_sig = their_sig.serialize_der().to_vec();
        their_sig.push(EcdsaSighashType::All as u8);
        let sigs = if self.my_pub.serialize() < self.their_pub.serialize() {
            [my_sig, their_sig]
        } else {
            [their_sig, my_sig]
        };
        let [first, second] = sigs;
        Witness::from_vec(vec![
            vec![],
            first,
            second,
            self.funding_script().into_inner().into_bytes(),
        ])
    }
}
