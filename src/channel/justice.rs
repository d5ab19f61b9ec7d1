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
//! Justice transactions sweeping the revocable output of a revoked
//! counterparty commitment.

use bitcoin::{Sequence, Transaction};
use secp256k1::{PublicKey, SECP256K1};

use super::commitment::{get_state_idx_from_tx, CommitmentKeys};
use super::scripts::{ScriptGenerators, WitnessScript};
use super::state::Channel;
use super::sweep::SweptOutput;
use super::{Error, Policy};
use crate::hakd;
use crate::keygen::ChannelKeys;

impl Channel {
    /// Keys of the counterparty commitment at a revoked state `idx`
    pub fn revoked_keys(&self, idx: u64) -> Result<CommitmentKeys, Error> {
        if self.elk_rcv.is_empty() || idx > self.elk_rcv.up_to() {
            return Err(Error::NotRevoked {
                channel: self.outpoint,
                state_idx: idx,
                up_to: self.elk_rcv.up_to(),
            });
        }
        let point = hakd::elk_point(self.elk_rcv.at_index(idx)?)?;
        Ok(self.commitment_keys_with(false, point)?)
    }

    /// Builds a signed transaction spending the whole revocable output of
    /// `tx`, a revoked counterparty commitment, to our watch-refund key
    pub fn build_justice(
        &self,
        tx: &Transaction,
        keys: &ChannelKeys,
        policy: &Policy,
    ) -> Result<Transaction, Error> {
        let txid = tx.txid();
        let idx = get_state_idx_from_tx(tx, self.chan_hint(false));
        let commitment_keys = self.revoked_keys(idx)?;
        let script = WitnessScript::ln_commit(
            commitment_keys.revocation,
            commitment_keys.timeout,
            self.delay,
        );
        let output = SweptOutput::find(tx, script)
            .ok_or(Error::RevocableOutputNotFound(txid))?;
        let mut justice = output.sweep_tx(
            policy.justice_fee,
            self.min_output,
            PublicKey::from_secret_key(SECP256K1, &keys.watch_refund),
            Sequence(1),
        )?;

        let elk = self.elk_rcv.at_index(idx)?;
        let seckey = hakd::combine_privkeys(&[keys.hakd, hakd::elk_scalar(elk)?])?;
        // non-empty element selects the revocation branch
        output.sign(&mut justice, &seckey, vec![0x01])?;
        Ok(justice)
    }
}
