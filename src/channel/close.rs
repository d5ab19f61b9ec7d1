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
//! Cooperative close and unilateral break.

use bitcoin::Transaction;
use secp256k1::ecdsa::Signature;
use secp256k1::SECP256K1;
use tracing::debug;

use super::commitment;
use super::state::Channel;
use super::Error;
use crate::keygen::ChannelKeys;
use crate::wire::CloseReq;

/// Fully signed transaction closing the channel together with the updated
/// channel record
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct CloseSigned {
    pub channel: Channel,
    pub tx: Transaction,
}

impl Channel {
    fn ensure_closable(&self) -> Result<(), Error> {
        if self.close_data.closed {
            return Err(Error::ChannelClosed(self.outpoint));
        }
        if self.state.is_busy() {
            return Err(Error::ChannelBusy {
                channel: self.outpoint,
                phase: self.state.phase,
            });
        }
        if !self.htlcs_cleared() {
            return Err(Error::UnclearedHtlcs(self.outpoint));
        }
        Ok(())
    }

    /// Signs the cooperative close transaction and marks the channel closed
    /// at `height`. The counterparty completes and broadcasts it.
    pub fn close_request(
        &self,
        keys: &ChannelKeys,
        height: u32,
    ) -> Result<(Channel, CloseReq), Error> {
        self.ensure_closable()?;
        let tx = self.simple_close_tx()?;
        let signature =
            SECP256K1.sign_ecdsa(&self.funding_sighash(&tx)?, &keys.fund);
        let mut channel = self.clone();
        channel.close_data.mark_closed(&tx, height);
        Ok((channel, CloseReq {
            outpoint: self.outpoint,
            signature,
        }))
    }

    /// Completes the cooperative close requested by the counterparty
    pub fn on_close_req(
        &self,
        msg: &CloseReq,
        keys: &ChannelKeys,
        height: u32,
    ) -> Result<CloseSigned, Error> {
        self.ensure_closable()?;
        let mut tx = self.simple_close_tx()?;
        let sighash = self.funding_sighash(&tx)?;
        let mut their_sig = msg.signature;
        their_sig.normalize_s();
        SECP256K1
            .verify_ecdsa(&sighash, &their_sig, &self.their_pub)
            .map_err(|_| {
                commitment::Error::InvalidSignature(self.state.state_idx)
            })?;
        let my_sig = SECP256K1.sign_ecdsa(&sighash, &keys.fund);
        tx.input[0].witness = self.funding_witness(&my_sig, &their_sig);

        let mut channel = self.clone();
        channel.close_data.mark_closed(&tx, height);
        debug!(channel = %self.outpoint, txid = %tx.txid(), "co-signed close");
        Ok(CloseSigned { channel, tx })
    }

    /// Our latest commitment signed by both parties, ready to be broadcast
    /// without counterparty cooperation
    pub fn break_tx(
        &self,
        keys: &ChannelKeys,
        height: u32,
    ) -> Result<CloseSigned, Error> {
        if self.close_data.closed {
            return Err(Error::ChannelClosed(self.outpoint));
        }
        let their_sig: Signature =
            self.state.sig.ok_or(Error::NoSignature(self.outpoint))?;
        // during a round the ledger already matches the latest signed state
        let view =
            self.settled_view(self.state.state_idx, self.state.elk_point);
        let mut tx = view.build_state_tx(&keys.elk_snd, true)?;
        let my_sig = SECP256K1.sign_ecdsa(&view.funding_sighash(&tx)?, &keys.fund);
        tx.input[0].witness = self.funding_witness(&my_sig, &their_sig);

        let mut channel = self.clone();
        channel.close_data.mark_closed(&tx, height);
        Ok(CloseSigned { channel, tx })
    }
}
