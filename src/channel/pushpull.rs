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
//! Push/pull update protocol.
//!
//! A round moves the channel from state `n` to `n + 1`:
//!
//! ```text
//!   pusher                               puller
//!   Rest ── DeltaSig/HashSig/PreimageSig ─▶ Rest
//!   Pushed                                 Pulled
//!   Pushed ◀──────────── SigRev ────────── Pulled
//!   Rest   ───────────── Rev ─────────────▶ Rest
//! ```
//!
//! When both parties propose at once, each one receives a proposal while in
//! `Pushed` phase and answers with `GapSigRev`, signing state `n + 2` which
//! includes both updates. Both sides then exchange `Rev` for state `n + 1`
//! and end at rest at `n + 2`.
//!
//! Every transition works on a copy of the channel and returns it together
//! with the reply; nothing is changed when a transition fails. Replies are
//! deterministic functions of the channel record, so they can be re-sent at
//! any time.

use secp256k1::ecdsa::Signature;
use tracing::debug;

use super::commitment::my_elk_point;
use super::state::{Channel, Phase, Update};
use super::{Error, Policy};
use crate::keygen::ChannelKeys;
use crate::wire::{
    DeltaSig, GapSigRev, HashSig, Messages, PreimageSig, Rev, SigRev,
};

/// Outcome of a local request or of a peer message
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Transition {
    /// New channel record; it must be persisted before the reply is sent
    pub channel: Channel,

    /// Message for the counterparty
    pub reply: Option<Messages>,

    /// The channel came back to rest, completing the round
    pub settled: bool,
}

impl Transition {
    fn unchanged(channel: &Channel, reply: Option<Messages>) -> Transition {
        Transition {
            channel: channel.clone(),
            reply,
            settled: false,
        }
    }
}

fn proposal_name(update: &Update) -> &'static str {
    match update {
        Update::Push { .. } => "DeltaSig",
        Update::Offer { .. } => "HashSig",
        Update::Clear { .. } => "PreimageSig",
    }
}

impl Channel {
    pub(super) fn unexpected(&self, message: &'static str) -> Error {
        Error::UnexpectedMessage {
            channel: self.outpoint,
            message,
            phase: self.state.phase,
            state_idx: self.state.state_idx,
        }
    }

    pub(super) fn ensure_usable(&self) -> Result<(), Error> {
        if self.close_data.closed {
            return Err(Error::ChannelClosed(self.outpoint));
        }
        if self.compromised {
            return Err(Error::ChannelCompromised(self.outpoint));
        }
        Ok(())
    }

    fn prev_idx(&self) -> Result<u64, Error> {
        self.state
            .state_idx
            .checked_sub(1)
            .ok_or(Error::NothingToResend(self.outpoint))
    }

    fn collided_updates(&self) -> Result<(&Update, &Update), Error> {
        match (&self.state.outgoing, &self.state.incoming) {
            (Some(outgoing), Some(incoming)) => Ok((outgoing, incoming)),
            _ => Err(self.unexpected("GapSigRev")),
        }
    }

    /// Balance floor of the ledger with `update` applied
    fn check_update_floor(&self, update: &Update) -> Result<(), Error> {
        match update {
            Update::Clear { .. } => self.check_settled_floor(),
            Update::Push { .. } | Update::Offer { .. } => self.check_floor(),
        }
    }

    fn proposal(&self, update: &Update, signature: Signature) -> Messages {
        let outpoint = self.outpoint;
        match *update {
            Update::Push { amount } => DeltaSig {
                outpoint,
                delta: amount as u32,
                signature,
            }
            .into(),
            Update::Offer {
                amount,
                rhash,
                locktime,
                data,
            } => HashSig {
                outpoint,
                amount: amount as u32,
                locktime,
                rhash,
                signature,
                data,
            }
            .into(),
            Update::Clear {
                idx,
                preimage,
                data,
            } => PreimageSig {
                outpoint,
                idx,
                preimage: preimage.unwrap_or_default(),
                signature,
                data,
            }
            .into(),
        }
    }

    /// Signature over the counterparty commitment at `n + 1` with our
    /// outgoing update applied
    fn sign_proposal(
        &self,
        update: &Update,
        keys: &ChannelKeys,
    ) -> Result<Signature, Error> {
        let mut view = self.settled_view(
            self.state.state_idx + 1,
            self.state.next_elk_point,
        );
        view.apply_update(update, false)?;
        view.check_update_floor(update)?;
        Ok(view.sign_state(&keys.fund, &keys.elk_snd)?)
    }

    fn sig_rev(&self, keys: &ChannelKeys) -> Result<Messages, Error> {
        let idx = self.state.state_idx;
        let view = self.settled_view(idx, self.state.next_elk_point);
        Ok(SigRev {
            outpoint: self.outpoint,
            signature: view.sign_state(&keys.fund, &keys.elk_snd)?,
            elk: keys.elk_snd.at_index(self.prev_idx()?)?,
            n2_elk_point: my_elk_point(&keys.elk_snd, idx + 2)?,
        }
        .into())
    }

    fn gap_sig_rev(&self, keys: &ChannelKeys) -> Result<Messages, Error> {
        let (outgoing, _) = self.collided_updates()?;
        let idx = self.state.state_idx;
        let mut view = self.settled_view(idx + 1, self.state.n2_elk_point);
        view.apply_collided(outgoing, self.state.offers_collided())?;
        Ok(GapSigRev {
            outpoint: self.outpoint,
            signature: view.sign_state(&keys.fund, &keys.elk_snd)?,
            elk: keys.elk_snd.at_index(self.prev_idx()?)?,
            n2_elk_point: my_elk_point(&keys.elk_snd, idx + 2)?,
        }
        .into())
    }

    /// Revocation of our state preceding the current one
    fn rev(&self, keys: &ChannelKeys) -> Result<Messages, Error> {
        Ok(Rev {
            outpoint: self.outpoint,
            elk: keys.elk_snd.at_index(self.prev_idx()?)?,
            n2_elk_point: my_elk_point(
                &keys.elk_snd,
                self.state.state_idx + 2,
            )?,
        }
        .into())
    }

    /// The last message we sent in the current phase
    pub fn resend(&self, keys: &ChannelKeys) -> Result<Messages, Error> {
        match (self.state.phase, &self.state.outgoing) {
            (Phase::Pushed, Some(update)) => {
                let signature = self.sign_proposal(update, keys)?;
                Ok(self.proposal(update, signature))
            }
            (Phase::Pushed, None) => Err(self.unexpected("resend")),
            (Phase::Pulled, _) => self.sig_rev(keys),
            (Phase::Collided, _) => self.gap_sig_rev(keys),
            (Phase::GapRevoked | Phase::Rest, _) => self.rev(keys),
        }
    }

    /// Starts a round proposing `update`
    pub fn start_update(
        &self,
        update: Update,
        keys: &ChannelKeys,
        policy: &Policy,
        height: u32,
    ) -> Result<Transition, Error> {
        self.ensure_usable()?;
        if self.state.is_busy() {
            return Err(Error::ChannelBusy {
                channel: self.outpoint,
                phase: self.state.phase,
            });
        }
        self.validate_update(&update, false, policy, height)?;
        let signature = self.sign_proposal(&update, keys)?;
        let reply = self.proposal(&update, signature);

        let mut channel = self.clone();
        channel.state.outgoing = Some(update);
        channel.state.phase = Phase::Pushed;
        debug!(
            channel = %self.outpoint,
            state_idx = self.state.state_idx,
            "proposing {}", reply
        );
        Ok(Transition {
            channel,
            reply: Some(reply),
            settled: false,
        })
    }

    /// Drops our pending proposal once a colliding counterparty proposal was
    /// rejected. Both sides of a symmetric conflict, such as two clears of
    /// the same HTLC, withdraw and come back to rest at the current state.
    pub fn withdraw(&self) -> Result<Channel, Error> {
        self.ensure_usable()?;
        match (self.state.phase, &self.state.outgoing) {
            (Phase::Pushed, Some(update)) => {
                debug!(
                    channel = %self.outpoint,
                    state_idx = self.state.state_idx,
                    "withdrawing {}", update
                );
                let mut channel = self.clone();
                channel.state.outgoing = None;
                channel.state.phase = Phase::Rest;
                Ok(channel)
            }
            _ => Err(Error::NothingToWithdraw {
                channel: self.outpoint,
                phase: self.state.phase,
            }),
        }
    }

    /// Processes a counterparty proposal. At rest we accept it and answer
    /// with `SigRev`; while our own proposal is pending the two collide and
    /// we answer with `GapSigRev`.
    pub fn on_proposal(
        &self,
        update: Update,
        signature: Signature,
        keys: &ChannelKeys,
        policy: &Policy,
        height: u32,
    ) -> Result<Transition, Error> {
        self.ensure_usable()?;
        match (self.state.phase, &self.state.incoming) {
            (Phase::Rest | Phase::Pushed, _) => {}
            (Phase::Pulled | Phase::Collided, Some(pending))
                if *pending == update =>
            {
                return Ok(Transition::unchanged(self, Some(self.resend(keys)?)))
            }
            (Phase::Pulled | Phase::Collided, Some(pending)) => {
                return Err(Error::UpdateMismatch {
                    pending: pending.clone(),
                    received: update,
                })
            }
            _ => return Err(self.unexpected(proposal_name(&update))),
        }
        if let (
            Some(Update::Clear { idx: ours, .. }),
            Update::Clear { idx: theirs, .. },
        ) = (&self.state.outgoing, &update)
        {
            if ours == theirs {
                return Err(Error::ConflictingClear(*theirs));
            }
        }
        self.validate_update(&update, true, policy, height)?;

        let mut channel =
            self.settled_view(self.state.state_idx + 1, self.state.elk_point);
        channel.apply_update(&update, true)?;
        channel.check_update_floor(&update)?;
        channel.verify_sig(&keys.elk_snd, &signature)?;
        channel.state.sig = Some(signature);
        channel.state.incoming = Some(update);

        let reply = match &self.state.outgoing {
            Some(outgoing) => {
                channel.state.outgoing = Some(outgoing.clone());
                channel.state.phase = Phase::Collided;
                channel.gap_sig_rev(keys)?
            }
            None => {
                channel.state.phase = Phase::Pulled;
                channel.sig_rev(keys)?
            }
        };
        debug!(
            channel = %self.outpoint,
            state_idx = channel.state.state_idx,
            phase = %channel.state.phase,
            "accepted proposal, replying {}", reply
        );
        Ok(Transition {
            channel,
            reply: Some(reply),
            settled: false,
        })
    }

    /// Completes our round: the counterparty signed our next commitment
    /// and revoked its previous one
    pub fn on_sig_rev(
        &self,
        msg: &SigRev,
        keys: &ChannelKeys,
    ) -> Result<Transition, Error> {
        self.ensure_usable()?;
        match (self.state.phase, &self.state.outgoing) {
            (Phase::Pushed, Some(outgoing)) => {
                let mut channel = self.settled_view(
                    self.state.state_idx + 1,
                    self.state.elk_point,
                );
                channel.apply_update(outgoing, false)?;
                channel.verify_sig(&keys.elk_snd, &msg.signature)?;
                channel.advance_elkrem(msg.elk, msg.n2_elk_point)?;
                channel.state.sig = Some(msg.signature);
                channel.finalize_clears();
                let reply = channel.rev(keys)?;
                debug!(
                    channel = %self.outpoint,
                    state_idx = channel.state.state_idx,
                    "round completed"
                );
                Ok(Transition {
                    channel,
                    reply: Some(reply),
                    settled: true,
                })
            }
            // our Rev was lost
            (Phase::Rest, _) if self.state.state_idx > 0 => {
                Ok(Transition::unchanged(self, Some(self.rev(keys)?)))
            }
            _ => Err(self.unexpected("SigRev")),
        }
    }

    /// Second half of a collision: the counterparty signed state `n + 2`
    /// with both updates and revoked its state preceding the collision
    pub fn on_gap_sig_rev(
        &self,
        msg: &GapSigRev,
        keys: &ChannelKeys,
    ) -> Result<Transition, Error> {
        self.ensure_usable()?;
        match self.state.phase {
            Phase::Collided => {
                let (outgoing, incoming) = self.collided_updates()?;
                let mut channel = self.settled_view(
                    self.state.state_idx + 1,
                    self.state.elk_point,
                );
                channel.apply_collided(outgoing, self.state.offers_collided())?;
                channel.verify_sig(&keys.elk_snd, &msg.signature)?;
                channel.advance_elkrem(msg.elk, msg.n2_elk_point)?;
                channel.state.sig = Some(msg.signature);
                channel.state.incoming = Some(incoming.clone());
                channel.state.phase = Phase::GapRevoked;
                let reply = channel.rev(keys)?;
                debug!(
                    channel = %self.outpoint,
                    state_idx = channel.state.state_idx,
                    "collision resolved"
                );
                Ok(Transition {
                    channel,
                    reply: Some(reply),
                    settled: false,
                })
            }
            Phase::GapRevoked | Phase::Rest if self.state.state_idx > 0 => {
                Ok(Transition::unchanged(self, Some(self.rev(keys)?)))
            }
            _ => Err(self.unexpected("GapSigRev")),
        }
    }

    /// Final revocation of a round
    pub fn on_rev(&self, msg: &Rev) -> Result<Transition, Error> {
        self.ensure_usable()?;
        match self.state.phase {
            Phase::Pulled | Phase::GapRevoked => {
                let mut channel = self.clone();
                channel.advance_elkrem(msg.elk, msg.n2_elk_point)?;
                channel.state.incoming = None;
                channel.state.outgoing = None;
                channel.state.phase = Phase::Rest;
                channel.finalize_clears();
                debug!(
                    channel = %self.outpoint,
                    state_idx = channel.state.state_idx,
                    "round completed"
                );
                Ok(Transition {
                    channel,
                    reply: None,
                    settled: true,
                })
            }
            // re-sent revocation we already hold
            Phase::Rest | Phase::Pushed
                if !self.elk_rcv.is_empty()
                    && self.elk_rcv.at_index(self.elk_rcv.up_to())
                        == Ok(msg.elk) =>
            {
                Ok(Transition::unchanged(self, None))
            }
            _ => Err(self.unexpected("Rev")),
        }
    }

    /// Dispatches a peer message belonging to this channel to the protocol
    /// handler
    pub fn on_message(
        &self,
        msg: &Messages,
        keys: &ChannelKeys,
        policy: &Policy,
        height: u32,
    ) -> Result<Transition, Error> {
        match msg {
            Messages::DeltaSig(msg) => self.on_proposal(
                Update::Push {
                    amount: msg.delta as u64,
                },
                msg.signature,
                keys,
                policy,
                height,
            ),
            Messages::HashSig(msg) => self.on_proposal(
                Update::Offer {
                    amount: msg.amount as u64,
                    rhash: msg.rhash,
                    locktime: msg.locktime,
                    data: msg.data,
                },
                msg.signature,
                keys,
                policy,
                height,
            ),
            Messages::PreimageSig(msg) => self.on_proposal(
                Update::Clear {
                    idx: msg.idx,
                    preimage: Some(msg.preimage)
                        .filter(|preimage| *preimage != [0u8; 16]),
                    data: msg.data,
                },
                msg.signature,
                keys,
                policy,
                height,
            ),
            Messages::SigRev(msg) => self.on_sig_rev(msg, keys),
            Messages::GapSigRev(msg) => self.on_gap_sig_rev(msg, keys),
            Messages::Rev(msg) => self.on_rev(msg),
            Messages::PointReq(_) => Err(self.unexpected("PointReq")),
            Messages::PointResp(_) => Err(self.unexpected("PointResp")),
            Messages::ChanDesc(_) => Err(self.unexpected("ChanDesc")),
            Messages::ChanAck(_) => Err(self.unexpected("ChanAck")),
            Messages::SigProof(_) => Err(self.unexpected("SigProof")),
            Messages::CloseReq(_) => Err(self.unexpected("CloseReq")),
        }
    }
}
