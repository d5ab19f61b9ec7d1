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
//! Channel record, its ledger and the in-flight update bookkeeping.
//!
//! All mutations happen on a copy of [`Channel`]: a transition clones the
//! record, applies and validates the update and hands the copy back to the
//! caller, which persists it before replacing the stored one.

use bitcoin::hashes::sha256d;
use bitcoin::{OutPoint, Transaction, Txid};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

use super::{Error, PolicyError};
use crate::elkrem::ElkremReceiver;
use crate::hakd;
use crate::keygen::KeyGen;

/// Phase of the push/pull protocol, as seen by the local party
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Phase {
    /// No update in flight
    #[display("rest")]
    Rest,

    /// We sent a proposal and wait for `SigRev` or a colliding proposal
    #[display("pushed")]
    Pushed,

    /// We accepted a proposal, replied with `SigRev` and wait for `Rev`
    #[display("pulled")]
    Pulled,

    /// Both sides proposed at once; we replied with `GapSigRev` and wait
    /// for the counterparty's `GapSigRev`
    #[display("collided")]
    Collided,

    /// Collision resolved on our side; waiting for the final `Rev`
    #[display("gap-revoked")]
    GapRevoked,
}

/// A single change of the channel ledger carried by one protocol round
#[derive(Clone, PartialEq, Eq, Hash, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub enum Update {
    /// Moves `amount` from the proposer to the counterparty
    #[display("push({amount})")]
    Push { amount: u64 },

    /// Locks `amount` of the proposer into a new HTLC
    #[display("offer({amount}, {locktime})")]
    Offer {
        amount: u64,
        rhash: [u8; 32],
        locktime: u32,
        data: [u8; 32],
    },

    /// Settles HTLC `idx`, with its preimage or, when `preimage` is
    /// `None`, by timeout
    #[display("clear({idx})")]
    Clear {
        idx: u32,
        preimage: Option<[u8; 16]>,
        data: [u8; 32],
    },
}

impl Update {
    #[inline]
    pub fn is_offer(&self) -> bool {
        matches!(self, Update::Offer { .. })
    }
}

/// Hashed time-locked payment
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    serde_as,
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Htlc {
    /// Position in [`State::htlcs`], agreed by both parties
    pub idx: u32,
    /// Offered by the counterparty
    pub incoming: bool,
    pub amount: u64,
    /// SHA-256 of the preimage
    #[cfg_attr(feature = "serde", serde_as(as = "serde_with::hex::Hex"))]
    pub rhash: [u8; 32],
    /// Absolute block height after which the offerer may take the funds
    /// back
    pub locktime: u32,
    /// Opaque routing data supplied by the offerer
    #[cfg_attr(feature = "serde", serde_as(as = "serde_with::hex::Hex"))]
    pub data: [u8; 32],
    #[cfg_attr(
        feature = "serde",
        serde_as(as = "Option<serde_with::hex::Hex>")
    )]
    pub preimage: Option<[u8; 16]>,
    /// Settlement is included in a state which is not yet revoked
    pub clearing: bool,
    pub cleared: bool,
    pub cleared_on_chain: bool,
    /// Settled by timeout rather than preimage
    pub failed: bool,
}

impl Htlc {
    /// HTLC takes an output in the current commitments
    #[inline]
    pub fn is_active(&self) -> bool {
        !self.clearing && !self.cleared
    }
}

/// Mutable ledger of a channel
#[derive(Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct State {
    pub state_idx: u64,

    /// Our balance, before the per-output fee is taken
    pub my_amt: u64,

    pub phase: Phase,

    /// Update we proposed; not yet applied to the ledger
    pub outgoing: Option<Update>,

    /// Update proposed by the counterparty; already applied to the ledger
    pub incoming: Option<Update>,

    /// Counterparty elkrem point for its latest unrevoked state
    pub elk_point: PublicKey,
    pub next_elk_point: PublicKey,
    pub n2_elk_point: PublicKey,

    /// Counterparty signature over our commitment at `state_idx`
    pub sig: Option<Signature>,

    pub htlcs: Vec<Htlc>,
}

impl State {
    /// Signed amount in flight: negative while pushing, positive while
    /// pulling, zero otherwise
    pub fn delta(&self) -> i64 {
        match (self.phase, &self.outgoing, &self.incoming) {
            (
                Phase::Pushed | Phase::Collided,
                Some(Update::Push { amount }),
                _,
            ) => -(*amount as i64),
            (
                Phase::Pulled | Phase::GapRevoked,
                _,
                Some(Update::Push { amount }),
            ) => *amount as i64,
            _ => 0,
        }
    }

    /// Amount of the counterparty push which collided with ours
    pub fn collision(&self) -> i64 {
        match (self.phase, &self.incoming) {
            (Phase::Collided, Some(Update::Push { amount })) => {
                *amount as i64
            }
            _ => 0,
        }
    }

    /// HTLC offer which is being negotiated
    pub fn in_prog_htlc(&self) -> Option<&Update> {
        match self.phase {
            Phase::Pushed | Phase::Collided => self.outgoing.as_ref(),
            Phase::Pulled | Phase::GapRevoked => self.incoming.as_ref(),
            Phase::Rest => None,
        }
        .filter(|update| update.is_offer())
    }

    /// Counterparty HTLC offer which collided with our update
    pub fn colliding_htlc(&self) -> Option<&Update> {
        match self.phase {
            Phase::Collided => {
                self.incoming.as_ref().filter(|update| update.is_offer())
            }
            _ => None,
        }
    }

    /// Both parties offered an HTLC in the same collided round
    pub fn offers_collided(&self) -> bool {
        self.in_prog_htlc().is_some() && self.colliding_htlc().is_some()
    }

    /// No new update may be started
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.phase != Phase::Rest
    }

    pub fn active_htlcs(&self) -> impl Iterator<Item = &Htlc> {
        self.htlcs.iter().filter(|htlc| htlc.is_active())
    }

    /// Sum of amounts locked in active HTLCs
    pub fn htlc_total(&self) -> u64 {
        self.active_htlcs().map(|htlc| htlc.amount).sum()
    }
}

/// Record of the transaction which closed the channel. Written once: the
/// first observer wins.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct CloseData {
    pub close_txid: Option<Txid>,
    /// Outputs of the closing transaction are swept from this copy
    pub close_tx: Option<Transaction>,
    pub close_height: u32,
    pub closed: bool,
}

impl CloseData {
    /// Records the closing transaction unless some other close was seen
    /// earlier; returns whether the record was written
    pub fn mark_closed(&mut self, tx: &Transaction, height: u32) -> bool {
        if self.closed {
            return false;
        }
        self.close_txid = Some(tx.txid());
        self.close_tx = Some(tx.clone());
        self.close_height = height;
        self.closed = true;
        true
    }
}

/// Persistent channel record
#[derive(Getters, Clone, PartialEq, Eq, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Channel {
    /// Funding outpoint, the channel identifier
    #[getter(as_copy)]
    pub(crate) outpoint: OutPoint,

    #[getter(as_copy)]
    pub(crate) capacity: u64,

    /// CSV delay of the revocable outputs
    #[getter(as_copy)]
    pub(crate) delay: u16,

    /// Flat fee deducted from each balance output
    #[getter(as_copy)]
    pub(crate) fee: u64,

    /// Dust floor of every channel transaction output
    #[getter(as_copy)]
    pub(crate) min_output: u64,

    /// Path of the funding key; the other channel keys differ only by role
    #[getter(as_copy)]
    pub(crate) key_gen: KeyGen,

    /// We funded the channel
    #[getter(as_copy)]
    pub(crate) funder: bool,

    #[getter(as_copy)]
    pub(crate) my_pub: PublicKey,
    #[getter(as_copy)]
    pub(crate) my_refund_pub: PublicKey,
    #[getter(as_copy)]
    pub(crate) my_hakd_base: PublicKey,

    #[getter(as_copy)]
    pub(crate) their_pub: PublicKey,
    #[getter(as_copy)]
    pub(crate) their_refund_pub: PublicKey,
    #[getter(as_copy)]
    pub(crate) their_hakd_base: PublicKey,

    /// Revocation hashes received from the counterparty
    pub(crate) elk_rcv: ElkremReceiver,

    pub(crate) close_data: CloseData,

    pub(crate) state: State,

    /// A counterparty message failed cryptographic verification. The
    /// channel refuses further updates and must be closed.
    #[getter(as_copy)]
    pub(crate) compromised: bool,
}

/// Summary of a channel returned to the API consumer
#[derive(Clone, PartialEq, Eq, Debug, Display)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
#[display("{outpoint}: {my_amt}/{capacity} at #{state_idx} ({phase})")]
pub struct ChannelInfo {
    pub outpoint: OutPoint,
    pub peer_idx: u32,
    pub chan_idx: u32,
    pub capacity: u64,
    pub my_amt: u64,
    pub their_amt: u64,
    pub htlc_count: usize,
    pub state_idx: u64,
    pub phase: Phase,
    pub closed: bool,
    pub compromised: bool,
}

impl Channel {
    /// Counterparty balance; whatever is neither ours nor locked in HTLCs
    pub fn their_amt(&self) -> u64 {
        self.capacity
            .saturating_sub(self.state.my_amt)
            .saturating_sub(self.state.htlc_total())
    }

    /// Pushes and offers must leave both balances at or above the dust
    /// floor plus the fee
    pub(crate) fn check_floor(&self) -> Result<(), Error> {
        let floor = self.min_output + self.fee;
        for balance in [self.state.my_amt, self.their_amt()] {
            if balance < floor {
                return Err(PolicyError::BalanceBelowFloor { balance, floor }.into());
            }
        }
        Ok(())
    }

    /// Settling an HTLC may leave a balance empty, but never below the
    /// floor
    pub(crate) fn check_settled_floor(&self) -> Result<(), Error> {
        let floor = self.min_output + self.fee;
        for balance in [self.state.my_amt, self.their_amt()] {
            if balance != 0 && balance < floor {
                return Err(PolicyError::BalanceBelowFloor { balance, floor }.into());
            }
        }
        Ok(())
    }

    #[inline]
    pub fn is_closed(&self) -> bool {
        self.close_data.closed
    }

    pub fn info(&self) -> ChannelInfo {
        ChannelInfo {
            outpoint: self.outpoint,
            peer_idx: self.key_gen.peer_idx(),
            chan_idx: self.key_gen.chan_idx(),
            capacity: self.capacity,
            my_amt: self.state.my_amt,
            their_amt: self.their_amt(),
            htlc_count: self.state.active_htlcs().count(),
            state_idx: self.state.state_idx,
            phase: self.state.phase,
            closed: self.close_data.closed,
            compromised: self.compromised,
        }
    }

    /// Applies `update` to the ledger. `incoming` tells whether the
    /// counterparty proposed it. Fails, leaving the ledger in an
    /// unspecified state, if any balance would go negative; callers work
    /// on a copy.
    pub(crate) fn apply_update(
        &mut self,
        update: &Update,
        incoming: bool,
    ) -> Result<(), Error> {
        let their_amt = self.their_amt();
        match *update {
            Update::Push { amount } if incoming => {
                debit(their_amt, amount)?;
                self.state.my_amt += amount;
            }
            Update::Push { amount } => {
                self.state.my_amt = debit(self.state.my_amt, amount)?;
            }
            Update::Offer {
                amount,
                rhash,
                locktime,
                data,
            } => {
                if incoming {
                    debit(their_amt, amount)?;
                } else {
                    self.state.my_amt = debit(self.state.my_amt, amount)?;
                }
                let idx = self.state.htlcs.len() as u32;
                self.state.htlcs.push(Htlc {
                    idx,
                    incoming,
                    amount,
                    rhash,
                    locktime,
                    data,
                    preimage: None,
                    clearing: false,
                    cleared: false,
                    cleared_on_chain: false,
                    failed: false,
                });
            }
            Update::Clear { idx, preimage, .. } => {
                let outpoint = self.outpoint;
                let htlc = self
                    .state
                    .htlcs
                    .get_mut(idx as usize)
                    .ok_or(Error::UnknownHtlc {
                        channel: outpoint,
                        idx,
                    })?;
                if !htlc.is_active() {
                    return Err(Error::HtlcCleared(idx));
                }
                htlc.clearing = true;
                htlc.preimage = preimage;
                htlc.failed = preimage.is_none();
                let to_me = (htlc.incoming && preimage.is_some())
                    || (!htlc.incoming && preimage.is_none());
                if to_me {
                    self.state.my_amt += htlc.amount;
                }
            }
        }
        Ok(())
    }

    /// When both parties offered an HTLC in the same collided round, the
    /// offer of the party whose HAKD base sorts first takes the lower index
    /// on both sides
    pub(crate) fn canonicalize_offers(&mut self) {
        let n = self.state.htlcs.len();
        if n < 2 {
            return;
        }
        let (theirs, mine) = (&self.state.htlcs[n - 2], &self.state.htlcs[n - 1]);
        if !theirs.incoming || mine.incoming {
            return;
        }
        if self.my_hakd_base.serialize() < self.their_hakd_base.serialize() {
            self.state.htlcs.swap(n - 2, n - 1);
            self.state.htlcs[n - 2].idx = (n - 2) as u32;
            self.state.htlcs[n - 1].idx = (n - 1) as u32;
        }
    }

    /// Applies our outgoing update on top of the ledger which already has
    /// the colliding incoming one; `offers_collided` tells whether both are
    /// HTLC offers
    pub(crate) fn apply_collided(
        &mut self,
        outgoing: &Update,
        offers_collided: bool,
    ) -> Result<(), Error> {
        self.apply_update(outgoing, false)?;
        if offers_collided {
            self.canonicalize_offers();
        }
        Ok(())
    }

    /// Marks HTLCs settled by the last round as cleared
    pub(crate) fn finalize_clears(&mut self) {
        for htlc in self.state.htlcs.iter_mut().filter(|htlc| htlc.clearing) {
            htlc.clearing = false;
            htlc.cleared = true;
        }
    }

    /// Ingests the counterparty revocation hash for its oldest unrevoked
    /// state and shifts the elkrem point pipeline. The hash must both fit
    /// the elkrem tree and reproduce the point it promised earlier.
    pub(crate) fn advance_elkrem(
        &mut self,
        elk: sha256d::Hash,
        n2_elk_point: PublicKey,
    ) -> Result<(), Error> {
        if hakd::elk_point(elk)? != self.state.elk_point {
            return Err(Error::ElkPointMismatch {
                channel: self.outpoint,
                index: self.elk_rcv.next_index(),
            });
        }
        let mut elk_rcv = self.elk_rcv.clone();
        elk_rcv.add_next(elk)?;
        self.elk_rcv = elk_rcv;
        self.state.elk_point = self.state.next_elk_point;
        self.state.next_elk_point = self.state.n2_elk_point;
        self.state.n2_elk_point = n2_elk_point;
        Ok(())
    }

    /// Copy of the channel at rest at state `idx` with the counterparty
    /// elkrem point `their_point`; commitments are always built from such
    /// settled views
    pub(crate) fn settled_view(
        &self,
        idx: u64,
        their_point: PublicKey,
    ) -> Channel {
        let mut view = self.clone();
        view.state.state_idx = idx;
        view.state.elk_point = their_point;
        view.state.phase = Phase::Rest;
        view.state.outgoing = None;
        view.state.incoming = None;
        view
    }
}

fn debit(balance: u64, amount: u64) -> Result<u64, Error> {
    balance
        .checked_sub(amount)
        .ok_or(Error::InsufficientFunds {
            available: balance,
            required: amount,
        })
}
