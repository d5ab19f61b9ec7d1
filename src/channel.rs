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
//! Payment channel: data model, commitment construction and the push/pull
//! update protocol together with HTLCs, justice, opening and closing.

mod close;
mod commitment;
pub(crate) mod fund;
mod htlc;
mod justice;
pub mod lex_order;
mod policy;
mod pushpull;
pub mod scripts;
mod state;
mod sweep;

use bitcoin::{OutPoint, Txid};

pub use close::CloseSigned;
pub use commitment::{
    get_state_idx_from_tx, my_elk_point, set_state_idx_bits, CommitmentKeys,
    STATE_IDX_LIMIT,
};
pub use fund::{point_resp, PendingOpen};
pub use htlc::payment_hash;
pub use policy::{
    Policy, PolicyError, DEFAULT_DELAY, DEFAULT_FEE, JUSTICE_FEE,
    MAX_CHAN_CAPACITY, MAX_SEND, MIN_CHAN_CAPACITY, MIN_OUTPUT, MIN_SEND,
};
pub use pushpull::Transition;
pub use state::{Channel, ChannelInfo, CloseData, Htlc, Phase, State, Update};
pub use sweep::HtlcClaim;

use crate::{elkrem, hakd, keygen};

/// Class of a channel error deciding how the caller reacts to it
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug, Display)]
pub enum ErrorKind {
    /// Malformed or invalid peer data; the message is dropped
    #[display("validation")]
    Validation,

    /// Message does not fit the channel phase; dropped, the peer may retry
    #[display("sequence")]
    Sequence,

    /// Cryptographic verification failure; the channel must be closed
    #[display("fatal")]
    Fatal,

    /// Local request can't be served in the current channel state
    #[display("precondition")]
    Precondition,

    /// Wallet, transport or storage failure
    #[display("io")]
    Io,
}

#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// malformed peer message: {0}
    #[from]
    Encoding(qchan_encoding::Error),

    /// key arithmetic failure: {0}
    #[from]
    Hakd(hakd::Error),

    /// channel {0} is unknown
    UnknownChannel(OutPoint),

    /// HTLC #{idx} does not exist in channel {channel}
    UnknownHtlc { channel: OutPoint, idx: u32 },

    /// preimage does not match the payment hash of HTLC #{0}
    PreimageMismatch(u32),

    /// HTLC #{idx} times out at height {locktime}, while the current height
    /// is {height}
    LocktimeNotReached { idx: u32, locktime: u32, height: u32 },

    /// HTLC #{0} can't be cleared in this direction: only the receiver
    /// claims with a preimage and only the offerer times out
    WrongClearDirection(u32),

    /// {message} is not expected by channel {channel} in {phase} phase at
    /// state {state_idx}
    UnexpectedMessage {
        channel: OutPoint,
        message: &'static str,
        phase: Phase,
        state_idx: u64,
    },

    /// counterparty repeats a proposal of {received} while {pending} is
    /// being negotiated
    UpdateMismatch { pending: Update, received: Update },

    /// both parties clear HTLC #{0} at the same time
    ConflictingClear(u32),

    /// commitment failure: {0}
    #[from]
    Commitment(commitment::Error),

    /// revocation hash doesn't fit the elkrem tree: {0}
    #[from]
    Elkrem(elkrem::Error),

    /// revocation hash #{index} of channel {channel} does not reproduce the
    /// elkrem point promised for it
    ElkPointMismatch { channel: OutPoint, index: u64 },

    /// policy violation: {0}
    #[from]
    Policy(PolicyError),

    /// key derivation failure: {0}
    #[from]
    KeyGen(keygen::Error),

    /// insufficient funds: {required} sat required, only {available} sat
    /// available
    InsufficientFunds { available: u64, required: u64 },

    /// channel {channel} is busy in {phase} phase
    ChannelBusy { channel: OutPoint, phase: Phase },

    /// channel {0} is closed
    ChannelClosed(OutPoint),

    /// channel {0} has failed verification of counterparty data and must be
    /// closed
    ChannelCompromised(OutPoint),

    /// channel {0} has uncleared HTLCs
    UnclearedHtlcs(OutPoint),

    /// HTLC #{0} is already cleared
    HtlcCleared(u32),

    /// channel {0} has no message to re-send
    NothingToResend(OutPoint),

    /// channel {0} holds no counterparty signature for its latest
    /// commitment
    NoSignature(OutPoint),

    /// state {state_idx} of channel {channel} is not revoked; revocation
    /// hashes are known up to #{up_to}
    NotRevoked {
        channel: OutPoint,
        state_idx: u64,
        up_to: u64,
    },

    /// transaction {0} has no revocable output of the expected state
    RevocableOutputNotFound(Txid),

    /// output of {value} sat can't pay the sweep fee of {fee} sat
    SweepUnprofitable { value: u64, fee: u64 },

    /// channel {channel} has no proposal to withdraw in {phase} phase
    NothingToWithdraw { channel: OutPoint, phase: Phase },

    /// channel {0} is open; its HTLCs are settled off-chain
    NotClosed(OutPoint),

    /// transaction {txid} has no output of HTLC #{idx}
    HtlcOutputNotFound { txid: Txid, idx: u32 },

    /// update of channel {0} was withdrawn after a conflicting counterparty
    /// proposal
    UpdateWithdrawn(OutPoint),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Encoding(_)
            | Error::Hakd(_)
            | Error::UnknownChannel(_)
            | Error::UnknownHtlc { .. }
            | Error::PreimageMismatch(_)
            | Error::LocktimeNotReached { .. }
            | Error::WrongClearDirection(_) => ErrorKind::Validation,

            Error::UnexpectedMessage { .. }
            | Error::UpdateMismatch { .. }
            | Error::ConflictingClear(_)
            | Error::UpdateWithdrawn(_) => ErrorKind::Sequence,

            Error::Commitment(commitment::Error::InvalidSignature(_))
            | Error::Elkrem(_)
            | Error::ElkPointMismatch { .. } => ErrorKind::Fatal,

            Error::Commitment(commitment::Error::UpdateInFlight(_)) => {
                ErrorKind::Sequence
            }
            Error::Commitment(
                commitment::Error::Hakd(_)
                | commitment::Error::Elkrem(_)
                | commitment::Error::Sighash(_),
            ) => ErrorKind::Validation,
            Error::Commitment(_) => ErrorKind::Precondition,

            Error::Policy(_)
            | Error::KeyGen(_)
            | Error::InsufficientFunds { .. }
            | Error::ChannelBusy { .. }
            | Error::ChannelClosed(_)
            | Error::ChannelCompromised(_)
            | Error::UnclearedHtlcs(_)
            | Error::HtlcCleared(_)
            | Error::NothingToResend(_)
            | Error::NoSignature(_)
            | Error::NotRevoked { .. }
            | Error::RevocableOutputNotFound(_)
            | Error::SweepUnprofitable { .. }
            | Error::NothingToWithdraw { .. }
            | Error::NotClosed(_)
            | Error::HtlcOutputNotFound { .. } => ErrorKind::Precondition,
        }
    }

    /// The channel can't be trusted anymore and must be closed
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.kind() == ErrorKind::Fatal
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_kinds() {
        assert_eq!(
            Error::Commitment(commitment::Error::InvalidSignature(4)).kind(),
            ErrorKind::Fatal
        );
        assert!(Error::ElkPointMismatch {
            channel: OutPoint::null(),
            index: 3
        }
        .is_fatal());
        assert_eq!(
            Error::Commitment(commitment::Error::Dust {
                amount: 1,
                minimum: 2
            })
            .kind(),
            ErrorKind::Precondition
        );
        assert_eq!(
            Error::from(qchan_encoding::Error::EmptyMessage).kind(),
            ErrorKind::Validation
        );
        assert_eq!(Error::ConflictingClear(1).kind(), ErrorKind::Sequence);
        assert_eq!(ErrorKind::Fatal.to_string(), "fatal");
    }
}
