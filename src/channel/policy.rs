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

/// Flat fee deducted from each commitment and close output
pub const DEFAULT_FEE: u64 = 5_000;

/// Smallest output value allowed in channel transactions
pub const MIN_OUTPUT: u64 = 100_000;

/// Smallest amount which can be pushed through the channel
pub const MIN_SEND: u64 = 10_000;

/// Exclusive upper bound for a single push
pub const MAX_SEND: u64 = 1 << 30;

pub const MIN_CHAN_CAPACITY: u64 = 1_000_000;
pub const MAX_CHAN_CAPACITY: u64 = 100_000_000;

/// Default CSV delay of the revocable commitment output, in blocks
pub const DEFAULT_DELAY: u16 = 5;

/// Fee paid by justice transactions
pub const JUSTICE_FEE: u64 = 5_000;

/// Errors from channel policy validation
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum PolicyError {
    /// channel capacity of {proposed} sat is outside of the node policy range
    /// ({minimum}..={maximum} sat)
    CapacityOutOfRange {
        proposed: u64,
        minimum: u64,
        maximum: u64,
    },

    /// initial payment of {proposed} sat leaves less than {floor} sat to one
    /// of the channel sides
    InitialPayUnreasonable { proposed: u64, floor: u64 },

    /// amount {proposed} sat is below the policy minimum of {minimum} sat
    AmountTooSmall { proposed: u64, minimum: u64 },

    /// amount {proposed} sat exceeds the policy limit of {maximum} sat
    AmountTooLarge { proposed: u64, maximum: u64 },

    /// update leaves a balance of {balance} sat, below the floor of {floor}
    /// sat
    BalanceBelowFloor { balance: u64, floor: u64 },

    /// CSV delay of the revocable output must be non-zero
    ZeroDelay,
}

/// Parameters shared by both channel parties. Both nodes must run with the
/// same fee and output floor, otherwise they build different commitments
/// and reject each other's signatures.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct Policy {
    /// Flat fee taken from each output of commitment and close transactions
    pub fee: u64,

    /// Dust floor: no output of a channel transaction may be smaller
    pub min_output: u64,

    /// Smallest allowed push or HTLC
    pub min_send: u64,

    /// Exclusive upper bound for a single push
    pub max_send: u64,

    /// Smallest capacity of a channel we open or accept
    pub min_capacity: u64,

    /// Largest capacity of a channel we open or accept
    pub max_capacity: u64,

    /// CSV delay of the revocable output of our commitments, in blocks
    pub delay: u16,

    /// Fee paid by justice transactions
    pub justice_fee: u64,

    /// BIP-44 coin type used in channel key paths
    pub coin_type: u32,
}

impl Default for Policy {
    fn default() -> Policy {
        Policy {
            fee: DEFAULT_FEE,
            min_output: MIN_OUTPUT,
            min_send: MIN_SEND,
            max_send: MAX_SEND,
            min_capacity: MIN_CHAN_CAPACITY,
            max_capacity: MAX_CHAN_CAPACITY,
            delay: DEFAULT_DELAY,
            justice_fee: JUSTICE_FEE,
            // bitcoin mainnet
            coin_type: 0,
        }
    }
}

impl Policy {
    /// Validates parameters of a channel we are going to open or were
    /// offered to accept
    pub fn validate_open(
        &self,
        capacity: u64,
        initial_pay: u64,
    ) -> Result<(), PolicyError> {
        if capacity < self.min_capacity || capacity > self.max_capacity {
            return Err(PolicyError::CapacityOutOfRange {
                proposed: capacity,
                minimum: self.min_capacity,
                maximum: self.max_capacity,
            });
        }
        if self.delay == 0 {
            return Err(PolicyError::ZeroDelay);
        }

        // each side either gets nothing or an output above the floor
        let floor = self.min_output + self.fee;
        let remainder = capacity.saturating_sub(initial_pay);
        let side_ok = |amount: u64| amount == 0 || amount >= floor;
        if initial_pay > capacity || !side_ok(initial_pay) || !side_ok(remainder)
        {
            return Err(PolicyError::InitialPayUnreasonable {
                proposed: initial_pay,
                floor,
            });
        }
        Ok(())
    }

    /// Validates amount of a push or of an HTLC
    pub fn validate_amount(&self, amount: u64) -> Result<(), PolicyError> {
        if amount < self.min_send {
            return Err(PolicyError::AmountTooSmall {
                proposed: amount,
                minimum: self.min_send,
            });
        }
        if amount >= self.max_send {
            return Err(PolicyError::AmountTooLarge {
                proposed: amount,
                maximum: self.max_send - 1,
            });
        }
        Ok(())
    }
}
