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
//! HTLC rules layered on top of the push/pull protocol: who may offer and
//! clear what, and when.

use bitcoin::hashes::{sha256, Hash};

use super::state::{Channel, Htlc, Update};
use super::{Error, Policy, PolicyError};

/// Payment hash committed to by an HTLC paying for `preimage`
pub fn payment_hash(preimage: [u8; 16]) -> [u8; 32] {
    sha256::Hash::hash(&preimage).into_inner()
}

impl Channel {
    pub(super) fn htlc(&self, idx: u32) -> Result<&Htlc, Error> {
        self.state.htlcs.get(idx as usize).ok_or(Error::UnknownHtlc {
            channel: self.outpoint,
            idx,
        })
    }

    /// Checks an update proposed by us (`incoming == false`) or by the
    /// counterparty against the policy and the HTLC rules. Balances are
    /// checked separately when the update is applied to a copy of the
    /// ledger.
    pub(crate) fn validate_update(
        &self,
        update: &Update,
        incoming: bool,
        policy: &Policy,
        height: u32,
    ) -> Result<(), Error> {
        match *update {
            Update::Push { amount } => policy.validate_amount(amount)?,
            Update::Offer { amount, .. } => {
                policy.validate_amount(amount)?;
                if amount < self.min_output {
                    return Err(PolicyError::AmountTooSmall {
                        proposed: amount,
                        minimum: self.min_output,
                    }
                    .into());
                }
            }
            Update::Clear { idx, preimage, .. } => {
                let htlc = self.htlc(idx)?;
                if !htlc.is_active() {
                    return Err(Error::HtlcCleared(idx));
                }
                // the proposer of a clear with preimage is the HTLC
                // receiver; of a timeout clear, the offerer
                let proposer_received = htlc.incoming != incoming;
                match preimage {
                    Some(_) if !proposer_received => {
                        return Err(Error::WrongClearDirection(idx))
                    }
                    None if proposer_received => {
                        return Err(Error::WrongClearDirection(idx))
                    }
                    Some(preimage) if payment_hash(preimage) != htlc.rhash => {
                        return Err(Error::PreimageMismatch(idx))
                    }
                    None if height < htlc.locktime => {
                        return Err(Error::LocktimeNotReached {
                            idx,
                            locktime: htlc.locktime,
                            height,
                        })
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Our offers which may be timed out at `height`
    pub fn expired_htlcs(&self, height: u32) -> Vec<u32> {
        self.state
            .active_htlcs()
            .filter(|htlc| !htlc.cleared_on_chain)
            .filter(|htlc| !htlc.incoming && htlc.locktime <= height)
            .map(|htlc| htlc.idx)
            .collect()
    }

    /// Incoming HTLCs we can claim with `preimage`
    pub fn claimable_htlcs(&self, preimage: [u8; 16]) -> Vec<u32> {
        let rhash = payment_hash(preimage);
        self.state
            .active_htlcs()
            .filter(|htlc| !htlc.cleared_on_chain)
            .filter(|htlc| htlc.incoming && htlc.rhash == rhash)
            .map(|htlc| htlc.idx)
            .collect()
    }

    /// No HTLC is pending settlement
    pub fn htlcs_cleared(&self) -> bool {
        self.state.htlcs.iter().all(|htlc| htlc.cleared)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::channel::state::test::channel;

    const PREIMAGE: [u8; 16] = [0x42; 16];

    fn with_htlcs() -> Channel {
        let mut chan = channel(600_000);
        let offer = |amount| Update::Offer {
            amount,
            rhash: payment_hash(PREIMAGE),
            locktime: 700,
            data: [0; 32],
        };
        // #0 offered by us, #1 offered by them
        chan.apply_update(&offer(40_000), false).unwrap();
        chan.apply_update(&offer(30_000), true).unwrap();
        chan
    }

    fn clear(idx: u32, preimage: Option<[u8; 16]>) -> Update {
        Update::Clear {
            idx,
            preimage,
            data: [0; 32],
        }
    }

    #[test]
    fn offer_limits() {
        let chan = channel(600_000);
        let policy = Policy::default();
        let small = Update::Offer {
            amount: 9_000,
            rhash: [0; 32],
            locktime: 1,
            data: [0; 32],
        };
        assert_eq!(
            chan.validate_update(&small, false, &policy, 0),
            Err(Error::Policy(PolicyError::AmountTooSmall {
                proposed: 9_000,
                minimum: 10_000
            }))
        );
    }

    #[test]
    fn preimage_clears() {
        let chan = with_htlcs();
        let policy = Policy::default();
        // we claim their offer
        assert_eq!(
            chan.validate_update(&clear(1, Some(PREIMAGE)), false, &policy, 0),
            Ok(())
        );
        // they claim ours
        assert_eq!(
            chan.validate_update(&clear(0, Some(PREIMAGE)), true, &policy, 0),
            Ok(())
        );
        // we can't claim our own offer
        assert_eq!(
            chan.validate_update(&clear(0, Some(PREIMAGE)), false, &policy, 0),
            Err(Error::WrongClearDirection(0))
        );
        assert_eq!(
            chan.validate_update(&clear(1, Some([0; 16])), false, &policy, 0),
            Err(Error::PreimageMismatch(1))
        );
        assert_eq!(
            chan.validate_update(&clear(5, Some(PREIMAGE)), false, &policy, 0),
            Err(Error::UnknownHtlc {
                channel: chan.outpoint,
                idx: 5
            })
        );
    }

    #[test]
    fn timeout_clears() {
        let chan = with_htlcs();
        let policy = Policy::default();
        assert_eq!(
            chan.validate_update(&clear(0, None), false, &policy, 699),
            Err(Error::LocktimeNotReached {
                idx: 0,
                locktime: 700,
                height: 699
            })
        );
        assert_eq!(
            chan.validate_update(&clear(0, None), false, &policy, 700),
            Ok(())
        );
        assert_eq!(
            chan.validate_update(&clear(1, None), true, &policy, 700),
            Ok(())
        );
        assert_eq!(
            chan.validate_update(&clear(1, None), false, &policy, 700),
            Err(Error::WrongClearDirection(1))
        );
        assert_eq!(chan.expired_htlcs(699), Vec::<u32>::new());
        assert_eq!(chan.expired_htlcs(700), vec![0]);
        assert_eq!(chan.claimable_htlcs(PREIMAGE), vec![1]);
        assert!(!chan.htlcs_cleared());

        let mut swept = chan.clone();
        for htlc in &mut swept.state.htlcs {
            htlc.cleared_on_chain = true;
        }
        assert_eq!(swept.expired_htlcs(700), Vec::<u32>::new());
        assert_eq!(swept.claimable_htlcs(PREIMAGE), Vec::<u32>::new());
    }
}
