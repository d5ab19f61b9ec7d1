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
//! Channel establishment.
//!
//! The funder asks for the responder keys (`PointReq`/`PointResp`), funds
//! the 2-of-2 output and describes the channel (`ChanDesc`). The responder
//! signs the funder's first commitment (`ChanAck`) and the funder answers
//! with its signature for the responder's one (`SigProof`).

use bitcoin::OutPoint;
use secp256k1::PublicKey;

use super::commitment::my_elk_point;
use super::scripts::{PubkeyScript, ScriptGenerators};
use super::state::{Channel, CloseData, Phase, State};
use super::{Error, Policy};
use crate::elkrem::{ElkremReceiver, ElkremSender};
use crate::keygen::{KeyChain, KeyGen, UseRole};
use crate::wire::{ChanAck, ChanDesc, PointResp, SigProof};

/// Everything both parties agreed on when opening a channel
#[derive(Clone, PartialEq, Eq, Debug)]
pub(crate) struct ChannelParams {
    pub outpoint: OutPoint,
    pub capacity: u64,
    pub my_amt: u64,
    pub funder: bool,
    pub key_gen: KeyGen,
    pub their_pub: PublicKey,
    pub their_refund_pub: PublicKey,
    pub their_hakd_base: PublicKey,
    /// Counterparty elkrem points for states 0, 1 and 2
    pub their_elk_points: [PublicKey; 3],
}

/// Public keys we use in the channel with funding key at `key_gen`
pub fn point_resp(
    keychain: &KeyChain,
    key_gen: &KeyGen,
) -> Result<PointResp, Error> {
    Ok(PointResp {
        channel_pubkey: keychain
            .derive_pubkey(&key_gen.with_role(UseRole::ChannelFund))?,
        refund_pubkey: keychain
            .derive_pubkey(&key_gen.with_role(UseRole::ChannelRefund))?,
        hakd_base: keychain.derive_pubkey(&key_gen.with_role(UseRole::HakdBase))?,
    })
}

fn elk_points(elk_snd: &ElkremSender) -> Result<[PublicKey; 3], Error> {
    Ok([
        my_elk_point(elk_snd, 0)?,
        my_elk_point(elk_snd, 1)?,
        my_elk_point(elk_snd, 2)?,
    ])
}

/// Channel open started by us and not yet completed
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct PendingOpen {
    pub key_gen: KeyGen,
    pub capacity: u64,
    /// Amount given to the counterparty in the very first state
    pub initial_pay: u64,
    pub their_keys: Option<PointResp>,
    pub outpoint: Option<OutPoint>,
}

impl PendingOpen {
    pub fn new(
        key_gen: KeyGen,
        capacity: u64,
        initial_pay: u64,
        policy: &Policy,
    ) -> Result<PendingOpen, Error> {
        policy.validate_open(capacity, initial_pay)?;
        Ok(PendingOpen {
            key_gen,
            capacity,
            initial_pay,
            their_keys: None,
            outpoint: None,
        })
    }

    #[inline]
    pub fn peer_idx(&self) -> u32 {
        self.key_gen.peer_idx()
    }

    /// Output script the funding transaction pays the capacity to
    pub fn funding_script(
        &self,
        keychain: &KeyChain,
        resp: &PointResp,
    ) -> Result<PubkeyScript, Error> {
        let my_pub = keychain
            .derive_pubkey(&self.key_gen.with_role(UseRole::ChannelFund))?;
        Ok(PubkeyScript::ln_funding(my_pub, resp.channel_pubkey))
    }

    /// Describes the funded channel to the responder
    pub fn describe(
        &mut self,
        keychain: &KeyChain,
        resp: PointResp,
        outpoint: OutPoint,
    ) -> Result<ChanDesc, Error> {
        let mine = point_resp(keychain, &self.key_gen)?;
        let keys = keychain.channel_keys(&self.key_gen)?;
        let [elk_zero, elk_one, elk_two] = elk_points(&keys.elk_snd)?;
        self.their_keys = Some(resp);
        self.outpoint = Some(outpoint);
        Ok(ChanDesc {
            outpoint,
            pubkey: mine.channel_pubkey,
            refund_pubkey: mine.refund_pubkey,
            hakd_base: mine.hakd_base,
            capacity: self.capacity,
            initial_pay: self.initial_pay,
            elk_zero,
            elk_one,
            elk_two,
        })
    }

    /// Verifies the responder signature over our first commitment and
    /// signs the responder's one
    pub fn complete(
        &self,
        ack: &ChanAck,
        keychain: &KeyChain,
        policy: &Policy,
    ) -> Result<(Channel, SigProof), Error> {
        let (resp, outpoint) = match (&self.their_keys, self.outpoint) {
            (Some(resp), Some(outpoint)) if outpoint == ack.outpoint => {
                (resp, outpoint)
            }
            _ => return Err(Error::UnknownChannel(ack.outpoint)),
        };
        let mut channel = Channel::with_params(
            ChannelParams {
                outpoint,
                capacity: self.capacity,
                my_amt: self.capacity - self.initial_pay,
                funder: true,
                key_gen: self.key_gen,
                their_pub: resp.channel_pubkey,
                their_refund_pub: resp.refund_pubkey,
                their_hakd_base: resp.hakd_base,
                their_elk_points: [ack.elk_zero, ack.elk_one, ack.elk_two],
            },
            keychain,
            policy,
        )?;
        let keys = keychain.channel_keys(&self.key_gen)?;
        channel.verify_sig(&keys.elk_snd, &ack.signature)?;
        channel.state.sig = Some(ack.signature);
        let signature = channel.sign_state(&keys.fund, &keys.elk_snd)?;
        Ok((channel, SigProof {
            outpoint,
            signature,
        }))
    }
}

impl Channel {
    pub(crate) fn with_params(
        params: ChannelParams,
        keychain: &KeyChain,
        policy: &Policy,
    ) -> Result<Channel, Error> {
        let mine = point_resp(keychain, &params.key_gen)?;
        let [elk_point, next_elk_point, n2_elk_point] = params.their_elk_points;
        Ok(Channel {
            outpoint: params.outpoint,
            capacity: params.capacity,
            delay: policy.delay,
            fee: policy.fee,
            min_output: policy.min_output,
            key_gen: params.key_gen,
            funder: params.funder,
            my_pub: mine.channel_pubkey,
            my_refund_pub: mine.refund_pubkey,
            my_hakd_base: mine.hakd_base,
            their_pub: params.their_pub,
            their_refund_pub: params.their_refund_pub,
            their_hakd_base: params.their_hakd_base,
            elk_rcv: ElkremReceiver::new(),
            close_data: CloseData::default(),
            state: State {
                state_idx: 0,
                my_amt: params.my_amt,
                phase: Phase::Rest,
                outgoing: None,
                incoming: None,
                elk_point,
                next_elk_point,
                n2_elk_point,
                sig: None,
                htlcs: vec![],
            },
            compromised: false,
        })
    }

    /// Accepts a channel described by the funder, signing its first
    /// commitment
    pub fn accept(
        desc: &ChanDesc,
        key_gen: KeyGen,
        keychain: &KeyChain,
        policy: &Policy,
    ) -> Result<(Channel, ChanAck), Error> {
        policy.validate_open(desc.capacity, desc.initial_pay)?;
        let channel = Channel::with_params(
            ChannelParams {
                outpoint: desc.outpoint,
                capacity: desc.capacity,
                my_amt: desc.initial_pay,
                funder: false,
                key_gen,
                their_pub: desc.pubkey,
                their_refund_pub: desc.refund_pubkey,
                their_hakd_base: desc.hakd_base,
                their_elk_points: [desc.elk_zero, desc.elk_one, desc.elk_two],
            },
            keychain,
            policy,
        )?;
        let keys = keychain.channel_keys(&key_gen)?;
        let signature = channel.sign_state(&keys.fund, &keys.elk_snd)?;
        let [elk_zero, elk_one, elk_two] = elk_points(&keys.elk_snd)?;
        Ok((channel, ChanAck {
            outpoint: desc.outpoint,
            elk_zero,
            elk_one,
            elk_two,
            signature,
        }))
    }

    /// Stores the funder signature over our first commitment
    pub fn accept_sig_proof(
        &self,
        proof: &SigProof,
        elk_snd: &ElkremSender,
    ) -> Result<Channel, Error> {
        if self.state.state_idx != 0 || self.state.sig.is_some() {
            return Err(Error::UnexpectedMessage {
                channel: self.outpoint,
                message: "SigProof",
                phase: self.state.phase,
                state_idx: self.state.state_idx,
            });
        }
        // a local round may have started already
        self.settled_view(0, self.state.elk_point)
            .verify_sig(elk_snd, &proof.signature)?;
        let mut channel = self.clone();
        channel.state.sig = Some(proof.signature);
        Ok(channel)
    }
}

#[cfg(test)]
pub(crate) mod test {
    use amplify::Wrapper;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    use super::*;
    use crate::channel::Update;
    use crate::keygen::ChannelKeys;

    /// One side of a channel together with its private keys
    pub(crate) struct Party {
        pub chan: Channel,
        pub keys: ChannelKeys,
    }

    pub(crate) fn policy() -> Policy {
        Policy {
            min_output: 10_000,
            ..Policy::default()
        }
    }

    pub(crate) fn keychains() -> (KeyChain, KeyChain) {
        (
            KeyChain::with_seed(&[0xa1; 32]).unwrap(),
            KeyChain::with_seed(&[0xb2; 32]).unwrap(),
        )
    }

    pub(crate) fn path() -> KeyGen {
        KeyGen::channel(0, UseRole::ChannelFund, 1, 1)
    }

    /// Runs the whole opening handshake between two fresh parties
    pub(crate) fn open_pair(capacity: u64, initial_pay: u64) -> (Party, Party) {
        let policy = policy();
        let (funder, responder) = keychains();
        let resp = point_resp(&responder, &path()).unwrap();
        let mut pending =
            PendingOpen::new(path(), capacity, initial_pay, &policy).unwrap();
        assert!(pending
            .funding_script(&funder, &resp)
            .unwrap()
            .as_inner()
            .is_v0_p2wsh());
        let outpoint = OutPoint::new(Txid::from_slice(&[0x77; 32]).unwrap(), 0);
        let desc = pending.describe(&funder, resp, outpoint).unwrap();
        let (b_chan, ack) =
            Channel::accept(&desc, path(), &responder, &policy).unwrap();
        let (a_chan, proof) = pending.complete(&ack, &funder, &policy).unwrap();
        let b_keys = responder.channel_keys(&path()).unwrap();
        let b_chan = b_chan.accept_sig_proof(&proof, &b_keys.elk_snd).unwrap();
        (
            Party {
                chan: a_chan,
                keys: funder.channel_keys(&path()).unwrap(),
            },
            Party {
                chan: b_chan,
                keys: b_keys,
            },
        )
    }

    /// Runs a complete round started by `from`, delivering every reply
    /// until the counterparty has nothing more to say
    pub(crate) fn round(from: &mut Party, to: &mut Party, update: Update) {
        let transition = from
            .chan
            .start_update(update, &from.keys, &policy(), 1_000)
            .unwrap();
        from.chan = transition.channel;
        let mut msg = transition.reply;
        let (mut sender, mut receiver) = (from, to);
        while let Some(next) = msg {
            let transition = receiver
                .chan
                .on_message(&next, &receiver.keys, &policy(), 1_000)
                .unwrap();
            receiver.chan = transition.channel;
            msg = transition.reply;
            std::mem::swap(&mut sender, &mut receiver);
        }
        assert_eq!(sender.chan.state().phase, Phase::Rest);
        assert_eq!(receiver.chan.state().phase, Phase::Rest);
    }

    #[test]
    fn open_handshake() {
        let (a, b) = open_pair(1_000_000, 100_000);
        assert_eq!(a.chan.state.my_amt, 900_000);
        assert_eq!(b.chan.state.my_amt, 100_000);
        assert_eq!(a.chan.their_amt(), b.chan.state.my_amt);
        assert!(a.chan.funder);
        assert!(!b.chan.funder);
        assert_eq!(a.chan.my_pub, b.chan.their_pub);
        assert_eq!(a.chan.funding_script(), b.chan.funding_script());

        // both hold a valid counterparty signature for state 0
        for party in [&a, &b] {
            let sig = party.chan.state.sig.unwrap();
            assert_eq!(party.chan.verify_sig(&party.keys.elk_snd, &sig), Ok(()));
        }
        // elkrem points were exchanged
        assert_eq!(
            a.chan.state.elk_point,
            my_elk_point(&b.keys.elk_snd, 0).unwrap()
        );
        assert_eq!(
            b.chan.state.n2_elk_point,
            my_elk_point(&a.keys.elk_snd, 2).unwrap()
        );
    }

    #[test]
    fn unreasonable_open_rejected() {
        let policy = policy();
        assert!(matches!(
            PendingOpen::new(path(), 1_000_000, 1_000, &policy),
            Err(Error::Policy(_))
        ));
        assert!(matches!(
            PendingOpen::new(path(), 10_000, 0, &policy),
            Err(Error::Policy(_))
        ));
    }

    #[test]
    fn sig_proof_accepted_once() {
        let (a, b) = open_pair(1_000_000, 0);
        let proof = SigProof {
            outpoint: a.chan.outpoint,
            signature: a
                .chan
                .sign_state(&a.keys.fund, &a.keys.elk_snd)
                .unwrap(),
        };
        assert!(matches!(
            b.chan.accept_sig_proof(&proof, &b.keys.elk_snd),
            Err(Error::UnexpectedMessage { .. })
        ));
    }
}
