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
//! Node running payment channels with many peers.
//!
//! The node owns the channel registry and talks to the outer world only
//! through the [`Wallet`], [`Transport`] and [`Store`] capabilities. Each
//! channel sits behind its own [`ChannelHandle`]; operations on different
//! channels never wait for each other.

mod handle;
mod open;
mod store;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::{OutPoint, Script, Transaction, Txid};
use tokio::sync::{oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

pub use handle::ChannelHandle;
pub use store::{MemStore, Store};

use crate::channel::{
    self, Channel, ChannelInfo, ErrorKind, PendingOpen, Phase, Policy, Update,
};
use crate::keygen::{ChannelKeys, KeyChain, KeyGen};
use crate::wire::Messages;

#[derive(Clone, PartialEq, Eq, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// {0}
    #[from]
    Channel(channel::Error),

    /// transport failure: {0}
    Transport(String),

    /// wallet failure: {0}
    Wallet(String),

    /// storage failure: {0}
    Store(String),

    /// channel opening with peer {0} is already in progress
    OpenInProgress(u32),

    /// no channel opening with peer {0} is in progress
    NoPendingOpen(u32),

    /// channel opening with peer {0} was abandoned
    OpenAborted(u32),

    /// channel {channel} does not belong to peer {peer}
    WrongPeer { channel: OutPoint, peer: u32 },

    /// channel {0} already exists
    ChannelExists(OutPoint),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Channel(err) => err.kind(),
            Error::Transport(_)
            | Error::Wallet(_)
            | Error::Store(_)
            | Error::OpenAborted(_) => ErrorKind::Io,
            Error::OpenInProgress(_) => ErrorKind::Precondition,
            Error::NoPendingOpen(_) => ErrorKind::Sequence,
            Error::WrongPeer { .. } | Error::ChannelExists(_) => {
                ErrorKind::Validation
            }
        }
    }
}

impl From<crate::keygen::Error> for Error {
    fn from(err: crate::keygen::Error) -> Self {
        Error::Channel(err.into())
    }
}

impl From<qchan_encoding::Error> for Error {
    fn from(err: qchan_encoding::Error) -> Self {
        Error::Channel(err.into())
    }
}

/// On-chain wallet funding channels and watching the chain for them
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Builds and keeps, without broadcasting, a transaction paying
    /// `capacity` to `script_pubkey`; returns the funding outpoint
    async fn build_funding(
        &self,
        script_pubkey: Script,
        capacity: u64,
    ) -> Result<OutPoint, Error>;

    /// Broadcasts the funding transaction built for `outpoint`
    async fn really_send(&self, outpoint: OutPoint) -> Result<(), Error>;

    async fn push_tx(&self, tx: Transaction) -> Result<(), Error>;

    /// Starts reporting spends of `outpoint` to
    /// [`Node::handle_chain_event`]
    async fn watch_outpoint(&self, outpoint: OutPoint) -> Result<(), Error>;

    async fn current_height(&self) -> Result<u32, Error>;
}

/// Authenticated delivery of messages to peers
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, peer: u32, data: Vec<u8>) -> Result<(), Error>;
}

/// Channel open started by us and waiting for the peer
struct Opening {
    open: PendingOpen,
    done: oneshot::Sender<Result<OutPoint, Error>>,
}

pub struct Node<W: Wallet, T: Transport, S: Store> {
    keychain: KeyChain,
    policy: Policy,
    wallet: W,
    transport: T,
    store: S,
    channels: RwLock<HashMap<OutPoint, Arc<ChannelHandle>>>,
    /// Opens started by us, per peer
    opening: Mutex<HashMap<u32, Opening>>,
    /// Channel key paths we offered in reply to a peer `PointReq`
    offered: Mutex<HashMap<u32, KeyGen>>,
}

impl<W: Wallet, T: Transport, S: Store> Node<W, T, S> {
    /// Starts the node with the channels found in `store`
    pub async fn new(
        keychain: KeyChain,
        policy: Policy,
        wallet: W,
        transport: T,
        store: S,
    ) -> Result<Self, Error> {
        let channels = store
            .load_channels()
            .await?
            .into_iter()
            .map(|channel| {
                (channel.outpoint(), Arc::new(ChannelHandle::new(channel)))
            })
            .collect::<HashMap<_, _>>();
        info!(count = channels.len(), "channels loaded");
        Ok(Node {
            keychain,
            policy,
            wallet,
            transport,
            store,
            channels: RwLock::new(channels),
            opening: Mutex::new(HashMap::new()),
            offered: Mutex::new(HashMap::new()),
        })
    }

    #[inline]
    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    #[inline]
    pub fn wallet(&self) -> &W {
        &self.wallet
    }

    #[inline]
    pub fn store(&self) -> &S {
        &self.store
    }

    async fn handle(&self, outpoint: OutPoint) -> Result<Arc<ChannelHandle>, Error> {
        self.channels
            .read()
            .await
            .get(&outpoint)
            .cloned()
            .ok_or_else(|| channel::Error::UnknownChannel(outpoint).into())
    }

    async fn register(&self, channel: Channel) {
        self.channels
            .write()
            .await
            .insert(channel.outpoint(), Arc::new(ChannelHandle::new(channel)));
    }

    fn keys(&self, channel: &Channel) -> Result<ChannelKeys, Error> {
        Ok(self.keychain.channel_keys(&channel.key_gen())?)
    }

    async fn send(&self, peer: u32, msg: Messages) -> Result<(), Error> {
        debug!(peer, "sending {}", msg);
        self.transport.send(peer, msg.serialize()).await
    }

    /// Saves the new record and replaces the locked one with it
    async fn commit(
        &self,
        locked: &mut Channel,
        channel: Channel,
    ) -> Result<(), Error> {
        if *locked != channel {
            self.store.save_channel(&channel).await?;
            *locked = channel;
        }
        Ok(())
    }

    /// Entry point for all bytes received from `peer`
    pub async fn handle_message(&self, peer: u32, data: &[u8]) -> Result<(), Error> {
        let msg = Messages::deserialize(data).map_err(|err| {
            warn!(peer, "malformed message: {}", err);
            Error::from(err)
        })?;
        debug!(peer, "received {}", msg);
        let res = match msg {
            Messages::PointReq(_) => self.on_point_req(peer).await,
            Messages::PointResp(resp) => self.on_point_resp(peer, resp).await,
            Messages::ChanDesc(desc) => self.on_chan_desc(peer, desc).await,
            Messages::ChanAck(ack) => self.on_chan_ack(peer, ack).await,
            Messages::SigProof(proof) => self.on_sig_proof(peer, proof).await,
            Messages::CloseReq(req) => self.on_close_req(peer, req).await,
            Messages::DeltaSig(_)
            | Messages::SigRev(_)
            | Messages::Rev(_)
            | Messages::GapSigRev(_)
            | Messages::HashSig(_)
            | Messages::PreimageSig(_) => self.on_update(peer, msg).await,
        };
        if let Err(ref err) = res {
            warn!(peer, kind = %err.kind(), "message rejected: {}", err);
        }
        res
    }

    async fn on_update(&self, peer: u32, msg: Messages) -> Result<(), Error> {
        let outpoint = msg
            .outpoint()
            .ok_or(Error::Channel(channel::Error::UnknownChannel(OutPoint::null())))?;
        let handle = self.handle(outpoint).await?;
        let mut chan = handle.lock().await;
        if chan.key_gen().peer_idx() != peer {
            return Err(Error::WrongPeer {
                channel: outpoint,
                peer,
            });
        }
        let keys = self.keys(&chan)?;
        let height = self.wallet.current_height().await?;
        let prev_phase = chan.state().phase;

        let transition =
            match chan.on_message(&msg, &keys, &self.policy, height) {
                Ok(transition) => transition,
                Err(err) if err.is_fatal() => {
                    error!(
                        channel = %outpoint,
                        "channel compromised, close required: {}", err
                    );
                    let mut compromised = chan.clone();
                    compromised.compromised = true;
                    self.commit(&mut chan, compromised).await?;
                    handle.give();
                    return Err(err.into());
                }
                Err(err) if prev_phase == Phase::Pushed && msg.is_proposal() => {
                    // the colliding proposal is rejected: ours goes too
                    if let Ok(withdrawn) = chan.withdraw() {
                        warn!(
                            channel = %outpoint,
                            "withdrawing our proposal after rejecting the colliding one: {}",
                            err
                        );
                        self.commit(&mut chan, withdrawn).await?;
                        handle.give();
                    }
                    return Err(err.into());
                }
                Err(err) => return Err(err.into()),
            };
        let settled = transition.settled;
        self.commit(&mut chan, transition.channel).await?;
        let info = chan.info();
        drop(chan);

        if let Some(reply) = transition.reply {
            self.send(peer, reply).await?;
        }
        if settled {
            info!(channel = %outpoint, "state #{} reached: {}", info.state_idx, info);
            // rounds started by us end in these phases
            if matches!(prev_phase, Phase::Pushed | Phase::GapRevoked) {
                handle.give();
            }
        }
        Ok(())
    }

    /// Runs an update round started by us and waits for its completion
    async fn update(
        &self,
        outpoint: OutPoint,
        update: Update,
    ) -> Result<ChannelInfo, Error> {
        let handle = self.handle(outpoint).await?;
        handle.take().await;
        let (peer, reply, started) = match self.start_update(&handle, update).await {
            Ok(res) => res,
            Err(err) => {
                handle.give();
                return Err(err);
            }
        };
        if let Err(err) = self.send(peer, reply).await {
            // the round stays in flight until it is resumed
            handle.give();
            return Err(err);
        }
        handle.wait_clear().await;
        // the slot is also given back when the round is cut short
        let chan = handle.lock().await;
        if chan.is_closed() {
            return Err(channel::Error::ChannelClosed(outpoint).into());
        }
        if chan.compromised() {
            return Err(channel::Error::ChannelCompromised(outpoint).into());
        }
        if chan.state().state_idx == started {
            return Err(channel::Error::UpdateWithdrawn(outpoint).into());
        }
        Ok(chan.info())
    }

    async fn start_update(
        &self,
        handle: &ChannelHandle,
        update: Update,
    ) -> Result<(u32, Messages, u64), Error> {
        let mut chan = handle.lock().await;
        let keys = self.keys(&chan)?;
        let height = self.wallet.current_height().await?;
        let started = chan.state().state_idx;
        let transition =
            chan.start_update(update, &keys, &self.policy, height)?;
        self.commit(&mut chan, transition.channel).await?;
        let reply = transition
            .reply
            .ok_or(channel::Error::NothingToResend(chan.outpoint()))?;
        Ok((chan.key_gen().peer_idx(), reply, started))
    }

    /// Pushes `amount` to the counterparty
    pub async fn push(
        &self,
        outpoint: OutPoint,
        amount: u64,
    ) -> Result<ChannelInfo, Error> {
        info!(channel = %outpoint, amount, "pushing");
        self.update(outpoint, Update::Push { amount }).await
    }

    pub async fn offer_htlc(
        &self,
        outpoint: OutPoint,
        amount: u64,
        rhash: [u8; 32],
        locktime: u32,
        data: [u8; 32],
    ) -> Result<ChannelInfo, Error> {
        info!(channel = %outpoint, amount, locktime, "offering HTLC");
        self.update(outpoint, Update::Offer {
            amount,
            rhash,
            locktime,
            data,
        })
        .await
    }

    /// Clears HTLC `idx` with its preimage or, with `None`, by timeout
    pub async fn clear_htlc(
        &self,
        outpoint: OutPoint,
        idx: u32,
        preimage: Option<[u8; 16]>,
        data: [u8; 32],
    ) -> Result<ChannelInfo, Error> {
        info!(
            channel = %outpoint,
            idx,
            timeout = preimage.is_none(),
            "clearing HTLC"
        );
        self.update(outpoint, Update::Clear {
            idx,
            preimage,
            data,
        })
        .await
    }

    /// Starts a cooperative close; the counterparty completes and
    /// broadcasts the transaction
    pub async fn close_channel(&self, outpoint: OutPoint) -> Result<Txid, Error> {
        let handle = self.handle(outpoint).await?;
        let mut chan = handle.lock().await;
        if !handle.try_take() {
            return Err(channel::Error::ChannelBusy {
                channel: outpoint,
                phase: chan.state().phase,
            }
            .into());
        }
        let res = self.close_locked(&mut chan).await;
        handle.give();
        let (peer, msg, txid) = res?;
        drop(chan);
        self.send(peer, msg).await?;
        info!(channel = %outpoint, %txid, "cooperative close requested");
        Ok(txid)
    }

    async fn close_locked(
        &self,
        chan: &mut Channel,
    ) -> Result<(u32, Messages, Txid), Error> {
        let keys = self.keys(chan)?;
        let height = self.wallet.current_height().await?;
        let (closed, req) = chan.close_request(&keys, height)?;
        let txid = closed
            .close_data()
            .close_txid
            .ok_or(channel::Error::ChannelClosed(chan.outpoint()))?;
        self.commit(chan, closed).await?;
        Ok((chan.key_gen().peer_idx(), req.into(), txid))
    }

    async fn on_close_req(
        &self,
        peer: u32,
        req: crate::wire::CloseReq,
    ) -> Result<(), Error> {
        let handle = self.handle(req.outpoint).await?;
        let mut chan = handle.lock().await;
        if chan.key_gen().peer_idx() != peer {
            return Err(Error::WrongPeer {
                channel: req.outpoint,
                peer,
            });
        }
        let keys = self.keys(&chan)?;
        let height = self.wallet.current_height().await?;
        let closed = chan.on_close_req(&req, &keys, height)?;
        self.commit(&mut chan, closed.channel).await?;
        drop(chan);
        info!(channel = %req.outpoint, txid = %closed.tx.txid(), "channel closed cooperatively");
        self.wallet.push_tx(closed.tx).await
    }

    /// Broadcasts our latest commitment without the counterparty
    pub async fn break_channel(&self, outpoint: OutPoint) -> Result<Txid, Error> {
        let handle = self.handle(outpoint).await?;
        let mut chan = handle.lock().await;
        let keys = self.keys(&chan)?;
        let height = self.wallet.current_height().await?;
        let broken = chan.break_tx(&keys, height)?;
        self.commit(&mut chan, broken.channel).await?;
        drop(chan);
        // nobody waits for a round of a closed channel
        handle.give();
        let txid = broken.tx.txid();
        warn!(channel = %outpoint, %txid, "channel broken");
        self.wallet.push_tx(broken.tx).await?;
        Ok(txid)
    }

    /// Processes a transaction spending the funding output of a channel.
    /// Marks the channel closed and, if `tx` is a revoked commitment of the
    /// counterparty, broadcasts the justice transaction and returns its id.
    pub async fn handle_chain_event(
        &self,
        outpoint: OutPoint,
        tx: Transaction,
        height: u32,
    ) -> Result<Option<Txid>, Error> {
        let handle = self.handle(outpoint).await?;
        let mut chan = handle.lock().await;
        let mut closed = chan.clone();
        if closed.close_data.mark_closed(&tx, height) {
            info!(channel = %outpoint, txid = %tx.txid(), height, "channel closed on chain");
            self.commit(&mut chan, closed).await?;
        }
        let keys = self.keys(&chan)?;
        let justice = match chan.build_justice(&tx, &keys, &self.policy) {
            Ok(justice) => justice,
            Err(
                channel::Error::NotRevoked { .. }
                | channel::Error::RevocableOutputNotFound(_),
            ) => {
                handle.give();
                return Ok(None);
            }
            Err(err) => return Err(err.into()),
        };
        drop(chan);
        handle.give();
        let txid = justice.txid();
        warn!(
            channel = %outpoint,
            revoked = %tx.txid(),
            justice = %txid,
            "counterparty broadcast a revoked state"
        );
        self.wallet.push_tx(justice).await?;
        Ok(Some(txid))
    }

    /// Claims every incoming HTLC paid for by `preimage`: off-chain in open
    /// channels and on-chain from the commitment which closed the others.
    /// Returns the ids of the on-chain claims.
    pub async fn claim_htlc(&self, preimage: [u8; 16]) -> Result<Vec<Txid>, Error> {
        let height = self.wallet.current_height().await?;
        info!(height, "claiming HTLCs paid by a preimage");
        self.claim_htlcs(|chan| chan.claimable_htlcs(preimage), Some(preimage), height)
            .await
    }

    /// Takes back every HTLC we offered whose locktime `height` has reached,
    /// the same way as [`Node::claim_htlc`]
    pub async fn claim_htlc_timeouts(&self, height: u32) -> Result<Vec<Txid>, Error> {
        info!(height, "timing out HTLCs");
        self.claim_htlcs(|chan| chan.expired_htlcs(height), None, height)
            .await
    }

    async fn claim_htlcs(
        &self,
        select: impl Fn(&Channel) -> Vec<u32>,
        preimage: Option<[u8; 16]>,
        height: u32,
    ) -> Result<Vec<Txid>, Error> {
        let handles =
            self.channels.read().await.values().cloned().collect::<Vec<_>>();
        let mut txids = vec![];
        for handle in handles {
            let mut chan = handle.lock().await;
            let idxs = select(&*chan);
            if idxs.is_empty() {
                continue;
            }
            let outpoint = chan.outpoint();
            if !chan.is_closed() {
                drop(chan);
                for idx in idxs {
                    self.clear_htlc(outpoint, idx, preimage, [0; 32]).await?;
                }
                continue;
            }
            let keys = self.keys(&chan)?;
            let mut claims = Vec::with_capacity(idxs.len());
            for idx in idxs {
                let claim = chan.claim_htlc_on_chain(
                    idx,
                    preimage,
                    &keys,
                    &self.policy,
                    height,
                )?;
                self.commit(&mut chan, claim.channel).await?;
                claims.push(claim.tx);
            }
            drop(chan);
            for tx in claims {
                let txid = tx.txid();
                info!(channel = %outpoint, %txid, "HTLC claim broadcast");
                self.wallet.push_tx(tx).await?;
                txids.push(txid);
            }
        }
        Ok(txids)
    }

    /// Broadcasts the sweep of our delayed balance from our own commitment
    /// which closed the channel. The wallet accepts it only once the CSV
    /// delay has passed.
    pub async fn sweep_channel(&self, outpoint: OutPoint) -> Result<Txid, Error> {
        let handle = self.handle(outpoint).await?;
        let chan = handle.lock().await;
        let keys = self.keys(&chan)?;
        let sweep = chan.sweep_timeout(&keys)?;
        drop(chan);
        let txid = sweep.txid();
        info!(channel = %outpoint, %txid, "sweeping delayed balance");
        self.wallet.push_tx(sweep).await?;
        Ok(txid)
    }

    pub async fn list_channels(&self) -> Vec<ChannelInfo> {
        let handles =
            self.channels.read().await.values().cloned().collect::<Vec<_>>();
        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            infos.push(handle.lock().await.info());
        }
        infos.sort_by_key(|info| (info.peer_idx, info.chan_idx));
        infos
    }

    /// Re-sends the last message of the channel, recovering a round stuck
    /// on a lost message
    pub async fn resume(&self, outpoint: OutPoint) -> Result<(), Error> {
        let handle = self.handle(outpoint).await?;
        let chan = handle.lock().await;
        let keys = self.keys(&chan)?;
        let msg = chan.resend(&keys)?;
        let peer = chan.key_gen().peer_idx();
        drop(chan);
        info!(channel = %outpoint, "resuming with {}", msg);
        self.send(peer, msg).await
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    use bitcoin::hashes::{sha256d, Hash};
    use secp256k1::{Message, PublicKey, SecretKey, SECP256K1};
    use tokio::sync::mpsc;
    use tracing_subscriber::EnvFilter;

    use super::*;
    use crate::channel::fund::test::policy;
    use crate::channel::payment_hash;
    use crate::wire::{ChanDesc, DeltaSig, PointReq};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// Delivers everything into the inbox of the other node
    struct Loopback(mpsc::UnboundedSender<Vec<u8>>);

    #[async_trait]
    impl Transport for Loopback {
        async fn send(&self, _peer: u32, data: Vec<u8>) -> Result<(), Error> {
            self.0
                .send(data)
                .map_err(|err| Error::Transport(err.to_string()))
        }
    }

    #[derive(Default)]
    struct MockWallet {
        height: AtomicU32,
        funded: std::sync::Mutex<Vec<OutPoint>>,
        watched: std::sync::Mutex<Vec<OutPoint>>,
        pushed: std::sync::Mutex<Vec<Transaction>>,
    }

    impl MockWallet {
        fn pushed(&self) -> Vec<Transaction> {
            self.pushed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Wallet for MockWallet {
        async fn build_funding(
            &self,
            script_pubkey: Script,
            capacity: u64,
        ) -> Result<OutPoint, Error> {
            assert!(script_pubkey.is_v0_p2wsh());
            let mut data = script_pubkey.into_bytes();
            data.extend(capacity.to_be_bytes());
            Ok(OutPoint::new(Txid::from_hash(sha256d::Hash::hash(&data)), 0))
        }

        async fn really_send(&self, outpoint: OutPoint) -> Result<(), Error> {
            self.funded.lock().unwrap().push(outpoint);
            Ok(())
        }

        async fn push_tx(&self, tx: Transaction) -> Result<(), Error> {
            self.pushed.lock().unwrap().push(tx);
            Ok(())
        }

        async fn watch_outpoint(&self, outpoint: OutPoint) -> Result<(), Error> {
            self.watched.lock().unwrap().push(outpoint);
            Ok(())
        }

        async fn current_height(&self) -> Result<u32, Error> {
            Ok(self.height.load(Ordering::SeqCst))
        }
    }

    type TestNode = Node<MockWallet, Loopback, MemStore>;

    struct Pair {
        a: Arc<TestNode>,
        b: Arc<TestNode>,
        /// Errors of messages delivered to `b`
        b_errors: Arc<std::sync::Mutex<Vec<Error>>>,
        /// Messages sent to `b` are lost while set
        b_offline: Arc<AtomicBool>,
    }

    fn pump(
        node: Arc<TestNode>,
        mut inbox: mpsc::UnboundedReceiver<Vec<u8>>,
        errors: Arc<std::sync::Mutex<Vec<Error>>>,
        offline: Arc<AtomicBool>,
    ) {
        tokio::spawn(async move {
            while let Some(data) = inbox.recv().await {
                if offline.load(Ordering::SeqCst) {
                    continue;
                }
                // each node knows the other one as peer 1
                if let Err(err) = node.handle_message(1, &data).await {
                    errors.lock().unwrap().push(err);
                }
            }
        });
    }

    async fn pair() -> Pair {
        init_tracing();
        let (to_b, b_inbox) = mpsc::unbounded_channel();
        let (to_a, a_inbox) = mpsc::unbounded_channel();
        let node = |seed: u8, transport| {
            Node::new(
                KeyChain::with_seed(&[seed; 32]).unwrap(),
                policy(),
                MockWallet::default(),
                transport,
                MemStore::default(),
            )
        };
        let a = Arc::new(node(0xa1, Loopback(to_b)).await.unwrap());
        let b = Arc::new(node(0xb2, Loopback(to_a)).await.unwrap());
        let b_errors = Arc::new(std::sync::Mutex::new(vec![]));
        let b_offline = Arc::new(AtomicBool::new(false));
        pump(
            a.clone(),
            a_inbox,
            Arc::new(std::sync::Mutex::new(vec![])),
            Arc::new(AtomicBool::new(false)),
        );
        pump(b.clone(), b_inbox, b_errors.clone(), b_offline.clone());
        Pair {
            a,
            b,
            b_errors,
            b_offline,
        }
    }

    async fn until(cond: impl Fn() -> bool) {
        for _ in 0..200 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition is not reached");
    }

    /// Waits for the peer to finish processing the last round
    async fn at_rest(node: &TestNode) {
        for _ in 0..200 {
            let infos = node.list_channels().await;
            if infos.iter().all(|info| info.phase == Phase::Rest) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("channels are not at rest");
    }

    async fn in_phase(node: &TestNode, phase: Phase) {
        for _ in 0..200 {
            if node.list_channels().await.iter().any(|info| info.phase == phase) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no channel reached {}", phase);
    }

    /// Waits until the node holds a counterparty signature of its commitment
    async fn signed(node: &TestNode) {
        for _ in 0..200 {
            let chans = node.store().load_channels().await.unwrap();
            if chans.iter().any(|chan| chan.state().sig.is_some()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no signature received");
    }

    async fn info(node: &TestNode) -> ChannelInfo {
        let mut infos = node.list_channels().await;
        assert_eq!(infos.len(), 1);
        infos.remove(0)
    }

    #[tokio::test]
    async fn open_push_and_pull_back() {
        let Pair { a, b, b_errors, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 0).await.unwrap();
        assert_eq!(*a.wallet().funded.lock().unwrap(), vec![outpoint]);
        assert_eq!(*a.wallet().watched.lock().unwrap(), vec![outpoint]);
        assert_eq!(*b.wallet().watched.lock().unwrap(), vec![outpoint]);

        let pushed = a.push(outpoint, 50_000).await.unwrap();
        assert_eq!(pushed.my_amt, 950_000);
        assert_eq!(pushed.state_idx, 1);

        at_rest(&b).await;
        let pulled = b.push(outpoint, 20_000).await.unwrap();
        assert_eq!(pulled.my_amt, 30_000);
        at_rest(&a).await;

        let a_info = info(&a).await;
        let b_info = info(&b).await;
        assert_eq!(a_info.my_amt, 970_000);
        assert_eq!(a_info.state_idx, 2);
        assert_eq!(a_info.phase, Phase::Rest);
        assert_eq!(b_info.their_amt, 970_000);
        assert_eq!(b_info.state_idx, 2);
        assert!(b_errors.lock().unwrap().is_empty());

        // records were persisted
        assert_eq!(a.store().load_channels().await.unwrap()[0].info(), a_info);
    }

    #[tokio::test]
    async fn concurrent_pushes_converge() {
        let Pair { a, b, b_errors, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 400_000).await.unwrap();
        let (from_a, from_b) =
            tokio::join!(a.push(outpoint, 30_000), b.push(outpoint, 70_000));
        from_a.unwrap();
        from_b.unwrap();

        let a_info = info(&a).await;
        let b_info = info(&b).await;
        assert_eq!(a_info.state_idx, 2);
        assert_eq!(b_info.state_idx, 2);
        assert_eq!(a_info.my_amt, 600_000 - 30_000 + 70_000);
        assert_eq!(b_info.my_amt, 400_000 - 70_000 + 30_000);
        assert!(b_errors.lock().unwrap().is_empty());

        // still usable
        a.push(outpoint, 10_000).await.unwrap();
        assert_eq!(info(&b).await.my_amt, 370_000);
    }

    #[tokio::test]
    async fn htlc_claimed_and_timed_out() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 200_000).await.unwrap();
        let preimage = [0x5a; 16];

        let offered = a
            .offer_htlc(outpoint, 60_000, payment_hash(preimage), 500, [0; 32])
            .await
            .unwrap();
        assert_eq!(offered.htlc_count, 1);
        assert_eq!(offered.my_amt, 740_000);
        at_rest(&b).await;

        let claimed = b
            .clear_htlc(outpoint, 0, Some(preimage), [0; 32])
            .await
            .unwrap();
        assert_eq!(claimed.my_amt, 260_000);
        assert_eq!(claimed.htlc_count, 0);
        at_rest(&a).await;

        a.offer_htlc(outpoint, 40_000, payment_hash([1; 16]), 500, [0; 32])
            .await
            .unwrap();
        let err = a.clear_htlc(outpoint, 1, None, [0; 32]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);

        a.wallet().height.store(500, Ordering::SeqCst);
        b.wallet().height.store(500, Ordering::SeqCst);
        let refunded = a.clear_htlc(outpoint, 1, None, [0; 32]).await.unwrap();
        assert_eq!(refunded.my_amt, 740_000);
        assert_eq!(info(&b).await.my_amt, 260_000);
    }

    #[tokio::test]
    async fn htlcs_claimed_off_and_on_chain() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 200_000).await.unwrap();
        a.offer_htlc(outpoint, 60_000, payment_hash([1; 16]), 500, [0; 32])
            .await
            .unwrap();
        at_rest(&b).await;
        assert_eq!(b.claim_htlc([1; 16]).await, Ok(vec![]));
        assert_eq!(info(&b).await.my_amt, 260_000);
        at_rest(&a).await;

        a.offer_htlc(outpoint, 40_000, payment_hash([2; 16]), 900, [0; 32])
            .await
            .unwrap();
        a.offer_htlc(outpoint, 30_000, payment_hash([3; 16]), 500, [0; 32])
            .await
            .unwrap();
        at_rest(&b).await;
        b.break_channel(outpoint).await.unwrap();
        let broken = b.wallet().pushed().remove(0);

        let claimed = b.claim_htlc([2; 16]).await.unwrap();
        assert_eq!(claimed.len(), 1);
        let claim = b.wallet().pushed().remove(1);
        assert_eq!(claim.txid(), claimed[0]);
        assert_eq!(claim.input[0].previous_output.txid, broken.txid());
        let chans = b.store().load_channels().await.unwrap();
        assert!(chans[0].state().htlcs[1].cleared_on_chain);
        assert!(!chans[0].state().htlcs[2].cleared_on_chain);
        // already claimed
        assert_eq!(b.claim_htlc([2; 16]).await, Ok(vec![]));

        assert_eq!(a.handle_chain_event(outpoint, broken.clone(), 130).await, Ok(None));
        assert_eq!(a.claim_htlc_timeouts(499).await, Ok(vec![]));
        let timed_out = a.claim_htlc_timeouts(500).await.unwrap();
        assert_eq!(timed_out.len(), 1);
        let refund = a.wallet().pushed().remove(0);
        assert_eq!(refund.txid(), timed_out[0]);
        assert_eq!(refund.lock_time.0, 500);
        assert_eq!(refund.input[0].previous_output.txid, broken.txid());

        let swept = b.sweep_channel(outpoint).await.unwrap();
        assert_eq!(b.wallet().pushed().remove(2).txid(), swept);
        // a's balance in b's commitment is not delayed
        assert_eq!(
            a.sweep_channel(outpoint).await,
            Err(Error::Channel(channel::Error::RevocableOutputNotFound(
                broken.txid()
            )))
        );
    }

    #[tokio::test]
    async fn conflicting_clears_withdrawn() {
        let Pair { a, b, b_errors, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 200_000).await.unwrap();
        let preimage = [7; 16];
        a.offer_htlc(outpoint, 50_000, payment_hash(preimage), 500, [0; 32])
            .await
            .unwrap();
        at_rest(&b).await;
        a.wallet().height.store(500, Ordering::SeqCst);
        b.wallet().height.store(500, Ordering::SeqCst);

        let (timeout, claim) = tokio::join!(
            a.clear_htlc(outpoint, 0, None, [0; 32]),
            b.clear_htlc(outpoint, 0, Some(preimage), [0; 32])
        );
        let withdrawn = Err(Error::Channel(channel::Error::UpdateWithdrawn(outpoint)));
        assert_eq!(timeout, withdrawn);
        assert_eq!(claim, withdrawn);
        assert!(b_errors
            .lock()
            .unwrap()
            .contains(&Error::Channel(channel::Error::ConflictingClear(0))));
        assert_eq!(info(&a).await.phase, Phase::Rest);
        assert_eq!(info(&b).await.phase, Phase::Rest);

        let claimed = b
            .clear_htlc(outpoint, 0, Some(preimage), [0; 32])
            .await
            .unwrap();
        assert_eq!(claimed.my_amt, 250_000);
        assert_eq!(claimed.htlc_count, 0);
    }

    #[tokio::test]
    async fn duplicate_chan_desc_rejected() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 0).await.unwrap();
        a.push(outpoint, 50_000).await.unwrap();
        at_rest(&b).await;
        let before = info(&b).await;

        b.handle_message(1, &Messages::from(PointReq {}).serialize())
            .await
            .unwrap();
        let key = |byte| {
            PublicKey::from_secret_key(
                SECP256K1,
                &SecretKey::from_slice(&[byte; 32]).unwrap(),
            )
        };
        let desc = Messages::from(ChanDesc {
            outpoint,
            pubkey: key(1),
            refund_pubkey: key(2),
            hakd_base: key(3),
            capacity: 2_000_000,
            initial_pay: 0,
            elk_zero: key(4),
            elk_one: key(5),
            elk_two: key(6),
        });
        let err = b.handle_message(1, &desc.serialize()).await.unwrap_err();
        assert_eq!(err, Error::ChannelExists(outpoint));
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(info(&b).await, before);
        assert_eq!(
            b.store().load_channel(outpoint).await.unwrap().unwrap().info(),
            before
        );
        // the offered open is still usable
        assert!(b.offered.lock().await.contains_key(&1));
    }

    #[tokio::test]
    async fn break_wakes_pending_update() {
        let Pair { a, b_offline, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 0).await.unwrap();
        b_offline.store(true, Ordering::SeqCst);

        let pending = tokio::spawn({
            let a = a.clone();
            async move { a.push(outpoint, 50_000).await }
        });
        in_phase(&a, Phase::Pushed).await;
        a.break_channel(outpoint).await.unwrap();
        assert_eq!(
            pending.await.unwrap(),
            Err(Error::Channel(channel::Error::ChannelClosed(outpoint)))
        );
    }

    #[tokio::test]
    async fn chain_event_wakes_pending_update() {
        let Pair { a, b, b_offline, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 300_000).await.unwrap();
        signed(&b).await;
        b_offline.store(true, Ordering::SeqCst);

        let pending = tokio::spawn({
            let a = a.clone();
            async move { a.push(outpoint, 50_000).await }
        });
        in_phase(&a, Phase::Pushed).await;
        b.break_channel(outpoint).await.unwrap();
        let broken = b.wallet().pushed().remove(0);
        assert_eq!(a.handle_chain_event(outpoint, broken, 140).await, Ok(None));
        assert_eq!(
            pending.await.unwrap(),
            Err(Error::Channel(channel::Error::ChannelClosed(outpoint)))
        );
    }

    #[tokio::test]
    async fn cooperative_close() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 200_000).await.unwrap();
        let txid = a.close_channel(outpoint).await.unwrap();
        until(|| !b.wallet().pushed().is_empty()).await;

        let pushed = b.wallet().pushed();
        assert_eq!(pushed[0].txid(), txid);
        assert!(info(&a).await.closed);
        assert!(info(&b).await.closed);

        let err = a.push(outpoint, 10_000).await.unwrap_err();
        assert_eq!(err, Error::Channel(channel::Error::ChannelClosed(outpoint)));
        assert_eq!(err.kind(), ErrorKind::Precondition);
    }

    #[tokio::test]
    async fn revoked_state_punished() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 300_000).await.unwrap();
        let old = {
            let handle = b.handle(outpoint).await.unwrap();
            let chan = handle.lock().await;
            let keys = b.keys(&chan).unwrap();
            chan.build_state_tx(&keys.elk_snd, true).unwrap()
        };
        a.push(outpoint, 50_000).await.unwrap();

        let justice = a
            .handle_chain_event(outpoint, old.clone(), 120)
            .await
            .unwrap()
            .unwrap();
        let pushed = a.wallet().pushed();
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0].txid(), justice);
        assert_eq!(pushed[0].input[0].previous_output.txid, old.txid());
        assert!(info(&a).await.closed);
    }

    #[tokio::test]
    async fn broken_channel_not_punished() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 300_000).await.unwrap();
        a.push(outpoint, 50_000).await.unwrap();

        let txid = b.break_channel(outpoint).await.unwrap();
        let broken = b.wallet().pushed().remove(0);
        assert_eq!(broken.txid(), txid);
        assert!(info(&b).await.closed);

        assert_eq!(a.handle_chain_event(outpoint, broken.clone(), 130).await, Ok(None));
        assert!(a.wallet().pushed().is_empty());
        // the first observed close wins
        assert_eq!(a.handle_chain_event(outpoint, broken, 131).await, Ok(None));
        let chans = a.store().load_channels().await.unwrap();
        assert_eq!(chans[0].close_data().close_height, 130);
    }

    #[tokio::test]
    async fn forged_signature_compromises_channel() {
        let Pair { a, b, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 300_000).await.unwrap();
        signed(&b).await;

        let signature = SECP256K1.sign_ecdsa(
            &Message::from_slice(&[7; 32]).unwrap(),
            &SecretKey::from_slice(&[9; 32]).unwrap(),
        );
        let forged = Messages::from(DeltaSig {
            outpoint,
            delta: 20_000,
            signature,
        });
        let err = b.handle_message(1, &forged.serialize()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Fatal);
        assert!(info(&b).await.compromised);

        let err = b.push(outpoint, 10_000).await.unwrap_err();
        assert_eq!(
            err,
            Error::Channel(channel::Error::ChannelCompromised(outpoint))
        );
        // a compromised channel can still be broken
        b.break_channel(outpoint).await.unwrap();
    }

    #[tokio::test]
    async fn resume_resends_last_message() {
        let Pair { a, b, b_errors, .. } = pair().await;
        let outpoint = a.open_channel(1, 1_000_000, 0).await.unwrap();
        let err = a.resume(outpoint).await.unwrap_err();
        assert_eq!(
            err,
            Error::Channel(channel::Error::NothingToResend(outpoint))
        );

        a.push(outpoint, 50_000).await.unwrap();
        at_rest(&b).await;
        let before = info(&b).await;
        // the final Rev is delivered once more and ignored
        a.resume(outpoint).await.unwrap();
        b.push(outpoint, 10_000).await.unwrap();
        assert!(b_errors.lock().unwrap().is_empty());
        assert_eq!(info(&b).await.state_idx, before.state_idx + 1);
    }

    #[tokio::test]
    async fn garbage_rejected() {
        let Pair { b, .. } = pair().await;
        let err = b.handle_message(1, &[0xff, 1, 2]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        let err = b.handle_message(1, &[]).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert_eq!(
            b.push(OutPoint::null(), 10_000).await.unwrap_err().kind(),
            ErrorKind::Validation
        );
    }
}
