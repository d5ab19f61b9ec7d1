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
//! Channel opening handshake driven by the node.

use amplify::Wrapper;
use bitcoin::OutPoint;
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::{Error, Node, Opening, Store, Transport, Wallet};
use crate::channel::{point_resp, Channel, PendingOpen};
use crate::keygen::{KeyGen, UseRole};
use crate::wire::{ChanAck, ChanDesc, PointReq, PointResp, SigProof};

impl<W: Wallet, T: Transport, S: Store> Node<W, T, S> {
    fn channel_path(&self, peer: u32, chan_idx: u32) -> KeyGen {
        KeyGen::channel(
            self.policy.coin_type,
            UseRole::ChannelFund,
            peer,
            chan_idx,
        )
    }

    /// Opens a channel with `peer` funded by us, giving `initial_pay` of
    /// the `capacity` to the peer. Completes once the peer has signed our
    /// first commitment and the funding transaction is broadcast.
    pub async fn open_channel(
        &self,
        peer: u32,
        capacity: u64,
        initial_pay: u64,
    ) -> Result<OutPoint, Error> {
        let (done, completed) = oneshot::channel();
        {
            let mut opening = self.opening.lock().await;
            if opening.contains_key(&peer) {
                return Err(Error::OpenInProgress(peer));
            }
            let chan_idx = self.store.next_channel_idx(peer).await?;
            let open = PendingOpen::new(
                self.channel_path(peer, chan_idx),
                capacity,
                initial_pay,
                &self.policy,
            )?;
            opening.insert(peer, Opening { open, done });
        }
        info!(peer, capacity, initial_pay, "opening channel");
        if let Err(err) = self.send(peer, PointReq {}.into()).await {
            self.opening.lock().await.remove(&peer);
            return Err(err);
        }
        completed.await.map_err(|_| Error::OpenAborted(peer))?
    }

    /// Fails the open in progress with `peer`, waking its initiator
    async fn abort_open(&self, peer: u32, err: Error) -> Error {
        if let Some(opening) = self.opening.lock().await.remove(&peer) {
            let _ = opening.done.send(Err(err.clone()));
        }
        err
    }

    pub(super) async fn on_point_req(&self, peer: u32) -> Result<(), Error> {
        let chan_idx = self.store.next_channel_idx(peer).await?;
        let key_gen = self.channel_path(peer, chan_idx);
        let resp = point_resp(&self.keychain, &key_gen)?;
        self.offered.lock().await.insert(peer, key_gen);
        debug!(peer, chan_idx, "offering channel keys");
        self.send(peer, resp.into()).await
    }

    pub(super) async fn on_point_resp(
        &self,
        peer: u32,
        resp: PointResp,
    ) -> Result<(), Error> {
        match self.fund(peer, resp).await {
            Ok(desc) => self.send(peer, desc.into()).await,
            Err(err @ Error::NoPendingOpen(_)) => Err(err),
            Err(err) => Err(self.abort_open(peer, err).await),
        }
    }

    async fn fund(&self, peer: u32, resp: PointResp) -> Result<ChanDesc, Error> {
        let mut opening = self.opening.lock().await;
        let pending = opening.get_mut(&peer).ok_or(Error::NoPendingOpen(peer))?;
        let script = pending.open.funding_script(&self.keychain, &resp)?;
        let outpoint = self
            .wallet
            .build_funding(script.into_inner(), pending.open.capacity)
            .await?;
        debug!(peer, %outpoint, "funding output built");
        Ok(pending.open.describe(&self.keychain, resp, outpoint)?)
    }

    pub(super) async fn on_chan_desc(
        &self,
        peer: u32,
        desc: ChanDesc,
    ) -> Result<(), Error> {
        if self.channels.read().await.contains_key(&desc.outpoint)
            || self.store.load_channel(desc.outpoint).await?.is_some()
        {
            return Err(Error::ChannelExists(desc.outpoint));
        }
        let key_gen = self
            .offered
            .lock()
            .await
            .remove(&peer)
            .ok_or(Error::NoPendingOpen(peer))?;
        let (channel, ack) =
            Channel::accept(&desc, key_gen, &self.keychain, &self.policy)?;
        self.store.save_channel(&channel).await?;
        self.register(channel).await;
        self.wallet.watch_outpoint(desc.outpoint).await?;
        info!(peer, channel = %desc.outpoint, capacity = desc.capacity, "channel accepted");
        self.send(peer, ack.into()).await
    }

    pub(super) async fn on_chan_ack(
        &self,
        peer: u32,
        ack: ChanAck,
    ) -> Result<(), Error> {
        let opening = self
            .opening
            .lock()
            .await
            .remove(&peer)
            .ok_or(Error::NoPendingOpen(peer))?;
        match self.complete_open(peer, &opening.open, &ack).await {
            Ok(outpoint) => {
                info!(peer, channel = %outpoint, "channel opened");
                let _ = opening.done.send(Ok(outpoint));
                Ok(())
            }
            Err(err) => {
                let _ = opening.done.send(Err(err.clone()));
                Err(err)
            }
        }
    }

    async fn complete_open(
        &self,
        peer: u32,
        open: &PendingOpen,
        ack: &ChanAck,
    ) -> Result<OutPoint, Error> {
        let (channel, proof) = open.complete(ack, &self.keychain, &self.policy)?;
        let outpoint = channel.outpoint();
        self.store.save_channel(&channel).await?;
        self.register(channel).await;
        self.wallet.really_send(outpoint).await?;
        self.wallet.watch_outpoint(outpoint).await?;
        self.send(peer, proof.into()).await?;
        Ok(outpoint)
    }

    pub(super) async fn on_sig_proof(
        &self,
        peer: u32,
        proof: SigProof,
    ) -> Result<(), Error> {
        let handle = self.handle(proof.outpoint).await?;
        let mut chan = handle.lock().await;
        if chan.key_gen().peer_idx() != peer {
            return Err(Error::WrongPeer {
                channel: proof.outpoint,
                peer,
            });
        }
        let keys = self.keys(&chan)?;
        let accepted = chan.accept_sig_proof(&proof, &keys.elk_snd)?;
        self.commit(&mut chan, accepted).await?;
        debug!(channel = %proof.outpoint, "funder signature stored");
        Ok(())
    }
}
