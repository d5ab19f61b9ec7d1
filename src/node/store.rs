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
//! Channel persistence.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bitcoin::OutPoint;
use tokio::sync::RwLock;

use super::Error;
use crate::channel::Channel;

/// Durable storage of channel records. A record must be saved before any
/// message derived from it leaves the node.
#[async_trait]
pub trait Store: Send + Sync {
    /// Inserts or replaces the record of the channel
    async fn save_channel(&self, channel: &Channel) -> Result<(), Error>;

    async fn load_channels(&self) -> Result<Vec<Channel>, Error>;

    async fn load_channel(
        &self,
        outpoint: OutPoint,
    ) -> Result<Option<Channel>, Error>;

    /// Allocates index of the next channel with `peer`, starting from 1
    async fn next_channel_idx(&self, peer: u32) -> Result<u32, Error>;
}

/// In-memory implementation of the channel store
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    channels: Arc<RwLock<HashMap<OutPoint, Channel>>>,

    /// Last allocated channel index per peer
    chan_idx: Arc<RwLock<HashMap<u32, u32>>>,
}

#[async_trait]
impl Store for MemStore {
    async fn save_channel(&self, channel: &Channel) -> Result<(), Error> {
        self.channels
            .write()
            .await
            .insert(channel.outpoint(), channel.clone());
        Ok(())
    }

    async fn load_channels(&self) -> Result<Vec<Channel>, Error> {
        Ok(self.channels.read().await.values().cloned().collect())
    }

    async fn load_channel(
        &self,
        outpoint: OutPoint,
    ) -> Result<Option<Channel>, Error> {
        Ok(self.channels.read().await.get(&outpoint).cloned())
    }

    async fn next_channel_idx(&self, peer: u32) -> Result<u32, Error> {
        let mut chan_idx = self.chan_idx.write().await;
        let idx = chan_idx.entry(peer).or_default();
        *idx += 1;
        Ok(*idx)
    }
}
