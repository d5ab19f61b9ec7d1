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
use tokio::sync::{Mutex, MutexGuard, Semaphore};

use crate::channel::Channel;

/// Shared handle of a single channel: the channel record behind an
/// exclusive lock and the clear-to-send slot.
///
/// The slot is taken by a local operation starting an update round and
/// given back by the message handler once the round completes, so at most
/// one round initiated by us is in flight. Taking the slot once more and
/// dropping it at once is how the initiator waits for the completion.
#[derive(Debug)]
pub struct ChannelHandle {
    channel: Mutex<Channel>,
    clear_to_send: Semaphore,
}

impl ChannelHandle {
    pub fn new(channel: Channel) -> ChannelHandle {
        ChannelHandle {
            channel: Mutex::new(channel),
            clear_to_send: Semaphore::new(1),
        }
    }

    #[inline]
    pub async fn lock(&self) -> MutexGuard<'_, Channel> {
        self.channel.lock().await
    }

    /// Waits until no round initiated by us is in flight and takes the slot
    pub async fn take(&self) {
        if let Ok(permit) = self.clear_to_send.acquire().await {
            permit.forget();
        }
    }

    /// Takes the slot unless it is already taken
    pub fn try_take(&self) -> bool {
        match self.clear_to_send.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Returns the slot; no-op if it is free already
    pub fn give(&self) {
        if self.clear_to_send.available_permits() == 0 {
            self.clear_to_send.add_permits(1);
        }
    }

    /// Waits for the slot to be given back, leaving it free
    pub async fn wait_clear(&self) {
        let _permit = self.clear_to_send.acquire().await;
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::channel::fund::test::open_pair;

    #[tokio::test]
    async fn single_slot() {
        let (a, _) = open_pair(1_000_000, 0);
        let handle = ChannelHandle::new(a.chan);
        assert!(handle.try_take());
        assert!(!handle.try_take());
        handle.give();
        handle.give();
        assert!(handle.try_take());
        assert!(!handle.try_take());
    }

    #[tokio::test]
    async fn completion_wakes_initiator() {
        let (a, _) = open_pair(1_000_000, 0);
        let handle = Arc::new(ChannelHandle::new(a.chan));
        handle.take().await;

        let waiter = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.wait_clear().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        handle.give();
        waiter.await.unwrap();
        assert!(handle.try_take());
    }
}
