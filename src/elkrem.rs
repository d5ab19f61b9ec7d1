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

//! Elkrem: hash tree of per-state revocation secrets.
//!
//! The tree is numbered in post-order, so every node, internal ones
//! included, is the secret of exactly one state. The sender recomputes any
//! node from the root; the receiver keeps a stack of at most one node per
//! height, from which it can recompute every node it has ever been given.

use bitcoin::hashes::{sha256d, Hash, HashEngine};

/// Highest node index of the tree (2^48 - 2)
pub const MAX_INDEX: u64 = (1 << 48) - 2;

/// Height of the tree root
pub const MAX_HEIGHT: u8 = 47;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Display, Error)]
#[display(doc_comments)]
pub enum Error {
    /// node {wanted} can't be reached descending from node {from}
    Unreachable { wanted: u64, from: u64 },

    /// hash at index {0} is not the parent of the stored left child
    LeftChildMismatch(u64),

    /// hash at index {0} is not the parent of the stored right child
    RightChildMismatch(u64),

    /// receiver knows hashes up to index {up_to}, while index {wanted} was
    /// requested
    NotYetReceived { up_to: u64, wanted: u64 },

    /// receiver has not got any hashes yet
    Empty,

    /// elkrem tree is exhausted
    Exhausted,
}

/// Left child: `sha256d(parent‖0x00)`
pub fn left_sha(parent: sha256d::Hash) -> sha256d::Hash {
    child_sha(parent, 0x00)
}

/// Right child: `sha256d(parent‖0x01)`
pub fn right_sha(parent: sha256d::Hash) -> sha256d::Hash {
    child_sha(parent, 0x01)
}

fn child_sha(parent: sha256d::Hash, side: u8) -> sha256d::Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(&parent[..]);
    engine.input(&[side]);
    sha256d::Hash::from_engine(engine)
}

/// Walks down from node `i` of height `h` with hash `sha` to node `w`
fn descend(
    w: u64,
    mut i: u64,
    mut h: u8,
    mut sha: sha256d::Hash,
) -> Result<sha256d::Hash, Error> {
    let from = i;
    while w < i {
        if w <= i - (1 << h) {
            sha = left_sha(sha);
            i -= 1 << h;
        } else {
            sha = right_sha(sha);
            i -= 1;
        }
        if h == 0 {
            break;
        }
        h -= 1;
    }
    if w != i {
        return Err(Error::Unreachable { wanted: w, from });
    }
    Ok(sha)
}

/// Generator of own revocation hashes. Holds only the tree root.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ElkremSender {
    root: sha256d::Hash,
}

impl ElkremSender {
    pub fn new(root: sha256d::Hash) -> ElkremSender {
        ElkremSender { root }
    }

    /// Hash of node `w`
    pub fn at_index(&self, w: u64) -> Result<sha256d::Hash, Error> {
        descend(w, MAX_INDEX, MAX_HEIGHT, self.root)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ElkremNode {
    /// Height of the node
    pub h: u8,
    /// Post-order index of the node
    pub i: u64,
    pub sha: sha256d::Hash,
}

/// Store of counterparty revocation hashes
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default)]
#[cfg_attr(
    feature = "serde",
    derive(Serialize, Deserialize),
    serde(crate = "serde_crate")
)]
pub struct ElkremReceiver {
    nodes: Vec<ElkremNode>,
}

impl ElkremReceiver {
    pub fn new() -> ElkremReceiver {
        ElkremReceiver::default()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Index the next ingested hash will get
    pub fn next_index(&self) -> u64 {
        self.nodes.last().map(|node| node.i + 1).unwrap_or_default()
    }

    /// Highest index ingested so far; zero for the empty receiver
    pub fn up_to(&self) -> u64 {
        self.nodes.last().map(|node| node.i).unwrap_or_default()
    }

    /// Ingests the hash of the next node. When the new node is a parent of
    /// the two topmost stored nodes, they are checked to be its children
    /// and replaced by it. The receiver is left untouched on error.
    pub fn add_next(&mut self, sha: sha256d::Hash) -> Result<(), Error> {
        let i = self.next_index();
        if i > MAX_INDEX {
            return Err(Error::Exhausted);
        }
        let mut node = ElkremNode { h: 0, i, sha };
        if let [.., left, right] = self.nodes.as_slice() {
            if left.h == right.h {
                if left.sha != left_sha(sha) {
                    return Err(Error::LeftChildMismatch(i));
                }
                if right.sha != right_sha(sha) {
                    return Err(Error::RightChildMismatch(i));
                }
                node.h = right.h + 1;
                self.nodes.truncate(self.nodes.len() - 2);
            }
        }
        self.nodes.push(node);
        Ok(())
    }

    /// Recomputes hash of node `w` from the stored nodes
    pub fn at_index(&self, w: u64) -> Result<sha256d::Hash, Error> {
        let top = self.nodes.last().ok_or(Error::Empty)?;
        let node = self
            .nodes
            .iter()
            .find(|node| w <= node.i)
            .ok_or(Error::NotYetReceived {
                up_to: top.i,
                wanted: w,
            })?;
        descend(w, node.i, node.h, node.sha)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sender() -> ElkremSender {
        ElkremSender::new(sha256d::Hash::hash(b"elkrem test root"))
    }

    #[test]
    fn receiver_reproduces_sender() {
        let snd = sender();
        let mut rcv = ElkremReceiver::new();
        for n in 0..200 {
            rcv.add_next(snd.at_index(n).unwrap()).unwrap();
            assert_eq!(rcv.up_to(), n);
        }
        for n in 0..200 {
            assert_eq!(rcv.at_index(n), snd.at_index(n));
        }
        // logarithmic storage
        assert!(rcv.nodes.len() <= 8);
    }

    #[test]
    fn tree_shape() {
        let snd = sender();
        let parent = snd.at_index(2).unwrap();
        assert_eq!(snd.at_index(0).unwrap(), left_sha(parent));
        assert_eq!(snd.at_index(1).unwrap(), right_sha(parent));
        let grand = snd.at_index(6).unwrap();
        assert_eq!(parent, left_sha(grand));
        assert_eq!(snd.at_index(5).unwrap(), right_sha(grand));
        assert!(snd.at_index(MAX_INDEX).is_ok());
        assert!(snd.at_index(MAX_INDEX + 1).is_err());
    }

    #[test]
    fn bad_hash_rejected_without_mutation() {
        let snd = sender();
        let mut rcv = ElkremReceiver::new();
        rcv.add_next(snd.at_index(0).unwrap()).unwrap();
        rcv.add_next(snd.at_index(1).unwrap()).unwrap();
        let before = rcv.clone();

        // node 2 is the parent of 0 and 1
        let forged = sha256d::Hash::hash(b"forged");
        assert_eq!(rcv.add_next(forged), Err(Error::LeftChildMismatch(2)));
        assert_eq!(rcv, before);

        rcv.add_next(snd.at_index(2).unwrap()).unwrap();
        assert_eq!(rcv.up_to(), 2);
    }

    #[test]
    fn right_child_checked() {
        let other = ElkremSender::new(sha256d::Hash::hash(b"other root"));
        let snd = sender();
        let mut rcv = ElkremReceiver::new();
        rcv.add_next(snd.at_index(0).unwrap()).unwrap();
        rcv.add_next(other.at_index(1).unwrap()).unwrap();
        let before = rcv.clone();
        assert_eq!(
            rcv.add_next(snd.at_index(2).unwrap()),
            Err(Error::RightChildMismatch(2))
        );
        assert_eq!(rcv, before);
    }

    #[test]
    fn unknown_indexes() {
        let snd = sender();
        let mut rcv = ElkremReceiver::new();
        assert_eq!(rcv.at_index(0), Err(Error::Empty));
        assert_eq!(rcv.up_to(), 0);
        rcv.add_next(snd.at_index(0).unwrap()).unwrap();
        assert_eq!(
            rcv.at_index(1),
            Err(Error::NotYetReceived {
                up_to: 0,
                wanted: 1
            })
        );
    }

    #[test]
    fn random_roots() {
        for _ in 0..4 {
            let root = sha256d::Hash::from_inner(rand::random());
            let snd = ElkremSender::new(root);
            let mut rcv = ElkremReceiver::new();
            for n in 0..64 {
                rcv.add_next(snd.at_index(n).unwrap()).unwrap();
            }
            assert_eq!(rcv.at_index(37), snd.at_index(37));
        }
    }
}
