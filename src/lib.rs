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

//! Bidirectional payment channels revoked with elkrem hash trees.
//!
//! Two parties lock funds into a 2-of-2 output and then exchange signed
//! commitment transactions for every balance update. Each superseded
//! commitment is revoked by disclosing a hash from the elkrem tree, which
//! lets the honest party sweep the revocable output with a justice
//! transaction should the old state ever be published.

#![recursion_limit = "256"]
// Coding conventions
#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code,
    //missing_docs
)]

#[macro_use]
extern crate amplify;
#[macro_use]
extern crate qchan_encoding;

#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_with;
#[cfg(feature = "serde")]
#[macro_use]
extern crate serde_crate as serde;

pub mod channel;
pub mod elkrem;
pub mod hakd;
pub mod keygen;
pub mod node;
pub mod wire;

pub use channel::{Channel, ChannelInfo, Policy};
pub use node::{MemStore, Node, Store, Transport, Wallet};
