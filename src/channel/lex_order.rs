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

//! Canonical (BIP-69) ordering of transaction inputs and outputs, making
//! transactions built independently by both channel parties byte-identical.

use std::cmp::Ordering;

use bitcoin::{Transaction, TxIn, TxOut};

pub trait LexOrder {
    fn lex_order(&mut self);

    fn lex_ordered(mut self) -> Self
    where
        Self: Sized,
    {
        self.lex_order();
        self
    }
}

fn cmp_inputs(a: &TxIn, b: &TxIn) -> Ordering {
    // txids compare in their reversed (displayed) byte order
    let a_txid = a.previous_output.txid[..].iter().rev();
    let b_txid = b.previous_output.txid[..].iter().rev();
    a_txid
        .cmp(b_txid)
        .then(a.previous_output.vout.cmp(&b.previous_output.vout))
}

fn cmp_outputs(a: &TxOut, b: &TxOut) -> Ordering {
    a.value
        .cmp(&b.value)
        .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
}

impl LexOrder for Vec<TxIn> {
    #[inline]
    fn lex_order(&mut self) {
        self.sort_by(cmp_inputs)
    }
}

impl LexOrder for Vec<TxOut> {
    #[inline]
    fn lex_order(&mut self) {
        self.sort_by(cmp_outputs)
    }
}

impl LexOrder for Vec<bitcoin::PublicKey> {
    #[inline]
    fn lex_order(&mut self) {
        self.sort_by_key(|key| key.to_bytes())
    }
}

impl LexOrder for Transaction {
    fn lex_order(&mut self) {
        self.input.lex_order();
        self.output.lex_order();
    }
}
