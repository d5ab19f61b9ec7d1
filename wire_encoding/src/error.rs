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

use amplify::IoError;

#[derive(Clone, PartialEq, Eq, Hash, Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// I/O error
    #[from(std::io::Error)]
    #[from(std::io::ErrorKind)]
    #[display(inner)]
    Io(IoError),

    /// message body has {actual} bytes while exactly {expected} bytes are
    /// required
    LengthMismatch { expected: usize, actual: usize },

    /// not all provided data were consumed during decoding process
    DataNotEntirelyConsumed,

    /// invalid compressed public key encoding
    InvalidPubkey,

    /// invalid compact signature encoding
    InvalidSignature,

    /// message contains no type byte
    EmptyMessage,

    /// unknown message type {0}
    UnknownMessageType(u8),

    /// Custom type-specific error
    #[display(inner)]
    DataIntegrityError(String),
}
