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

//! Peer messages of the channel protocol.
//!
//! Each message is a one-byte type followed by a fixed-layout body; all
//! integers are big-endian, points are 33-byte compressed keys and
//! signatures are 64-byte compact ones.

use bitcoin::hashes::sha256d;
use bitcoin::OutPoint;
use qchan_encoding::{Error, FixedSize, WireDecode, WireEncode};
use secp256k1::ecdsa::Signature;
use secp256k1::PublicKey;

pub const MSGID_POINTREQ: u8 = 0x30;
pub const MSGID_POINTRESP: u8 = 0x31;
pub const MSGID_CHANDESC: u8 = 0x32;
pub const MSGID_CHANACK: u8 = 0x33;
pub const MSGID_SIGPROOF: u8 = 0x34;
pub const MSGID_CLOSEREQ: u8 = 0x40;
pub const MSGID_DELTASIG: u8 = 0x80;
pub const MSGID_SIGREV: u8 = 0x81;
pub const MSGID_REV: u8 = 0x82;
pub const MSGID_GAPSIGREV: u8 = 0x83;
pub const MSGID_HASHSIG: u8 = 0x84;
pub const MSGID_PREIMAGESIG: u8 = 0x85;

wire_message! {
    /// Request for channel keys, opening a new channel
    pub struct PointReq {}
    display("point_req");
}

wire_message! {
    /// Keys the responder will use in the new channel
    pub struct PointResp {
        pub channel_pubkey: PublicKey,
        pub refund_pubkey: PublicKey,
        pub hakd_base: PublicKey,
    }
    display("point_resp({}, ...)", channel_pubkey);
}

wire_message! {
    /// Channel description sent by the funder once the funding output exists
    pub struct ChanDesc {
        pub outpoint: OutPoint,
        pub pubkey: PublicKey,
        pub refund_pubkey: PublicKey,
        pub hakd_base: PublicKey,
        pub capacity: u64,
        pub initial_pay: u64,
        /// Elkrem points of the funder for states 0, 1 and 2
        pub elk_zero: PublicKey,
        pub elk_one: PublicKey,
        pub elk_two: PublicKey,
    }
    display("chan_desc({}, {}, {}, ...)", outpoint, capacity, initial_pay);
}

wire_message! {
    /// Responder acknowledgement carrying its elkrem points and signature
    /// for the funder's first commitment
    pub struct ChanAck {
        pub outpoint: OutPoint,
        pub elk_zero: PublicKey,
        pub elk_one: PublicKey,
        pub elk_two: PublicKey,
        pub signature: Signature,
    }
    display("chan_ack({}, ...)", outpoint);
}

wire_message! {
    /// Funder signature for the responder's first commitment
    pub struct SigProof {
        pub outpoint: OutPoint,
        pub signature: Signature,
    }
    display("sig_proof({}, ...)", outpoint);
}

wire_message! {
    /// Cooperative close request signed by the initiator
    pub struct CloseReq {
        pub outpoint: OutPoint,
        pub signature: Signature,
    }
    display("close_req({}, ...)", outpoint);
}

wire_message! {
    /// Pushes `delta` to the counterparty, signing its next commitment
    pub struct DeltaSig {
        pub outpoint: OutPoint,
        pub delta: u32,
        pub signature: Signature,
    }
    display("delta_sig({}, {}, ...)", outpoint, delta);
}

wire_message! {
    /// Signature for the next commitment plus revocation of the previous one
    pub struct SigRev {
        pub outpoint: OutPoint,
        pub signature: Signature,
        pub elk: sha256d::Hash,
        pub n2_elk_point: PublicKey,
    }
    display("sig_rev({}, {}, ...)", outpoint, elk);
}

wire_message! {
    /// Same as [`SigRev`], but the signed commitment also includes the
    /// receiver's colliding update
    pub struct GapSigRev {
        pub outpoint: OutPoint,
        pub signature: Signature,
        pub elk: sha256d::Hash,
        pub n2_elk_point: PublicKey,
    }
    display("gap_sig_rev({}, {}, ...)", outpoint, elk);
}

wire_message! {
    /// Revocation finishing an update round
    pub struct Rev {
        pub outpoint: OutPoint,
        pub elk: sha256d::Hash,
        pub n2_elk_point: PublicKey,
    }
    display("rev({}, {}, ...)", outpoint, elk);
}

wire_message! {
    /// Offers an HTLC, signing the counterparty's next commitment
    pub struct HashSig {
        pub outpoint: OutPoint,
        pub amount: u32,
        pub locktime: u32,
        pub rhash: [u8; 32],
        pub signature: Signature,
        pub data: [u8; 32],
    }
    display("hash_sig({}, {}, {}, ...)", outpoint, amount, locktime);
}

wire_message! {
    /// Clears an HTLC with its preimage or, when the preimage is all
    /// zeroes, by timeout
    pub struct PreimageSig {
        pub outpoint: OutPoint,
        pub idx: u32,
        pub preimage: [u8; 16],
        pub signature: Signature,
        pub data: [u8; 32],
    }
    display("preimage_sig({}, {}, ...)", outpoint, idx);
}

/// All messages of the channel protocol
#[derive(Clone, PartialEq, Eq, Debug, Display, From)]
#[display(inner)]
pub enum Messages {
    // Channel establishment
    #[from]
    PointReq(PointReq),
    #[from]
    PointResp(PointResp),
    #[from]
    ChanDesc(ChanDesc),
    #[from]
    ChanAck(ChanAck),
    #[from]
    SigProof(SigProof),

    // Channel closing
    #[from]
    CloseReq(CloseReq),

    // State updates
    #[from]
    DeltaSig(DeltaSig),
    #[from]
    SigRev(SigRev),
    #[from]
    Rev(Rev),
    #[from]
    GapSigRev(GapSigRev),
    #[from]
    HashSig(HashSig),
    #[from]
    PreimageSig(PreimageSig),
}

impl Messages {
    pub fn msg_type(&self) -> u8 {
        match self {
            Messages::PointReq(_) => MSGID_POINTREQ,
            Messages::PointResp(_) => MSGID_POINTRESP,
            Messages::ChanDesc(_) => MSGID_CHANDESC,
            Messages::ChanAck(_) => MSGID_CHANACK,
            Messages::SigProof(_) => MSGID_SIGPROOF,
            Messages::CloseReq(_) => MSGID_CLOSEREQ,
            Messages::DeltaSig(_) => MSGID_DELTASIG,
            Messages::SigRev(_) => MSGID_SIGREV,
            Messages::Rev(_) => MSGID_REV,
            Messages::GapSigRev(_) => MSGID_GAPSIGREV,
            Messages::HashSig(_) => MSGID_HASHSIG,
            Messages::PreimageSig(_) => MSGID_PREIMAGESIG,
        }
    }

    /// Funding outpoint of the channel the message belongs to; `None` for
    /// messages sent before the channel exists
    pub fn outpoint(&self) -> Option<OutPoint> {
        match self {
            Messages::PointReq(_) | Messages::PointResp(_) => None,
            Messages::ChanDesc(msg) => Some(msg.outpoint),
            Messages::ChanAck(msg) => Some(msg.outpoint),
            Messages::SigProof(msg) => Some(msg.outpoint),
            Messages::CloseReq(msg) => Some(msg.outpoint),
            Messages::DeltaSig(msg) => Some(msg.outpoint),
            Messages::SigRev(msg) => Some(msg.outpoint),
            Messages::Rev(msg) => Some(msg.outpoint),
            Messages::GapSigRev(msg) => Some(msg.outpoint),
            Messages::HashSig(msg) => Some(msg.outpoint),
            Messages::PreimageSig(msg) => Some(msg.outpoint),
        }
    }

    /// Message opens an update round
    pub fn is_proposal(&self) -> bool {
        matches!(
            self,
            Messages::DeltaSig(_) | Messages::HashSig(_) | Messages::PreimageSig(_)
        )
    }

    /// Type byte followed by the message body
    pub fn serialize(&self) -> Vec<u8> {
        let mut data = vec![self.msg_type()];
        let body = match self {
            Messages::PointReq(msg) => msg.wire_serialize(),
            Messages::PointResp(msg) => msg.wire_serialize(),
            Messages::ChanDesc(msg) => msg.wire_serialize(),
            Messages::ChanAck(msg) => msg.wire_serialize(),
            Messages::SigProof(msg) => msg.wire_serialize(),
            Messages::CloseReq(msg) => msg.wire_serialize(),
            Messages::DeltaSig(msg) => msg.wire_serialize(),
            Messages::SigRev(msg) => msg.wire_serialize(),
            Messages::Rev(msg) => msg.wire_serialize(),
            Messages::GapSigRev(msg) => msg.wire_serialize(),
            Messages::HashSig(msg) => msg.wire_serialize(),
            Messages::PreimageSig(msg) => msg.wire_serialize(),
        };
        data.extend(body);
        data
    }

    /// Parses a message; the body length must exactly match the layout of
    /// the message type
    pub fn deserialize(data: &[u8]) -> Result<Messages, Error> {
        let (msg_type, body) =
            data.split_first().ok_or(Error::EmptyMessage)?;
        let expected = body_len(*msg_type)
            .ok_or(Error::UnknownMessageType(*msg_type))?;
        if body.len() != expected {
            return Err(Error::LengthMismatch {
                expected,
                actual: body.len(),
            });
        }
        Ok(match *msg_type {
            MSGID_POINTREQ => PointReq::wire_deserialize(body)?.into(),
            MSGID_POINTRESP => PointResp::wire_deserialize(body)?.into(),
            MSGID_CHANDESC => ChanDesc::wire_deserialize(body)?.into(),
            MSGID_CHANACK => ChanAck::wire_deserialize(body)?.into(),
            MSGID_SIGPROOF => SigProof::wire_deserialize(body)?.into(),
            MSGID_CLOSEREQ => CloseReq::wire_deserialize(body)?.into(),
            MSGID_DELTASIG => DeltaSig::wire_deserialize(body)?.into(),
            MSGID_SIGREV => SigRev::wire_deserialize(body)?.into(),
            MSGID_REV => Rev::wire_deserialize(body)?.into(),
            MSGID_GAPSIGREV => GapSigRev::wire_deserialize(body)?.into(),
            MSGID_HASHSIG => HashSig::wire_deserialize(body)?.into(),
            MSGID_PREIMAGESIG => PreimageSig::wire_deserialize(body)?.into(),
            unknown => return Err(Error::UnknownMessageType(unknown)),
        })
    }
}

/// Body length of the message with type `msg_type`
pub fn body_len(msg_type: u8) -> Option<usize> {
    Some(match msg_type {
        MSGID_POINTREQ => PointReq::LEN,
        MSGID_POINTRESP => PointResp::LEN,
        MSGID_CHANDESC => ChanDesc::LEN,
        MSGID_CHANACK => ChanAck::LEN,
        MSGID_SIGPROOF => SigProof::LEN,
        MSGID_CLOSEREQ => CloseReq::LEN,
        MSGID_DELTASIG => DeltaSig::LEN,
        MSGID_SIGREV => SigRev::LEN,
        MSGID_REV => Rev::LEN,
        MSGID_GAPSIGREV => GapSigRev::LEN,
        MSGID_HASHSIG => HashSig::LEN,
        MSGID_PREIMAGESIG => PreimageSig::LEN,
        _ => return None,
    })
}
