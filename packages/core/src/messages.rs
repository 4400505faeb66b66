//! Replication message schemas.
//!
//! These are logical shapes only: the transport chooses framing and codec.
//! Each message carries a numeric `kind` discriminant (exposed as an
//! associated constant and via [`Message::kind`]) so transports that frame
//! by kind can route without deserializing the body. The serde data model
//! is the compatibility contract; the round-trip tests pin it against
//! `MsgPack` as the reference codec.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::hlc::Hlc;
use crate::value::Value;

/// Column-name to value mapping inside a patch.
///
/// Ordered so that SQL built from a delta is deterministic across peers.
pub type Delta = BTreeMap<String, Value>;

/// One logical write to one row; the authoritative unit of replication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// HLC timestamp assigned by the writing peer.
    pub at: Hlc,
    /// Id of the peer that produced the patch.
    pub peer: i64,
    /// The producing peer's sequence number for this patch.
    pub seq: i64,
    /// Schema version of the producing peer at write time.
    pub schema_version: i64,
    /// Base table the patch applies to.
    pub table: String,
    /// Column values; must include the table's primary key.
    pub delta: Delta,
}

impl Patch {
    /// Wire discriminant for patch messages.
    pub const KIND: u8 = 10;
}

/// Periodic liveness beacon carrying the sender's local high-water marks.
///
/// Lets receivers detect that *they* are missing patches from the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    /// Id of the sending peer.
    pub peer: i64,
    /// Timestamp of the sender's most recent local patch.
    pub last_at: Hlc,
    /// Sequence number of the sender's most recent local patch.
    pub last_seq: i64,
}

impl Ping {
    /// Wire discriminant for ping messages.
    pub const KIND: u8 = 20;
}

/// Retransmission request for a gap in a peer's sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingPatchRequest {
    /// Peer whose patches are missing (the addressee, which should resend).
    pub peer: i64,
    /// First missing sequence number, inclusive.
    pub min_seq: i64,
    /// Last requested sequence number, inclusive.
    pub max_seq: i64,
    /// Peer issuing the request.
    pub for_peer: i64,
}

impl MissingPatchRequest {
    /// Wire discriminant for missing-patch requests.
    pub const KIND: u8 = 30;
}

/// Envelope over every replication message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Message {
    /// A replicated write.
    Patch(Patch),
    /// A liveness beacon.
    Ping(Ping),
    /// A retransmission request.
    MissingPatchRequest(MissingPatchRequest),
}

impl Message {
    /// Returns the numeric wire discriminant of the wrapped message.
    #[must_use]
    pub fn kind(&self) -> u8 {
        match self {
            Message::Patch(_) => Patch::KIND,
            Message::Ping(_) => Ping::KIND,
            Message::MissingPatchRequest(_) => MissingPatchRequest::KIND,
        }
    }
}
