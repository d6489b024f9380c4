//! Wire protocol types for the replication layer.
//!
//! All messages are borsh-encoded and carried by the external messaging
//! collaborator; the replication layer never opens sockets itself.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::error::ReplicationError;
use crate::hash::EntryHash;
use crate::range::ReplicationRange;
use crate::ring::Span;

/// Wire protocol version.
///
/// Increment on breaking changes so peers can detect incompatibility.
pub const REPLICATION_PROTOCOL_VERSION: u32 = 1;

/// Size of a coded-symbol payload: 32-byte entry hash + 8-byte coordinate.
pub const SYMBOL_PAYLOAD_LEN: usize = 40;

/// One rateless coded symbol.
///
/// `sum` is the XOR of the payloads of every item mapped to this symbol,
/// `checksum` the XOR of their truncated SHA-256 digests, `count` the
/// signed number of items folded in. The decoder peels symbols whose
/// `count` is `±1` and whose checksum matches the payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct WireSymbol {
    pub sum: [u8; SYMBOL_PAYLOAD_LEN],
    pub checksum: [u8; 8],
    pub count: i64,
}

/// How a message should be delivered by the messaging collaborator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Gossip to every subscriber of the shared log.
    Broadcast,
    /// Point-to-point to the listed peers only.
    Direct,
}

/// Every message exchanged by the replication layer.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub enum ReplicationMessage {
    /// Announce (or re-announce) ranges owned by the sender.
    RangeAnnouncement { ranges: Vec<ReplicationRange> },

    /// Ask a peer to announce its current ranges.
    ReplicationInfoRequest,

    /// Simple path: "you may be missing these", ordered by descending
    /// priority.
    MaybeMissing { hashes: Vec<EntryHash> },

    /// Open a coded-symbol reconciliation round over `span`.
    SyncStart {
        span: Span,
        symbols: Vec<WireSymbol>,
    },

    /// Follow-up request for more symbols when decoding was inconclusive.
    SyncSymbolRequest { span: Span, count: u32 },

    /// Follow-up batch of symbols for an in-flight session.
    SyncSymbols {
        span: Span,
        symbols: Vec<WireSymbol>,
    },

    /// The receiving side of a coded-symbol session is done with it,
    /// whether it resolved or ran out of rounds; the initiator drops its
    /// encoder state for `span`.
    SyncDone { span: Span },
}

impl ReplicationMessage {
    /// Encode for the wire. Infallible for these types in practice; an
    /// allocation failure is the only error path.
    pub fn to_bytes(&self) -> std::io::Result<Vec<u8>> {
        borsh::to_vec(self)
    }

    /// Decode a peer-sourced message.
    ///
    /// Malformed input maps to [`ReplicationError::ProtocolDecode`]; the
    /// caller drops the message and resets that peer's sessions.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ReplicationError> {
        Self::try_from_slice(bytes)
            .map_err(|err| ReplicationError::ProtocolDecode(err.to_string()))
    }
}
