//! Core data model for the driftlog replication layer.
//!
//! This crate is dependency-light on purpose: it defines the coordinate
//! ring, replication ranges, entry metadata, wire messages and the error
//! taxonomy, plus the trait seams through which the replication layer talks
//! to its external collaborators (log, messaging, identity). Everything
//! higher up (`driftlog-replication`, `driftlog-sync`, `driftlog-node`)
//! builds on these types.

pub mod error;
pub mod hash;
pub mod messages;
pub mod peer;
pub mod range;
pub mod ring;
pub mod traits;

pub use error::ReplicationError;
pub use hash::EntryHash;
pub use messages::{
    DeliveryMode, ReplicationMessage, WireSymbol, REPLICATION_PROTOCOL_VERSION,
    SYMBOL_PAYLOAD_LEN,
};
pub use peer::PeerId;
pub use range::{boundary_winner, RangeId, RangeIntent, ReplicationRange};
pub use ring::{Coordinate, Resolution, Span};
pub use traits::{Entry, EntryLog, LocalIdentity, Messenger};
