//! Trait seams to the external collaborators.
//!
//! The replication layer consumes an append-only log, a messaging
//! facility and a local identity; all three are specified here only by
//! the interface the core needs. Implementations live outside this
//! workspace (the production node) or in test doubles.

use async_trait::async_trait;

use crate::hash::EntryHash;
use crate::messages::{DeliveryMode, ReplicationMessage};
use crate::peer::PeerId;

/// The slice of a log entry the replication layer looks at.
///
/// The full entry (hash links, signatures, clock) stays with the log; the
/// replication layer only needs a stable hash, the grouping key the hash
/// domain shards by, and a wall-clock stamp for the time domain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub hash: EntryHash,
    /// Grouping key: entries sharing it map to the same coordinate under
    /// the hash domain (so causally-related entries co-locate).
    pub group_key: Vec<u8>,
    /// Creation wall-clock time in milliseconds.
    pub wall_clock_ms: u64,
    pub payload: Vec<u8>,
}

impl Entry {
    #[must_use]
    pub fn new(group_key: Vec<u8>, wall_clock_ms: u64, payload: Vec<u8>) -> Self {
        let mut preimage = Vec::with_capacity(group_key.len() + 8 + payload.len());
        preimage.extend_from_slice(&group_key);
        preimage.extend_from_slice(&wall_clock_ms.to_le_bytes());
        preimage.extend_from_slice(&payload);
        Self {
            hash: EntryHash::digest(&preimage),
            group_key,
            wall_clock_ms,
            payload,
        }
    }

    /// Group identifier: the digest of the grouping key.
    #[must_use]
    pub fn group(&self) -> EntryHash {
        EntryHash::digest(&self.group_key)
    }
}

/// The append-only causal log, as consumed by the replication layer.
#[async_trait]
pub trait EntryLog: Send + Sync {
    async fn append(&self, entry: Entry) -> eyre::Result<()>;

    async fn get(&self, hash: &EntryHash) -> eyre::Result<Option<Entry>>;

    async fn has(&self, hash: &EntryHash) -> eyre::Result<bool>;

    /// Presence check against the log's block storage, cheaper than
    /// [`Self::get`] when only existence matters.
    async fn has_block(&self, hash: &EntryHash) -> eyre::Result<bool>;

    /// Current heads of the causal log.
    async fn heads(&self) -> eyre::Result<Vec<EntryHash>>;

    /// Fetch entries this peer lacks from `from`, through the log's own
    /// block exchange. Hashes the peer could not serve are simply absent
    /// from the result.
    async fn fetch(&self, hashes: &[EntryHash], from: PeerId) -> eyre::Result<Vec<Entry>>;

    /// Materialize the whole log. Used when seeding reconciliation state.
    async fn to_vec(&self) -> eyre::Result<Vec<Entry>>;
}

/// The point-to-point / broadcast messaging substrate.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// `targets` is ignored for [`DeliveryMode::Broadcast`].
    async fn send(
        &self,
        message: ReplicationMessage,
        mode: DeliveryMode,
        targets: &[PeerId],
    ) -> eyre::Result<()>;
}

/// Cryptographic identity of the local peer.
pub trait LocalIdentity: Send + Sync {
    fn public_key(&self) -> PeerId;
}
