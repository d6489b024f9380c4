//! Per-peer synchronization bookkeeping.
//!
//! Counters only, no control flow: the manager records what happened and
//! operators read it back through `sync_stats`. Reset on peer departure.

use std::collections::HashMap;

use driftlog_primitives::PeerId;

/// Counters for one peer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PeerSyncStats {
    /// Offers we initiated toward the peer.
    pub offers_sent: u64,
    /// Entries the peer reported that we asked the log to fetch.
    pub fetches_requested: u64,
    /// Entries the log actually delivered for those requests.
    pub entries_fetched: u64,
    /// Malformed messages dropped from the peer.
    pub decode_failures: u64,
}

/// Per-peer counter table.
#[derive(Debug, Default)]
pub struct SyncTracker {
    per_peer: HashMap<PeerId, PeerSyncStats>,
}

impl SyncTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_offer(&mut self, peer: PeerId) {
        self.per_peer.entry(peer).or_default().offers_sent += 1;
    }

    pub fn record_fetch(&mut self, peer: PeerId, requested: usize, received: usize) {
        let stats = self.per_peer.entry(peer).or_default();
        stats.fetches_requested += requested as u64;
        stats.entries_fetched += received as u64;
    }

    pub fn record_decode_failure(&mut self, peer: PeerId) {
        self.per_peer.entry(peer).or_default().decode_failures += 1;
    }

    #[must_use]
    pub fn get(&self, peer: &PeerId) -> PeerSyncStats {
        self.per_peer.get(peer).copied().unwrap_or_default()
    }

    #[must_use]
    pub fn snapshot(&self) -> Vec<(PeerId, PeerSyncStats)> {
        let mut stats: Vec<_> = self.per_peer.iter().map(|(p, s)| (*p, *s)).collect();
        stats.sort_by_key(|(peer, _)| *peer);
        stats
    }

    /// Forget a departed peer.
    pub fn forget(&mut self, peer: &PeerId) {
        let _ = self.per_peer.remove(peer);
    }
}
