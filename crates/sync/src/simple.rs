//! Exact synchronizer: explicit "maybe missing" hash lists.
//!
//! The cheapest strategy for small candidate sets: enumerate the hashes a
//! peer might be missing, highest priority first, and let the receiver
//! check local presence and fetch what it lacks. No per-peer protocol
//! state beyond each peer's deferred-overflow queue.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use driftlog_primitives::{
    DeliveryMode, EntryHash, Messenger, PeerId, ReplicationMessage, Resolution, Span,
};
use tracing::{debug, warn};

use crate::synchronizer::{
    order_candidates, SessionKey, SyncContext, SyncStep, SyncTuning, Synchronizer,
    SynchronizerKind,
};

pub struct SimpleSynchronizer {
    messenger: Arc<dyn Messenger>,
    tuning: SyncTuning,
    /// Candidates that overflowed the batch cap, waiting per peer for the
    /// next coalesced cycle. Keyed by peer so deferral from one peer's
    /// batch never leaks into another's.
    deferred: BTreeMap<PeerId, VecDeque<EntryHash>>,
}

impl SimpleSynchronizer {
    #[must_use]
    pub fn new(messenger: Arc<dyn Messenger>, tuning: SyncTuning) -> Self {
        Self {
            messenger,
            tuning,
            deferred: BTreeMap::new(),
        }
    }

    /// Drain a peer's deferred candidates into the front of its next
    /// batch, dropping duplicates wherever they sit.
    fn take_batch(&mut self, peer: &PeerId, ordered: &[EntryHash]) -> Vec<EntryHash> {
        let mut batch: Vec<EntryHash> = self
            .deferred
            .remove(peer)
            .map(Vec::from)
            .unwrap_or_default();
        batch.extend_from_slice(ordered);
        let mut seen = HashSet::new();
        batch.retain(|hash| seen.insert(*hash));
        if batch.len() > self.tuning.max_simple_entries {
            let overflow = batch.split_off(self.tuning.max_simple_entries);
            debug!(%peer, deferred = overflow.len(), "simple sync batch overflow");
            let _ = self.deferred.insert(*peer, overflow.into());
        }
        batch
    }
}

#[async_trait]
impl Synchronizer for SimpleSynchronizer {
    fn kind(&self) -> SynchronizerKind {
        SynchronizerKind::Simple
    }

    async fn offer(
        &mut self,
        ctx: &SyncContext<'_>,
        _span: Span,
        candidates: &[EntryHash],
        targets: &[PeerId],
    ) -> eyre::Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        let ordered = order_candidates(ctx.entries, &self.tuning.priority, candidates);
        for peer in targets {
            let batch = self.take_batch(peer, &ordered);
            if batch.is_empty() {
                continue;
            }
            debug!(count = batch.len(), %peer, "sending maybe-missing notice");
            self.messenger
                .send(
                    ReplicationMessage::MaybeMissing { hashes: batch },
                    DeliveryMode::Direct,
                    &[*peer],
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        ctx: &SyncContext<'_>,
        from: PeerId,
        message: &ReplicationMessage,
    ) -> eyre::Result<SyncStep> {
        let ReplicationMessage::MaybeMissing { hashes } = message else {
            warn!(%from, "simple synchronizer got an unexpected message");
            return Ok(SyncStep::default());
        };
        let fetch: Vec<EntryHash> = hashes
            .iter()
            .filter(|hash| !ctx.entries.contains(hash))
            .copied()
            .collect();
        if !fetch.is_empty() {
            debug!(%from, missing = fetch.len(), "peer offered entries we lack");
        }
        Ok(SyncStep { fetch })
    }

    // Hash lists carry no cached span state to invalidate. Deferred
    // candidates that vanish before the next cycle are filtered out at
    // send time by the receiver's presence check.
    fn on_entry_added(&mut self, _resolution: Resolution, _coordinate: u64) {}

    fn on_entry_removed(&mut self, _resolution: Resolution, _coordinate: u64) {}

    fn on_peer_disconnected(&mut self, peer: &PeerId) {
        let _ = self.deferred.remove(peer);
    }

    fn pending(&self) -> usize {
        self.deferred.values().map(VecDeque::len).sum()
    }

    fn sessions(&self) -> Vec<SessionKey> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use driftlog_replication::{EntryIndex, EntryMeta};

    use super::*;
    use crate::synchronizer::default_priority;

    #[derive(Default)]
    struct RecordingMessenger {
        sent: Mutex<Vec<(ReplicationMessage, Vec<PeerId>)>>,
    }

    #[async_trait]
    impl Messenger for RecordingMessenger {
        async fn send(
            &self,
            message: ReplicationMessage,
            _mode: DeliveryMode,
            targets: &[PeerId],
        ) -> eyre::Result<()> {
            self.sent.lock().unwrap().push((message, targets.to_vec()));
            Ok(())
        }
    }

    fn meta(tag: u8, pinned: bool) -> EntryMeta {
        EntryMeta {
            hash: EntryHash::digest(&[tag]),
            coordinates: vec![u64::from(tag) * 100],
            group: EntryHash::digest(b"g"),
            boundary_pinned: pinned,
        }
    }

    fn ctx(entries: &EntryIndex) -> SyncContext<'_> {
        SyncContext {
            local: PeerId::from([0; 32]),
            resolution: Resolution::U32,
            entries,
        }
    }

    #[tokio::test]
    async fn batches_are_priority_ordered_with_stable_ties() {
        let mut entries = EntryIndex::new();
        let normal_a = meta(1, false);
        let normal_b = meta(2, false);
        let pinned = meta(3, true);
        for m in [&normal_a, &normal_b, &pinned] {
            entries.put(m.clone());
        }

        let messenger = Arc::new(RecordingMessenger::default());
        let mut sync = SimpleSynchronizer::new(messenger.clone(), SyncTuning::default());

        let candidates = vec![normal_b.hash, pinned.hash, normal_a.hash];
        sync.offer(
            &ctx(&entries),
            Span::full(),
            &candidates,
            &[PeerId::from([9; 32])],
        )
        .await
        .unwrap();

        let sent = messenger.sent.lock().unwrap();
        let (ReplicationMessage::MaybeMissing { hashes }, _) = &sent[0] else {
            panic!("expected maybe-missing");
        };
        assert_eq!(hashes[0], pinned.hash);
        // Ties in priority fall back to hash order.
        let mut tail = vec![normal_a.hash, normal_b.hash];
        tail.sort_unstable();
        assert_eq!(&hashes[1..], &tail);
    }

    #[tokio::test]
    async fn overflow_is_deferred_to_next_cycle() {
        let mut entries = EntryIndex::new();
        let metas: Vec<EntryMeta> = (1..=5).map(|tag| meta(tag, false)).collect();
        for m in &metas {
            entries.put(m.clone());
        }

        let messenger = Arc::new(RecordingMessenger::default());
        let tuning = SyncTuning {
            priority: default_priority(),
            max_simple_entries: 3,
        };
        let mut sync = SimpleSynchronizer::new(messenger.clone(), tuning);
        let candidates: Vec<EntryHash> = metas.iter().map(|m| m.hash).collect();
        let target = [PeerId::from([9; 32])];

        sync.offer(&ctx(&entries), Span::full(), &candidates, &target)
            .await
            .unwrap();
        assert_eq!(sync.pending(), 2);

        // Next cycle flushes the remainder first.
        sync.offer(&ctx(&entries), Span::full(), &[], &target)
            .await
            .unwrap();
        assert_eq!(sync.pending(), 0);

        let sent = messenger.sent.lock().unwrap();
        assert_eq!(sent.len(), 2);
        let (ReplicationMessage::MaybeMissing { hashes }, _) = &sent[1] else {
            panic!("expected maybe-missing");
        };
        assert_eq!(hashes.len(), 2);
    }

    #[tokio::test]
    async fn overflow_stays_with_its_peer() {
        let mut entries = EntryIndex::new();
        let metas: Vec<EntryMeta> = (1..=6).map(|tag| meta(tag, false)).collect();
        for m in &metas {
            entries.put(m.clone());
        }

        let messenger = Arc::new(RecordingMessenger::default());
        let tuning = SyncTuning {
            priority: default_priority(),
            max_simple_entries: 3,
        };
        let mut sync = SimpleSynchronizer::new(messenger.clone(), tuning);
        let peer_a = PeerId::from([8; 32]);
        let peer_b = PeerId::from([9; 32]);

        // Peer A's batch overflows by two.
        let for_a: Vec<EntryHash> = metas[..5].iter().map(|m| m.hash).collect();
        sync.offer(&ctx(&entries), Span::full(), &for_a, &[peer_a])
            .await
            .unwrap();
        assert_eq!(sync.pending(), 2);

        // A cycle aimed at peer B must not drain A's backlog into it.
        sync.offer(&ctx(&entries), Span::full(), &[metas[5].hash], &[peer_b])
            .await
            .unwrap();
        assert_eq!(sync.pending(), 2);

        let sent = messenger.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 2);
        let (ReplicationMessage::MaybeMissing { hashes }, targets) = &sent[1] else {
            panic!("expected maybe-missing");
        };
        assert_eq!(targets, &vec![peer_b]);
        assert_eq!(hashes, &vec![metas[5].hash]);
        drop(sent);

        // A's next cycle flushes A's remainder.
        sync.offer(&ctx(&entries), Span::full(), &[], &[peer_a])
            .await
            .unwrap();
        assert_eq!(sync.pending(), 0);
        let sent = messenger.sent.lock().unwrap();
        let (ReplicationMessage::MaybeMissing { hashes }, targets) = &sent[2] else {
            panic!("expected maybe-missing");
        };
        assert_eq!(targets, &vec![peer_a]);
        assert_eq!(hashes.len(), 2);
    }

    #[tokio::test]
    async fn deferred_hash_reoffered_is_sent_once() {
        let mut entries = EntryIndex::new();
        let metas: Vec<EntryMeta> = (1..=4).map(|tag| meta(tag, false)).collect();
        for m in &metas {
            entries.put(m.clone());
        }

        let messenger = Arc::new(RecordingMessenger::default());
        let tuning = SyncTuning {
            priority: default_priority(),
            max_simple_entries: 2,
        };
        let mut sync = SimpleSynchronizer::new(messenger.clone(), tuning);
        let target = [PeerId::from([9; 32])];

        let first: Vec<EntryHash> = metas[..3].iter().map(|m| m.hash).collect();
        sync.offer(&ctx(&entries), Span::full(), &first, &target)
            .await
            .unwrap();
        assert_eq!(sync.pending(), 1);

        // The deferred hash shows up again among the fresh candidates.
        let deferred = {
            let sent = messenger.sent.lock().unwrap();
            let (ReplicationMessage::MaybeMissing { hashes }, _) = &sent[0] else {
                panic!("expected maybe-missing");
            };
            let sent_set: Vec<EntryHash> = hashes.clone();
            first
                .iter()
                .copied()
                .find(|hash| !sent_set.contains(hash))
                .unwrap()
        };
        sync.offer(
            &ctx(&entries),
            Span::full(),
            &[deferred, metas[3].hash],
            &target,
        )
        .await
        .unwrap();

        let sent = messenger.sent.lock().unwrap();
        let (ReplicationMessage::MaybeMissing { hashes }, _) = &sent[1] else {
            panic!("expected maybe-missing");
        };
        assert_eq!(hashes.len(), 2);
        assert_eq!(hashes.iter().filter(|hash| **hash == deferred).count(), 1);
        assert!(hashes.contains(&metas[3].hash));
    }

    #[tokio::test]
    async fn disconnect_drops_deferred_backlog() {
        let mut entries = EntryIndex::new();
        let metas: Vec<EntryMeta> = (1..=3).map(|tag| meta(tag, false)).collect();
        for m in &metas {
            entries.put(m.clone());
        }

        let messenger = Arc::new(RecordingMessenger::default());
        let tuning = SyncTuning {
            priority: default_priority(),
            max_simple_entries: 1,
        };
        let mut sync = SimpleSynchronizer::new(messenger, tuning);
        let peer = PeerId::from([9; 32]);
        let candidates: Vec<EntryHash> = metas.iter().map(|m| m.hash).collect();

        sync.offer(&ctx(&entries), Span::full(), &candidates, &[peer])
            .await
            .unwrap();
        assert_eq!(sync.pending(), 2);
        sync.on_peer_disconnected(&peer);
        assert_eq!(sync.pending(), 0);
    }

    #[tokio::test]
    async fn receiver_reports_only_unknown_hashes() {
        let mut entries = EntryIndex::new();
        let known = meta(1, false);
        entries.put(known.clone());
        let unknown = EntryHash::digest(b"unknown");

        let messenger = Arc::new(RecordingMessenger::default());
        let mut sync = SimpleSynchronizer::new(messenger, SyncTuning::default());

        let step = sync
            .handle_message(
                &ctx(&entries),
                PeerId::from([9; 32]),
                &ReplicationMessage::MaybeMissing {
                    hashes: vec![known.hash, unknown],
                },
            )
            .await
            .unwrap();
        assert_eq!(step.fetch, vec![unknown]);
    }
}
