//! The replication orchestrator.
//!
//! [`ReplicationManager`] wires the pure sharding state to the external
//! collaborators: it projects appended entries onto the ring, accumulates
//! changes, debounces their propagation through the configured
//! synchronizer, answers coverage queries and runs the adaptive
//! controller. One manager exists per opened shared log.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use driftlog_primitives::{
    Coordinate, DeliveryMode, Entry, EntryHash, EntryLog, LocalIdentity, Messenger, PeerId,
    RangeId, RangeIntent, ReplicationError, ReplicationMessage, ReplicationRange, Resolution,
    Span,
};
use driftlog_replication::{
    cover_set, coverage_fraction, CollectArgs, ControllerInputs, EntryIndex, EntryMeta,
    HashDomain, LogContext, RangeIndex, ReplicationController, ReplicationDomain,
    ReplicationRequest, TimeDomain,
};
use driftlog_sync::{
    default_priority, RatelessIbltSynchronizer, SimpleSynchronizer, SyncContext, SyncTuning,
    Synchronizer,
};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::accumulator::{ChangeAccumulator, EntryDelta};
use crate::config::{DomainSelection, ReplicationOptions, SynchronizerChoice};
use crate::tracking::{PeerSyncStats, SyncTracker};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

/// Everything guarded by the manager's single lock.
struct State {
    ranges: RangeIndex,
    entries: EntryIndex,
    synchronizer: Box<dyn Synchronizer>,
    controller: ReplicationController,
    accumulator: ChangeAccumulator,
    tracker: SyncTracker,
}

struct Inner {
    options: ReplicationOptions,
    resolution: Resolution,
    domain: Arc<dyn ReplicationDomain>,
    local: PeerId,
    log: Arc<dyn EntryLog>,
    messenger: Arc<dyn Messenger>,
    state: Mutex<State>,
    /// Wakes the debounced flush task.
    changed: Notify,
    shutdown: CancellationToken,
}

/// Handle to the replication layer of one shared log. Cheap to clone.
#[derive(Clone)]
pub struct ReplicationManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ReplicationManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationManager").finish_non_exhaustive()
    }
}

impl ReplicationManager {
    /// Open the replication layer with one of the built-in domains.
    pub async fn open(
        options: ReplicationOptions,
        identity: Arc<dyn LocalIdentity>,
        log: Arc<dyn EntryLog>,
        messenger: Arc<dyn Messenger>,
    ) -> eyre::Result<Self> {
        let domain: Arc<dyn ReplicationDomain> = match options.domain {
            DomainSelection::Hash => Arc::new(HashDomain::new(options.resolution)),
            DomainSelection::Time { origin_ms } => {
                Arc::new(TimeDomain::new(origin_ms, options.resolution)?)
            }
        };
        Self::open_with_domain(options, domain, identity, log, messenger).await
    }

    /// Open with a caller-provided domain. The domain's resolution must
    /// match the configured one; peers disagreeing on either cannot share
    /// a coordinate space.
    pub async fn open_with_domain(
        options: ReplicationOptions,
        domain: Arc<dyn ReplicationDomain>,
        identity: Arc<dyn LocalIdentity>,
        log: Arc<dyn EntryLog>,
        messenger: Arc<dyn Messenger>,
    ) -> eyre::Result<Self> {
        if domain.resolution() != options.resolution {
            return Err(ReplicationError::Configuration(format!(
                "domain '{}' runs at {:?} but the log was opened at {:?}",
                domain.kind(),
                domain.resolution(),
                options.resolution,
            ))
            .into());
        }

        let local = identity.public_key();
        let now = now_ms();
        let initial = domain.initial_range(&options.request, &LogContext { local, now_ms: now });
        let initial_factor =
            initial.map_or(0.0, |range| options.resolution.width_to_fraction(range.width));

        let mut ranges = RangeIndex::new();
        if let Some(range) = initial {
            let _ = ranges.insert(range, now);
        }

        let tuning = SyncTuning {
            priority: default_priority(),
            max_simple_entries: options.max_simple_entries,
        };
        let synchronizer: Box<dyn Synchronizer> = match options.synchronizer {
            SynchronizerChoice::Simple => {
                Box::new(SimpleSynchronizer::new(Arc::clone(&messenger), tuning))
            }
            SynchronizerChoice::RatelessIblt => {
                Box::new(RatelessIbltSynchronizer::new(Arc::clone(&messenger), tuning))
            }
        };
        let controller = ReplicationController::new(options.controller, initial_factor);

        let inner = Arc::new(Inner {
            resolution: options.resolution,
            options,
            domain,
            local,
            log,
            messenger,
            state: Mutex::new(State {
                ranges,
                entries: EntryIndex::new(),
                synchronizer,
                controller,
                accumulator: ChangeAccumulator::new(),
                tracker: SyncTracker::new(),
            }),
            changed: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        let manager = Self { inner };
        manager.spawn_flush_task();
        manager.announce().await?;
        Ok(manager)
    }

    fn spawn_flush_task(&self) {
        let inner = Arc::clone(&self.inner);
        drop(tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = inner.shutdown.cancelled() => break,
                    () = inner.changed.notified() => {}
                }
                tokio::time::sleep(Duration::from_millis(inner.options.debounce_ms)).await;
                if let Err(err) = inner.flush().await {
                    warn!(%err, "debounced change propagation failed");
                }
            }
        }));
    }

    /// Stop the background flush task. Idempotent.
    pub fn close(&self) {
        self.inner.shutdown.cancel();
    }

    #[must_use]
    pub fn local_peer(&self) -> PeerId {
        self.inner.local
    }

    #[must_use]
    pub fn resolution(&self) -> Resolution {
        self.inner.resolution
    }

    /// Broadcast our current ranges and ask peers for theirs. Called on
    /// open and worth repeating after a reconnect.
    pub async fn announce(&self) -> eyre::Result<()> {
        let mine = self.my_segments().await;
        if !mine.is_empty() {
            self.inner
                .messenger
                .send(
                    ReplicationMessage::RangeAnnouncement { ranges: mine },
                    DeliveryMode::Broadcast,
                    &[],
                )
                .await?;
        }
        self.inner
            .messenger
            .send(
                ReplicationMessage::ReplicationInfoRequest,
                DeliveryMode::Broadcast,
                &[],
            )
            .await
    }

    /// Take on (additional) replication responsibility. Returns the full
    /// set of locally-owned ranges after the change.
    ///
    /// An [`ReplicationRequest::Observer`] request drops every local range.
    pub async fn replicate(&self, request: ReplicationRequest) -> Vec<ReplicationRange> {
        let now = now_ms();
        let ctx = LogContext {
            local: self.inner.local,
            now_ms: now,
        };
        let fresh = self.inner.domain.initial_range(&request, &ctx);

        let mut guard = self.inner.state.lock().await;
        let State {
            ranges,
            accumulator,
            ..
        } = &mut *guard;
        if matches!(request, ReplicationRequest::Observer) {
            for range in ranges.remove_owner(&self.inner.local) {
                accumulator.range_removed(range.id(), now);
            }
        } else if let Some(range) = fresh {
            let _ = ranges.insert(range, now);
            ranges.rebalance(self.inner.resolution);
            accumulator.range_upsert(range);
        }
        let mine: Vec<ReplicationRange> =
            ranges.owned_by(&self.inner.local).into_iter().copied().collect();
        drop(guard);

        self.inner.changed.notify_one();
        mine
    }

    /// Give up the listed locally-owned ranges. Foreign ids are ignored.
    pub async fn unreplicate(&self, ids: &[RangeId]) -> Vec<ReplicationRange> {
        let now = now_ms();
        let mut removed = Vec::new();
        {
            let mut guard = self.inner.state.lock().await;
            for id in ids {
                let owned = guard
                    .ranges
                    .get(id)
                    .is_some_and(|range| range.owner == self.inner.local);
                if !owned {
                    continue;
                }
                if let Some(range) = guard.ranges.remove(id) {
                    guard.accumulator.range_removed(*id, now);
                    removed.push(range);
                }
            }
        }
        if !removed.is_empty() {
            self.inner.changed.notify_one();
        }
        removed
    }

    /// Ranges owned by this peer.
    pub async fn my_segments(&self) -> Vec<ReplicationRange> {
        let guard = self.inner.state.lock().await;
        guard
            .ranges
            .owned_by(&self.inner.local)
            .into_iter()
            .copied()
            .collect()
    }

    /// Every range this peer knows about, local and remote.
    pub async fn all_segments(&self) -> Vec<ReplicationRange> {
        let guard = self.inner.state.lock().await;
        guard.ranges.iter().copied().collect()
    }

    /// Fraction of `window` covered by at least one mature range.
    pub async fn coverage(&self, window: Span) -> f64 {
        let guard = self.inner.state.lock().await;
        coverage_fraction(
            &guard.ranges,
            self.inner.resolution,
            window,
            self.inner.options.role_age_ms,
            now_ms(),
        )
    }

    /// Minimal peer set whose mature ranges cover the whole ring.
    pub async fn replicators(&self) -> Vec<PeerId> {
        let guard = self.inner.state.lock().await;
        cover_set(
            &guard.ranges,
            self.inner.resolution,
            Span::full(),
            self.inner.options.role_age_ms,
            now_ms(),
        )
        .peers
    }

    /// Peers covering a domain-level query window.
    pub async fn collect(&self, args: &CollectArgs) -> Vec<PeerId> {
        let guard = self.inner.state.lock().await;
        self.inner.domain.collect(
            &guard.ranges,
            self.inner.options.role_age_ms,
            args,
            now_ms(),
        )
    }

    /// Block until `span` is fully covered by mature ranges, polling on
    /// the configured interval.
    ///
    /// Fails with [`ReplicationError::Timeout`] once the attempt budget is
    /// spent and with [`ReplicationError::Aborted`] when `cancel` fires.
    pub async fn wait_for_coverage(
        &self,
        span: Span,
        cancel: &CancellationToken,
    ) -> Result<Vec<PeerId>, ReplicationError> {
        let interval = Duration::from_millis(self.inner.options.wait_retry_interval_ms);
        let mut attempts = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(ReplicationError::Aborted);
            }
            let cover = {
                let guard = self.inner.state.lock().await;
                cover_set(
                    &guard.ranges,
                    self.inner.resolution,
                    span,
                    self.inner.options.role_age_ms,
                    now_ms(),
                )
            };
            if cover.uncovered == 0 {
                return Ok(cover.peers);
            }
            attempts += 1;
            if attempts >= self.inner.options.wait_max_attempts {
                debug!(attempts, uncovered = cover.uncovered, "coverage wait exhausted");
                return Err(ReplicationError::Timeout { attempts });
            }
            tokio::select! {
                () = cancel.cancelled() => return Err(ReplicationError::Aborted),
                () = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// Append an entry to the log and register it with the replication
    /// layer. Propagation happens after the debounce window.
    pub async fn append(&self, entry: Entry) -> eyre::Result<()> {
        self.inner.log.append(entry.clone()).await?;
        self.inner.note_entry(&entry).await;
        self.inner.changed.notify_one();
        Ok(())
    }

    /// Register an entry that reached the log through another path (bulk
    /// import, log-level exchange).
    pub async fn note_entry(&self, entry: &Entry) {
        self.inner.note_entry(entry).await;
        self.inner.changed.notify_one();
    }

    /// Forget a pruned entry.
    pub async fn remove_entry(&self, hash: &EntryHash) {
        {
            let mut guard = self.inner.state.lock().await;
            let State {
                entries,
                synchronizer,
                accumulator,
                ..
            } = &mut *guard;
            let Some(meta) = entries.delete(hash) else {
                return;
            };
            for coordinate in &meta.coordinates {
                synchronizer.on_entry_removed(self.inner.resolution, *coordinate);
                accumulator.entry_removed(*hash, *coordinate);
            }
        }
        self.inner.changed.notify_one();
    }

    /// Handle raw bytes from a peer.
    ///
    /// Malformed input never propagates: the message is dropped, the
    /// peer's sessions are reset and the caller sees `Ok`.
    pub async fn handle_raw(&self, from: PeerId, bytes: &[u8]) -> eyre::Result<()> {
        match ReplicationMessage::from_bytes(bytes) {
            Ok(message) => self.handle_message(from, message).await,
            Err(err) => {
                warn!(%from, %err, "dropping malformed replication message");
                let mut guard = self.inner.state.lock().await;
                guard.synchronizer.on_peer_disconnected(&from);
                guard.tracker.record_decode_failure(from);
                Ok(())
            }
        }
    }

    /// Handle a decoded protocol message.
    pub async fn handle_message(
        &self,
        from: PeerId,
        message: ReplicationMessage,
    ) -> eyre::Result<()> {
        match message {
            ReplicationMessage::RangeAnnouncement { ranges } => {
                self.inner.handle_announcement(from, ranges, now_ms()).await;
                Ok(())
            }
            ReplicationMessage::ReplicationInfoRequest => {
                let mine = self.my_segments().await;
                if mine.is_empty() {
                    return Ok(());
                }
                self.inner
                    .messenger
                    .send(
                        ReplicationMessage::RangeAnnouncement { ranges: mine },
                        DeliveryMode::Direct,
                        &[from],
                    )
                    .await
            }
            other => self.inner.handle_sync_message(from, other).await,
        }
    }

    /// A peer's connection dropped; its ranges are kept (it may come
    /// back), only its in-flight sessions are discarded.
    pub async fn on_peer_disconnected(&self, peer: &PeerId) {
        let mut guard = self.inner.state.lock().await;
        guard.synchronizer.on_peer_disconnected(peer);
    }

    /// A peer left the shared log for good: sessions and ranges both go.
    pub async fn on_peer_departed(&self, peer: &PeerId) {
        let mut guard = self.inner.state.lock().await;
        guard.synchronizer.on_peer_disconnected(peer);
        guard.tracker.forget(peer);
        let removed = guard.ranges.remove_owner(peer);
        if !removed.is_empty() {
            guard.ranges.rebalance(self.inner.resolution);
            debug!(%peer, ranges = removed.len(), "dropped ranges of departed peer");
        }
    }

    /// Run one adaptive controller step and resize the local range to the
    /// new factor. No-op (`None`) unless the log was opened adaptive.
    pub async fn controller_tick(&self, cpu_usage: f64, memory_usage: f64) -> Option<f64> {
        if !matches!(self.inner.options.request, ReplicationRequest::Adaptive) {
            return None;
        }
        let now = now_ms();
        let resolution = self.inner.resolution;

        let mut guard = self.inner.state.lock().await;
        let State {
            ranges,
            controller,
            accumulator,
            ..
        } = &mut *guard;

        let mut owners: HashSet<PeerId> = HashSet::new();
        let mut total_factor = 0.0;
        for range in ranges.iter() {
            let _ = owners.insert(range.owner);
            total_factor += resolution.width_to_fraction(range.width);
        }
        let _ = owners.insert(self.inner.local);

        let factor = controller.step(&ControllerInputs {
            total_factor,
            peer_count: owners.len(),
            cpu_usage,
            memory_usage,
        });

        let width = resolution.fraction_to_width(factor);
        let current: Vec<ReplicationRange> = ranges
            .owned_by(&self.inner.local)
            .into_iter()
            .filter(|range| range.intent == RangeIntent::Strict)
            .copied()
            .collect();
        if current.len() == 1 && current[0].width == width {
            return Some(factor);
        }

        let offset = current.first().map_or_else(
            || {
                self.inner
                    .domain
                    .initial_range(
                        &ReplicationRequest::Adaptive,
                        &LogContext {
                            local: self.inner.local,
                            now_ms: now,
                        },
                    )
                    .map_or(0, |range| range.offset)
            },
            |range| range.offset,
        );
        for range in &current {
            let _ = ranges.remove(&range.id());
            accumulator.range_removed(range.id(), now);
        }
        if width > 0 {
            let range = ReplicationRange::new(self.inner.local, offset, width, now);
            let _ = ranges.insert(range, now);
            accumulator.range_upsert(range);
        }
        debug!(factor, "adaptive controller resized local range");
        drop(guard);

        self.inner.changed.notify_one();
        Some(factor)
    }

    /// Candidates deferred plus sessions still open in the synchronizer.
    /// `pending` already folds open sessions in.
    pub async fn pending_sync(&self) -> usize {
        let guard = self.inner.state.lock().await;
        guard.synchronizer.pending()
    }

    /// Per-peer synchronization counters, sorted by peer id.
    pub async fn sync_stats(&self) -> Vec<(PeerId, PeerSyncStats)> {
        let guard = self.inner.state.lock().await;
        guard.tracker.snapshot()
    }

    /// Counters for one peer (zeroes if never seen).
    pub async fn peer_stats(&self, peer: &PeerId) -> PeerSyncStats {
        let guard = self.inner.state.lock().await;
        guard.tracker.get(peer)
    }
}

impl Inner {
    async fn note_entry(&self, entry: &Entry) {
        let coordinate = self.domain.coordinate_for(entry);
        let now = now_ms();
        let mut guard = self.state.lock().await;
        let State {
            ranges,
            entries,
            synchronizer,
            accumulator,
            ..
        } = &mut *guard;

        let on_boundary = ranges.on_any_boundary(self.resolution, coordinate);
        if on_boundary && ranges.assign(self.resolution, coordinate) == Some(self.local) {
            self.pin_boundary_range(ranges, accumulator, coordinate, now);
        }
        entries.put(EntryMeta {
            hash: entry.hash,
            coordinates: vec![coordinate],
            group: entry.group(),
            boundary_pinned: on_boundary,
        });
        accumulator.entry_added(entry.hash, coordinate);
        synchronizer.on_entry_added(self.resolution, coordinate);
    }

    /// An entry was assigned to us across a range border: pin the range so
    /// the assignment survives later boundary contention.
    fn pin_boundary_range(
        &self,
        ranges: &mut RangeIndex,
        accumulator: &mut ChangeAccumulator,
        point: Coordinate,
        now: u64,
    ) {
        let target = ranges
            .owned_by(&self.local)
            .into_iter()
            .find(|range| {
                range.intent == RangeIntent::Strict && range.on_boundary(self.resolution, point)
            })
            .copied();
        let Some(range) = target else {
            return;
        };
        let mut pinned = range;
        pinned.intent = RangeIntent::BoundaryPinned;
        // Strictly newer so the replacement wins LWW everywhere.
        pinned.timestamp = now.max(range.timestamp + 1);
        let _ = ranges.insert(pinned, now);
        accumulator.range_upsert(pinned);
        debug!(offset = pinned.offset, "pinned replication range at entry boundary");
    }

    /// Apply a peer's announcement as its authoritative range set.
    ///
    /// Spans the owner no longer claims are dropped, unless the stored
    /// copy is newer than everything announced (a late, stale broadcast).
    /// An empty announcement is a full withdrawal.
    async fn handle_announcement(
        &self,
        from: PeerId,
        announced: Vec<ReplicationRange>,
        now: u64,
    ) {
        let mut guard = self.state.lock().await;
        let ranges = &mut guard.ranges;

        if announced.is_empty() {
            let removed = ranges.remove_owner(&from);
            if !removed.is_empty() {
                debug!(%from, ranges = removed.len(), "peer withdrew its replication ranges");
            }
            return;
        }

        let ids: HashSet<RangeId> = announced.iter().map(ReplicationRange::id).collect();
        let newest = announced.iter().map(|range| range.timestamp).max().unwrap_or(0);
        for range in announced {
            if range.owner != from {
                warn!(%from, claimed = %range.owner, "ignoring range announced for another owner");
                continue;
            }
            let _ = ranges.insert(range, now);
        }
        let stale: Vec<RangeId> = ranges
            .owned_by(&from)
            .into_iter()
            .filter(|range| !ids.contains(&range.id()) && range.timestamp <= newest)
            .map(ReplicationRange::id)
            .collect();
        for id in &stale {
            let _ = ranges.remove(id);
        }
        ranges.rebalance(self.resolution);
    }

    async fn handle_sync_message(
        &self,
        from: PeerId,
        message: ReplicationMessage,
    ) -> eyre::Result<()> {
        let step = {
            let mut guard = self.state.lock().await;
            let State {
                entries,
                synchronizer,
                ..
            } = &mut *guard;
            let ctx = SyncContext {
                local: self.local,
                resolution: self.resolution,
                entries,
            };
            synchronizer.handle_message(&ctx, from, &message).await?
        };
        if step.fetch.is_empty() {
            return Ok(());
        }

        let fetched = self.log.fetch(&step.fetch, from).await?;
        debug!(
            %from,
            requested = step.fetch.len(),
            received = fetched.len(),
            "fetched entries reported missing"
        );
        {
            let mut guard = self.state.lock().await;
            guard.tracker.record_fetch(from, step.fetch.len(), fetched.len());
        }
        for entry in fetched {
            self.log.append(entry.clone()).await?;
            self.note_entry(&entry).await;
        }
        self.changed.notify_one();
        Ok(())
    }

    /// Drain the accumulator: re-announce our range set if it changed and
    /// offer freshly-added entries to the peers whose mature ranges cover
    /// them.
    async fn flush(&self) -> eyre::Result<()> {
        let mut guard = self.state.lock().await;
        let State {
            ranges,
            entries,
            synchronizer,
            accumulator,
            tracker,
            ..
        } = &mut *guard;
        let changes = accumulator.take();
        if changes.is_empty() {
            return Ok(());
        }

        if !changes.ranges.is_empty() {
            let mine: Vec<ReplicationRange> =
                ranges.owned_by(&self.local).into_iter().copied().collect();
            debug!(ranges = mine.len(), "announcing replication ranges");
            self.messenger
                .send(
                    ReplicationMessage::RangeAnnouncement { ranges: mine },
                    DeliveryMode::Broadcast,
                    &[],
                )
                .await?;
        }

        let now = now_ms();
        let mut per_peer: BTreeMap<PeerId, Vec<EntryHash>> = BTreeMap::new();
        for (hash, delta) in &changes.entries {
            let EntryDelta::Added(coordinate) = delta else {
                continue;
            };
            // Skip entries that vanished again before the flush.
            if !entries.contains(hash) {
                continue;
            }
            for range in ranges.iter_mature(self.options.role_age_ms, now) {
                if range.owner != self.local && range.contains(self.resolution, *coordinate) {
                    per_peer.entry(range.owner).or_default().push(*hash);
                }
            }
        }
        for (peer, mut hashes) in per_peer {
            hashes.sort_unstable();
            hashes.dedup();
            let ctx = SyncContext {
                local: self.local,
                resolution: self.resolution,
                entries,
            };
            synchronizer.offer(&ctx, Span::full(), &hashes, &[peer]).await?;
            tracker.record_offer(peer);
        }
        Ok(())
    }
}
