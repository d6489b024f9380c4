//! The synchronizer contract.
//!
//! Two interchangeable reconciliation strategies sit behind one trait,
//! selected at construction — never by runtime type inspection. The
//! orchestrator drives whichever was chosen through the same calls.

use std::sync::Arc;

use async_trait::async_trait;
use driftlog_primitives::{EntryHash, PeerId, ReplicationMessage, Resolution, Span};
use driftlog_replication::{EntryIndex, EntryMeta};

/// Which concrete synchronizer a session belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SynchronizerKind {
    Simple,
    RatelessIblt,
}

/// At most one in-flight session exists per key; a duplicate request
/// joins the existing session instead of starting a new one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub peer: PeerId,
    pub span: Span,
    pub kind: SynchronizerKind,
}

/// Candidate priority, highest first. The default puts boundary-pinned
/// entries ahead of everything else.
pub type PriorityFn = Arc<dyn Fn(&EntryMeta) -> u64 + Send + Sync>;

#[must_use]
pub fn default_priority() -> PriorityFn {
    Arc::new(|meta| u64::from(meta.boundary_pinned))
}

/// Tuning shared by both synchronizers.
#[derive(Clone)]
pub struct SyncTuning {
    /// Orders candidates for the simple path and the escape hatch.
    pub priority: PriorityFn,
    /// Per-cycle batch cap for explicit hash lists; overflow is deferred
    /// to the next coalesced cycle.
    pub max_simple_entries: usize,
}

impl Default for SyncTuning {
    fn default() -> Self {
        Self {
            priority: default_priority(),
            max_simple_entries: 128,
        }
    }
}

/// Read-only view the orchestrator lends a synchronizer for one call.
pub struct SyncContext<'a> {
    pub local: PeerId,
    pub resolution: Resolution,
    pub entries: &'a EntryIndex,
}

/// What a protocol step asked of the orchestrator.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncStep {
    /// Entries a peer reports that we do not hold locally; the
    /// orchestrator fetches them through the log collaborator.
    pub fetch: Vec<EntryHash>,
}

/// Common contract for the reconciliation strategies.
#[async_trait]
pub trait Synchronizer: Send + Sync {
    fn kind(&self) -> SynchronizerKind;

    /// Offer a batch of entries that might be missing somewhere to the
    /// given target peers, scoped to `span`.
    async fn offer(
        &mut self,
        ctx: &SyncContext<'_>,
        span: Span,
        candidates: &[EntryHash],
        targets: &[PeerId],
    ) -> eyre::Result<()>;

    /// Handle an inbound protocol message, replying through the messenger
    /// as needed.
    async fn handle_message(
        &mut self,
        ctx: &SyncContext<'_>,
        from: PeerId,
        message: &ReplicationMessage,
    ) -> eyre::Result<SyncStep>;

    /// A local entry appeared at `coordinate`: invalidate any cached
    /// protocol state covering it.
    fn on_entry_added(&mut self, resolution: Resolution, coordinate: u64);

    /// A local entry at `coordinate` was removed.
    fn on_entry_removed(&mut self, resolution: Resolution, coordinate: u64);

    /// Synchronously discard every session belonging to a lost peer.
    fn on_peer_disconnected(&mut self, peer: &PeerId);

    /// Work not yet transmitted (deferred candidates, open sessions).
    fn pending(&self) -> usize;

    /// Keys of the in-flight sessions, for backpressure and diagnostics.
    fn sessions(&self) -> Vec<SessionKey>;
}

/// Order candidate metadata by descending priority, ties broken by hash
/// bytes so the order is stable across peers.
pub(crate) fn order_candidates(
    entries: &EntryIndex,
    priority: &PriorityFn,
    candidates: &[EntryHash],
) -> Vec<EntryHash> {
    let mut scored: Vec<(u64, EntryHash)> = candidates
        .iter()
        .filter_map(|hash| entries.get(hash).map(|meta| (priority(meta), *hash)))
        .collect();
    scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));
    scored.into_iter().map(|(_, hash)| hash).collect()
}
