//! Coded-symbol synchronizer.
//!
//! Avoids shipping full hash lists for large candidate sets: the initiator
//! streams rateless coded symbols for its side of a span, the receiver
//! subtracts its own and peels out the symmetric difference. Sessions are
//! bounded by a round budget; running out ends the session silently and
//! leaves unresolved items for the next synchronization pass. Either way
//! the receiver closes with [`ReplicationMessage::SyncDone`] so the
//! initiator can drop its encoder state too.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use driftlog_primitives::{
    DeliveryMode, EntryHash, Messenger, PeerId, ReplicationMessage, Resolution, Span,
};
use tracing::{debug, trace, warn};

use crate::riblt::{Decoder, Encoder};
use crate::synchronizer::{
    order_candidates, SessionKey, SyncContext, SyncStep, SyncTuning, Synchronizer,
    SynchronizerKind,
};

/// Rounds a session may run before giving up silently.
pub const DEFAULT_ROUND_BUDGET: u32 = 8;

/// Coded symbols carried per message.
pub const DEFAULT_SYMBOL_BATCH: usize = 16;

enum Session {
    /// We sent `SyncStart` and keep producing symbols on request.
    Initiating { encoder: Encoder },
    /// We are decoding a peer's stream against our own span.
    Responding { decoder: Decoder, rounds: u32 },
}

pub struct RatelessIbltSynchronizer {
    messenger: Arc<dyn Messenger>,
    tuning: SyncTuning,
    round_budget: u32,
    symbol_batch: usize,
    /// Pristine per-span encoders, cloned into sessions so each peer gets
    /// the stream from the start. Invalidated on local entry changes.
    encoders: HashMap<Span, Encoder>,
    sessions: HashMap<SessionKey, Session>,
    /// Escape-hatch candidates that overflowed the batch cap, queued per
    /// peer for the next coalesced cycle.
    deferred: BTreeMap<PeerId, VecDeque<EntryHash>>,
}

impl RatelessIbltSynchronizer {
    #[must_use]
    pub fn new(messenger: Arc<dyn Messenger>, tuning: SyncTuning) -> Self {
        Self {
            messenger,
            tuning,
            round_budget: DEFAULT_ROUND_BUDGET,
            symbol_batch: DEFAULT_SYMBOL_BATCH,
            encoders: HashMap::new(),
            sessions: HashMap::new(),
            deferred: BTreeMap::new(),
        }
    }

    /// Override the round budget and per-message symbol count.
    #[must_use]
    pub fn with_limits(mut self, round_budget: u32, symbol_batch: usize) -> Self {
        self.round_budget = round_budget.max(1);
        self.symbol_batch = symbol_batch.max(1);
        self
    }

    fn key(&self, peer: PeerId, span: Span) -> SessionKey {
        SessionKey {
            peer,
            span,
            kind: SynchronizerKind::RatelessIblt,
        }
    }

    /// Cached encoder for a span, rebuilding from the entry index when the
    /// cache was invalidated. The rebuild is the observable index scan.
    fn seed_encoder(&mut self, ctx: &SyncContext<'_>, span: Span) -> Encoder {
        self.encoders
            .entry(span)
            .or_insert_with(|| {
                let mut encoder = Encoder::new();
                for (coordinate, hash) in ctx.entries.scan_span(ctx.resolution, span) {
                    encoder.add_item(hash, coordinate);
                }
                trace!(items = encoder.len(), "seeded coded-symbol encoder");
                encoder
            })
            .clone()
    }

    fn invalidate(&mut self, resolution: Resolution, coordinate: u64) {
        self.encoders
            .retain(|span, _| !span.contains(resolution, coordinate));
        self.sessions.retain(|key, session| {
            !(matches!(session, Session::Initiating { .. })
                && key.span.contains(resolution, coordinate))
        });
    }

    fn seed_decoder(ctx: &SyncContext<'_>, span: Span) -> Decoder {
        let mut decoder = Decoder::new();
        for (coordinate, hash) in ctx.entries.scan_span(ctx.resolution, span) {
            decoder.add_local(hash, coordinate);
        }
        decoder
    }

    /// Escape hatch: push the highest-priority candidates through the
    /// simple path so they are not held hostage by reconciliation-round
    /// latency. Overflow past the batch cap is deferred per peer for the
    /// next coalesced cycle.
    async fn push_priority_candidates(
        &mut self,
        ctx: &SyncContext<'_>,
        candidates: &[EntryHash],
        targets: &[PeerId],
    ) -> eyre::Result<()> {
        let ordered = order_candidates(ctx.entries, &self.tuning.priority, candidates);
        for peer in targets {
            let mut batch: Vec<EntryHash> = self
                .deferred
                .remove(peer)
                .map(Vec::from)
                .unwrap_or_default();
            batch.extend_from_slice(&ordered);
            let mut seen = HashSet::new();
            batch.retain(|hash| seen.insert(*hash));
            if batch.len() > self.tuning.max_simple_entries {
                let overflow = batch.split_off(self.tuning.max_simple_entries);
                debug!(%peer, deferred = overflow.len(), "priority push overflow");
                let _ = self.deferred.insert(*peer, overflow.into());
            }
            if batch.is_empty() {
                continue;
            }
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

    /// Drive one decode attempt for a responding session; returns the
    /// hashes to fetch if the difference resolved.
    async fn resolve_or_continue(
        &mut self,
        key: SessionKey,
        span: Span,
    ) -> eyre::Result<SyncStep> {
        let Some(Session::Responding { decoder, rounds }) = self.sessions.get_mut(&key) else {
            return Ok(SyncStep::default());
        };

        if let Some(decoded) = decoder.try_decode() {
            debug!(
                peer = %key.peer,
                theirs = decoded.remote_only.len(),
                ours = decoded.local_only.len(),
                "coded-symbol reconciliation resolved"
            );
            let fetch: Vec<EntryHash> =
                decoded.remote_only.iter().map(|(hash, _)| *hash).collect();
            let have: Vec<EntryHash> = decoded.local_only.iter().map(|(hash, _)| *hash).collect();
            let _ = self.sessions.remove(&key);
            if !have.is_empty() {
                // Tell the initiator what it is missing from our side.
                self.messenger
                    .send(
                        ReplicationMessage::MaybeMissing { hashes: have },
                        DeliveryMode::Direct,
                        &[key.peer],
                    )
                    .await?;
            }
            self.messenger
                .send(
                    ReplicationMessage::SyncDone { span },
                    DeliveryMode::Direct,
                    &[key.peer],
                )
                .await?;
            return Ok(SyncStep { fetch });
        }

        *rounds += 1;
        if *rounds >= self.round_budget {
            // Budget exhausted: end silently, next pass retries. Still
            // tell the initiator so its encoder session goes away.
            debug!(peer = %key.peer, "coded-symbol round budget exhausted");
            let _ = self.sessions.remove(&key);
            self.messenger
                .send(
                    ReplicationMessage::SyncDone { span },
                    DeliveryMode::Direct,
                    &[key.peer],
                )
                .await?;
            return Ok(SyncStep::default());
        }
        let count = self.symbol_batch as u32;
        self.messenger
            .send(
                ReplicationMessage::SyncSymbolRequest { span, count },
                DeliveryMode::Direct,
                &[key.peer],
            )
            .await?;
        Ok(SyncStep::default())
    }
}

#[async_trait]
impl Synchronizer for RatelessIbltSynchronizer {
    fn kind(&self) -> SynchronizerKind {
        SynchronizerKind::RatelessIblt
    }

    async fn offer(
        &mut self,
        ctx: &SyncContext<'_>,
        span: Span,
        candidates: &[EntryHash],
        targets: &[PeerId],
    ) -> eyre::Result<()> {
        if targets.is_empty() {
            return Ok(());
        }
        self.push_priority_candidates(ctx, candidates, targets)
            .await?;

        for peer in targets {
            let key = self.key(*peer, span);
            if self.sessions.contains_key(&key) {
                // Join the in-flight session rather than duplicating it.
                trace!(peer = %peer, "joining existing sync session");
                continue;
            }
            let mut encoder = self.seed_encoder(ctx, span);
            let symbols = encoder.produce(self.symbol_batch);
            let _ = self
                .sessions
                .insert(key, Session::Initiating { encoder });
            self.messenger
                .send(
                    ReplicationMessage::SyncStart { span, symbols },
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
        match message {
            ReplicationMessage::SyncStart { span, symbols } => {
                let key = self.key(from, *span);
                let mut decoder = Self::seed_decoder(ctx, *span);
                for symbol in symbols {
                    decoder.feed(*symbol);
                }
                let _ = self
                    .sessions
                    .insert(key, Session::Responding { decoder, rounds: 1 });
                self.resolve_or_continue(key, *span).await
            }

            ReplicationMessage::SyncSymbols { span, symbols } => {
                let key = self.key(from, *span);
                match self.sessions.get_mut(&key) {
                    Some(Session::Responding { decoder, .. }) => {
                        for symbol in symbols {
                            decoder.feed(*symbol);
                        }
                        self.resolve_or_continue(key, *span).await
                    }
                    _ => {
                        // Symbols for a session we already closed; stale.
                        trace!(%from, "dropping symbols for unknown session");
                        Ok(SyncStep::default())
                    }
                }
            }

            ReplicationMessage::SyncSymbolRequest { span, count } => {
                let key = self.key(from, *span);
                let Some(Session::Initiating { encoder }) = self.sessions.get_mut(&key) else {
                    trace!(%from, "symbol request for unknown session");
                    return Ok(SyncStep::default());
                };
                let count = (*count as usize).min(self.symbol_batch * 4).max(1);
                let symbols = encoder.produce(count);
                self.messenger
                    .send(
                        ReplicationMessage::SyncSymbols {
                            span: *span,
                            symbols,
                        },
                        DeliveryMode::Direct,
                        &[from],
                    )
                    .await?;
                Ok(SyncStep::default())
            }

            ReplicationMessage::SyncDone { span } => {
                let key = self.key(from, *span);
                if matches!(self.sessions.get(&key), Some(Session::Initiating { .. })) {
                    trace!(%from, "peer closed the reconciliation session");
                    let _ = self.sessions.remove(&key);
                }
                Ok(SyncStep::default())
            }

            ReplicationMessage::MaybeMissing { hashes } => {
                // The responder's report of entries only it had, or an
                // escape-hatch push: either way, fetch what we lack.
                let fetch: Vec<EntryHash> = hashes
                    .iter()
                    .filter(|hash| !ctx.entries.contains(hash))
                    .copied()
                    .collect();
                Ok(SyncStep { fetch })
            }

            other => {
                warn!(%from, ?other, "iblt synchronizer got an unexpected message");
                Ok(SyncStep::default())
            }
        }
    }

    // A local change makes the cached encoder and any initiating
    // snapshot over that span stale; the next offer reseeds both.
    // Responding sessions keep their in-flight decoder and resolve
    // against the set as of their start.
    fn on_entry_added(&mut self, resolution: Resolution, coordinate: u64) {
        self.invalidate(resolution, coordinate);
    }

    fn on_entry_removed(&mut self, resolution: Resolution, coordinate: u64) {
        self.invalidate(resolution, coordinate);
    }

    fn on_peer_disconnected(&mut self, peer: &PeerId) {
        let _ = self.deferred.remove(peer);
        let before = self.sessions.len();
        self.sessions.retain(|key, _| key.peer != *peer);
        if self.sessions.len() != before {
            debug!(%peer, purged = before - self.sessions.len(), "purged sessions for lost peer");
        }
    }

    fn pending(&self) -> usize {
        self.sessions.len() + self.deferred.values().map(VecDeque::len).sum::<usize>()
    }

    fn sessions(&self) -> Vec<SessionKey> {
        self.sessions.keys().copied().collect()
    }
}
