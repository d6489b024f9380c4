//! Arena-style index of replication ranges.
//!
//! Ranges are keyed by their stable [`RangeId`] (owner + span), never by
//! object references, so the index serializes and rebuilds trivially.
//! Mutations follow last-write-wins per owner + span: a re-announcement
//! only replaces the stored range when its timestamp is strictly newer.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use driftlog_primitives::range::boundary_winner;
use driftlog_primitives::{
    Coordinate, PeerId, RangeId, RangeIntent, ReplicationRange, Resolution, Span,
};
use tracing::debug;

/// Result of inserting an announced range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InsertOutcome {
    /// A new owner + span pair.
    Inserted,
    /// Same owner + span, strictly newer timestamp.
    Replaced,
    /// Same owner + span, stale or duplicate timestamp; ignored.
    IgnoredStale,
}

#[derive(Clone, Debug)]
struct Stored {
    range: ReplicationRange,
    /// When this node first learned of the owner + span pair, in local
    /// milliseconds. Basis for role-age maturity; survives LWW
    /// replacement and rebalancing merges.
    learned_at_ms: u64,
}

/// Index of every replication range this node knows about.
#[derive(Clone, Debug, Default)]
pub struct RangeIndex {
    ranges: BTreeMap<RangeId, Stored>,
    by_owner: HashMap<PeerId, BTreeSet<RangeId>>,
}

impl RangeIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Insert an announced range, applying last-write-wins per owner + span.
    pub fn insert(&mut self, range: ReplicationRange, now_ms: u64) -> InsertOutcome {
        let id = range.id();
        if let Some(existing) = self.ranges.get_mut(&id) {
            if range.timestamp <= existing.range.timestamp {
                return InsertOutcome::IgnoredStale;
            }
            existing.range = range;
            return InsertOutcome::Replaced;
        }
        let _ = self
            .by_owner
            .entry(range.owner)
            .or_default()
            .insert(id);
        let _ = self.ranges.insert(
            id,
            Stored {
                range,
                learned_at_ms: now_ms,
            },
        );
        InsertOutcome::Inserted
    }

    /// Remove a single range.
    pub fn remove(&mut self, id: &RangeId) -> Option<ReplicationRange> {
        let stored = self.ranges.remove(id)?;
        if let Some(ids) = self.by_owner.get_mut(&stored.range.owner) {
            let _ = ids.remove(id);
            if ids.is_empty() {
                let _ = self.by_owner.remove(&stored.range.owner);
            }
        }
        Some(stored.range)
    }

    /// Drop every range owned by a departed peer.
    pub fn remove_owner(&mut self, owner: &PeerId) -> Vec<ReplicationRange> {
        let Some(ids) = self.by_owner.remove(owner) else {
            return Vec::new();
        };
        ids.into_iter()
            .filter_map(|id| self.ranges.remove(&id).map(|s| s.range))
            .collect()
    }

    #[must_use]
    pub fn get(&self, id: &RangeId) -> Option<&ReplicationRange> {
        self.ranges.get(id).map(|s| &s.range)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReplicationRange> {
        self.ranges.values().map(|s| &s.range)
    }

    /// Ranges published by `owner`.
    #[must_use]
    pub fn owned_by(&self, owner: &PeerId) -> Vec<&ReplicationRange> {
        self.by_owner
            .get(owner)
            .into_iter()
            .flatten()
            .filter_map(|id| self.ranges.get(id).map(|s| &s.range))
            .collect()
    }

    /// All ranges intersecting the span.
    #[must_use]
    pub fn intersecting(&self, resolution: Resolution, span: Span) -> Vec<&ReplicationRange> {
        self.ranges
            .values()
            .map(|s| &s.range)
            .filter(|r| span.intersects(resolution, r.offset, r.width))
            .collect()
    }

    /// Ranges old enough to be trusted for coverage decisions, paired with
    /// nothing else a resolver needs.
    pub fn iter_mature(
        &self,
        role_age_ms: u64,
        now_ms: u64,
    ) -> impl Iterator<Item = &ReplicationRange> {
        self.ranges
            .values()
            .filter(move |s| now_ms.saturating_sub(s.learned_at_ms) >= role_age_ms)
            .map(|s| &s.range)
    }

    /// Total width of the ring covered by at least one range.
    #[must_use]
    pub fn covered_width(&self, resolution: Resolution) -> u128 {
        union_width(
            resolution,
            self.ranges.values().map(|s| (s.range.offset, s.range.width)),
        )
    }

    /// Deterministically resolve which single owner a coordinate is
    /// assigned to.
    ///
    /// Candidates are every range containing the point plus every range
    /// whose exclusive end is exactly the point (the boundary case); the
    /// fold over [`boundary_winner`] is pure and symmetric, so all peers
    /// agree regardless of announcement order.
    #[must_use]
    pub fn assign(&self, resolution: Resolution, point: Coordinate) -> Option<PeerId> {
        let mut winner: Option<&ReplicationRange> = None;
        for stored in self.ranges.values() {
            let range = &stored.range;
            if !range.contains(resolution, point) && range.end(resolution) != point {
                continue;
            }
            winner = Some(match winner {
                None => range,
                Some(current) => boundary_winner(current, range),
            });
        }
        winner.map(|r| r.owner)
    }

    /// Whether a coordinate lands exactly on any stored range boundary.
    #[must_use]
    pub fn on_any_boundary(&self, resolution: Resolution, point: Coordinate) -> bool {
        self.ranges
            .values()
            .any(|s| s.range.on_boundary(resolution, point))
    }

    /// Merge contiguous or overlapping ranges with the same owner and
    /// intent into one, keeping the newest timestamp and the oldest
    /// learned-at time.
    pub fn rebalance(&mut self, resolution: Resolution) {
        let owners: Vec<PeerId> = self.by_owner.keys().copied().collect();
        for owner in owners {
            for intent in [RangeIntent::Strict, RangeIntent::BoundaryPinned] {
                self.rebalance_group(resolution, &owner, intent);
            }
        }
    }

    fn rebalance_group(&mut self, resolution: Resolution, owner: &PeerId, intent: RangeIntent) {
        let Some(ids) = self.by_owner.get(owner) else {
            return;
        };
        let mut group: Vec<(RangeId, Stored)> = ids
            .iter()
            .filter_map(|id| {
                let stored = self.ranges.get(id)?;
                (stored.range.intent == intent).then(|| (*id, stored.clone()))
            })
            .collect();
        if group.len() < 2 {
            return;
        }
        group.sort_by_key(|(_, s)| s.range.offset);

        let mut merged: Vec<Stored> = Vec::with_capacity(group.len());
        for (_, stored) in &group {
            match merged.last_mut() {
                Some(last) if arcs_touch(resolution, &last.range, &stored.range) => {
                    absorb(resolution, last, stored);
                }
                _ => merged.push(stored.clone()),
            }
        }
        // The last merged arc may wrap around and touch the first.
        if merged.len() > 1 {
            let first = merged[0].clone();
            let last = merged.last_mut().expect("len checked above");
            if arcs_touch(resolution, &last.range, &first.range) {
                absorb(resolution, last, &first);
                let _ = merged.remove(0);
            }
        }

        if merged.len() == group.len() {
            return;
        }
        debug!(
            owner = %owner,
            before = group.len(),
            after = merged.len(),
            "merged contiguous replication ranges"
        );
        for (id, _) in &group {
            let _ = self.remove(id);
        }
        for stored in merged {
            let id = stored.range.id();
            let _ = self.by_owner.entry(stored.range.owner).or_default().insert(id);
            let _ = self.ranges.insert(id, stored);
        }
    }
}

/// Whether `b` starts inside or immediately after `a` (clockwise).
fn arcs_touch(resolution: Resolution, a: &ReplicationRange, b: &ReplicationRange) -> bool {
    a.is_full_ring(resolution) || resolution.distance(a.offset, b.offset) <= a.width
}

/// Grow `a` to also cover `b`, assuming `arcs_touch(a, b)`.
fn absorb(resolution: Resolution, a: &mut Stored, b: &Stored) {
    let reach = resolution.distance(a.range.offset, b.range.offset) + b.range.width;
    a.range.width = a.range.width.max(reach).min(resolution.ring_size());
    a.range.timestamp = a.range.timestamp.max(b.range.timestamp);
    a.learned_at_ms = a.learned_at_ms.min(b.learned_at_ms);
}

/// Width of the union of a set of arcs, capped at the full ring.
pub(crate) fn union_width(
    resolution: Resolution,
    arcs: impl Iterator<Item = (Coordinate, u128)>,
) -> u128 {
    let size = resolution.ring_size();
    // Unwrap each arc into at most two linear segments on [0, size).
    let mut segments: Vec<(u128, u128)> = Vec::new();
    for (offset, width) in arcs {
        if width == 0 {
            continue;
        }
        if width >= size {
            return size;
        }
        let start = offset as u128;
        let end = start + width;
        if end <= size {
            segments.push((start, end));
        } else {
            segments.push((start, size));
            segments.push((0, end - size));
        }
    }
    segments.sort_unstable();
    let mut total = 0;
    let mut cursor: Option<(u128, u128)> = None;
    for (start, end) in segments {
        match &mut cursor {
            Some((_, cur_end)) if start <= *cur_end => *cur_end = (*cur_end).max(end),
            _ => {
                if let Some((s, e)) = cursor {
                    total += e - s;
                }
                cursor = Some((start, end));
            }
        }
    }
    if let Some((s, e)) = cursor {
        total += e - s;
    }
    total.min(size)
}
