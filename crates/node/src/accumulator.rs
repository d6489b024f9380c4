//! Coalesced change tracking for debounced propagation.
//!
//! Every local mutation lands here first; the flush task drains the
//! accumulator once per debounce window. Merging is commutative and
//! idempotent inside a window, so bulk operations collapse into one
//! coherent batch no matter the order the mutations arrived in.

use std::collections::HashMap;

use driftlog_primitives::{Coordinate, EntryHash, RangeId, ReplicationRange};

/// One pending range mutation.
#[derive(Clone, Debug, PartialEq)]
pub enum RangeDelta {
    Upsert(ReplicationRange),
    Remove { id: RangeId, timestamp: u64 },
}

impl RangeDelta {
    fn timestamp(&self) -> u64 {
        match self {
            Self::Upsert(range) => range.timestamp,
            Self::Remove { timestamp, .. } => *timestamp,
        }
    }

    fn is_remove(&self) -> bool {
        matches!(self, Self::Remove { .. })
    }
}

/// One pending entry mutation, carrying the ring coordinate it touched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryDelta {
    Added(Coordinate),
    Removed(Coordinate),
}

/// A drained batch of coalesced changes.
#[derive(Debug, Default)]
pub struct ChangeSet {
    pub ranges: Vec<RangeDelta>,
    pub entries: Vec<(EntryHash, EntryDelta)>,
}

impl ChangeSet {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.entries.is_empty()
    }
}

/// Accumulates mutations between flushes.
///
/// Range deltas merge per [`RangeId`] keeping the newer timestamp; on a
/// timestamp tie a removal wins over an upsert. Entry deltas merge per
/// hash with removal winning outright: an entry both added and pruned
/// within one window is never worth offering.
#[derive(Debug, Default)]
pub struct ChangeAccumulator {
    ranges: HashMap<RangeId, RangeDelta>,
    entries: HashMap<EntryHash, EntryDelta>,
}

impl ChangeAccumulator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.ranges.len() + self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty() && self.entries.is_empty()
    }

    pub fn range_upsert(&mut self, range: ReplicationRange) {
        self.merge_range(range.id(), RangeDelta::Upsert(range));
    }

    pub fn range_removed(&mut self, id: RangeId, timestamp: u64) {
        self.merge_range(id, RangeDelta::Remove { id, timestamp });
    }

    fn merge_range(&mut self, id: RangeId, delta: RangeDelta) {
        match self.ranges.get(&id) {
            Some(existing)
                if existing.timestamp() > delta.timestamp()
                    || (existing.timestamp() == delta.timestamp()
                        && existing.is_remove()
                        && !delta.is_remove()) => {}
            _ => {
                let _ = self.ranges.insert(id, delta);
            }
        }
    }

    pub fn entry_added(&mut self, hash: EntryHash, coordinate: Coordinate) {
        match self.entries.get(&hash) {
            Some(EntryDelta::Removed(_)) => {}
            _ => {
                let _ = self.entries.insert(hash, EntryDelta::Added(coordinate));
            }
        }
    }

    pub fn entry_removed(&mut self, hash: EntryHash, coordinate: Coordinate) {
        let _ = self.entries.insert(hash, EntryDelta::Removed(coordinate));
    }

    /// Drain everything accumulated since the last flush.
    pub fn take(&mut self) -> ChangeSet {
        ChangeSet {
            ranges: self.ranges.drain().map(|(_, delta)| delta).collect(),
            entries: self.entries.drain().collect(),
        }
    }
}
