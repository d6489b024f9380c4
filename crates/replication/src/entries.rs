//! Entry-replication metadata index.
//!
//! A lightweight projection of each locally-known entry — hash, ring
//! coordinates, group id, boundary flag — kept apart from the log's own
//! storage so range-scoped queries never touch entry payloads. Keys are
//! stable identifiers (hash, coordinate), never object references.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use driftlog_primitives::{Coordinate, EntryHash, Resolution, Span};

/// Projection of one entry into replication space.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EntryMeta {
    pub hash: EntryHash,
    /// Ring coordinates the entry maps to. Usually one; a custom domain
    /// may project an entry to several.
    pub coordinates: Vec<Coordinate>,
    /// Group identifier (digest of the grouping key).
    pub group: EntryHash,
    /// Set when the entry's coordinate landed exactly on a range boundary
    /// and was assigned through the tie-break rule.
    pub boundary_pinned: bool,
}

/// Index of entry metadata, ordered by coordinate for span scans.
#[derive(Debug, Default)]
pub struct EntryIndex {
    by_hash: HashMap<EntryHash, EntryMeta>,
    by_coordinate: BTreeMap<Coordinate, BTreeSet<EntryHash>>,
    scans: AtomicU64,
}

impl EntryIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    /// Number of span scans performed since creation.
    ///
    /// Synchronizers re-scan the index whenever a cached encoder was
    /// invalidated, so tests use this counter to observe rebuilds.
    #[must_use]
    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::Relaxed)
    }

    /// Insert or update the metadata for an entry.
    pub fn put(&mut self, meta: EntryMeta) {
        if let Some(previous) = self.by_hash.insert(meta.hash, meta.clone()) {
            self.unlink(&previous);
        }
        for coordinate in &meta.coordinates {
            let _ = self
                .by_coordinate
                .entry(*coordinate)
                .or_default()
                .insert(meta.hash);
        }
    }

    /// Remove an entry's metadata (entry pruned from the log).
    pub fn delete(&mut self, hash: &EntryHash) -> Option<EntryMeta> {
        let meta = self.by_hash.remove(hash)?;
        self.unlink(&meta);
        Some(meta)
    }

    #[must_use]
    pub fn get(&self, hash: &EntryHash) -> Option<&EntryMeta> {
        self.by_hash.get(hash)
    }

    #[must_use]
    pub fn contains(&self, hash: &EntryHash) -> bool {
        self.by_hash.contains_key(hash)
    }

    /// All metadata whose coordinate falls inside `span`, as sorted
    /// `(coordinate, hash)` pairs. Counts as one scan.
    #[must_use]
    pub fn scan_span(&self, resolution: Resolution, span: Span) -> Vec<(Coordinate, EntryHash)> {
        let _ = self.scans.fetch_add(1, Ordering::Relaxed);
        let mut out = Vec::new();
        if span.is_full() {
            for (coordinate, hashes) in &self.by_coordinate {
                out.extend(hashes.iter().map(|h| (*coordinate, *h)));
            }
            return out;
        }
        if span.from < span.to {
            self.collect_linear(span.from..span.to, &mut out);
        } else {
            // Wrapping span: [from, MAX] then [0, to).
            self.collect_linear(span.from..=resolution.max_coordinate(), &mut out);
            self.collect_linear(0..span.to, &mut out);
        }
        out
    }

    /// Number of entries inside `span`, without yielding them.
    #[must_use]
    pub fn count_span(&self, resolution: Resolution, span: Span) -> usize {
        self.scan_span(resolution, span).len()
    }

    fn collect_linear(
        &self,
        range: impl std::ops::RangeBounds<Coordinate>,
        out: &mut Vec<(Coordinate, EntryHash)>,
    ) {
        for (coordinate, hashes) in self.by_coordinate.range(range) {
            out.extend(hashes.iter().map(|h| (*coordinate, *h)));
        }
    }

    fn unlink(&mut self, meta: &EntryMeta) {
        for coordinate in &meta.coordinates {
            if let Some(hashes) = self.by_coordinate.get_mut(coordinate) {
                let _ = hashes.remove(&meta.hash);
                if hashes.is_empty() {
                    let _ = self.by_coordinate.remove(coordinate);
                }
            }
        }
    }
}
