//! Cover-set resolution.
//!
//! Given a target arc and a role-age cutoff, computes the minimal peer set
//! whose mature ranges union-cover the arc: a greedy furthest-reach walk
//! around the ring. Gaps are not an error — the resolver returns the
//! best-effort set plus the uncovered remainder and lets the caller surface
//! it as a health metric.

use driftlog_primitives::range::boundary_winner;
use driftlog_primitives::{PeerId, ReplicationRange, Resolution, Span};
use tracing::trace;

use crate::index::RangeIndex;

/// Result of resolving coverage for an arc.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CoverSet {
    /// Peers needed to cover the arc, in walk order, deduplicated.
    pub peers: Vec<PeerId>,
    /// Total width of the arc no mature range covers.
    pub uncovered: u128,
}

/// Compute the minimal peer set covering `span`.
///
/// Ranges younger than `role_age_ms` are ignored to damp churn-induced
/// flapping. When several ranges cover the walk cursor equally far, the
/// boundary tie-break picks the winner so every peer resolves the same set.
#[must_use]
pub fn cover_set(
    index: &RangeIndex,
    resolution: Resolution,
    span: Span,
    role_age_ms: u64,
    now_ms: u64,
) -> CoverSet {
    let width = span.width(resolution);
    if width == 0 {
        return CoverSet::default();
    }
    let mature: Vec<&ReplicationRange> = index.iter_mature(role_age_ms, now_ms).collect();

    let mut peers: Vec<PeerId> = Vec::new();
    let mut uncovered: u128 = 0;
    let mut cursor = span.from;
    let mut remaining = width;

    while remaining > 0 {
        match furthest_reach(&mature, resolution, cursor, remaining) {
            Some((range, reach)) => {
                if !peers.contains(&range.owner) {
                    peers.push(range.owner);
                }
                cursor = resolution.advance(cursor, reach);
                remaining -= reach;
            }
            None => {
                // Gap: skip to the nearest mature range start ahead, or to
                // the end of the span if none is in reach.
                let mut jump = remaining;
                for range in &mature {
                    let distance = resolution.distance(cursor, range.offset);
                    if distance > 0 && distance < jump {
                        jump = distance;
                    }
                }
                trace!(gap = jump, "uncovered stretch in cover walk");
                uncovered += jump;
                cursor = resolution.advance(cursor, jump);
                remaining -= jump;
            }
        }
    }

    CoverSet { peers, uncovered }
}

/// The range covering `cursor` that extends furthest clockwise, with its
/// usable reach (capped at `remaining`).
fn furthest_reach<'a>(
    mature: &[&'a ReplicationRange],
    resolution: Resolution,
    cursor: u64,
    remaining: u128,
) -> Option<(&'a ReplicationRange, u128)> {
    let mut best: Option<(&ReplicationRange, u128)> = None;
    for range in mature {
        if !range.contains(resolution, cursor) {
            continue;
        }
        let reach = if range.is_full_ring(resolution) {
            remaining
        } else {
            resolution.distance(cursor, range.end(resolution)).min(remaining)
        };
        best = Some(match best {
            None => (range, reach),
            Some((current, current_reach)) => {
                if reach > current_reach {
                    (range, reach)
                } else if reach < current_reach {
                    (current, current_reach)
                } else {
                    (boundary_winner(current, range), reach)
                }
            }
        });
    }
    best
}

/// Fraction of `window` covered by at least one mature range, in `[0, 1]`.
#[must_use]
pub fn coverage_fraction(
    index: &RangeIndex,
    resolution: Resolution,
    window: Span,
    role_age_ms: u64,
    now_ms: u64,
) -> f64 {
    let width = window.width(resolution);
    if width == 0 {
        return 0.0;
    }
    let uncovered = cover_set(index, resolution, window, role_age_ms, now_ms).uncovered;
    ((width - uncovered) as f64 / width as f64).clamp(0.0, 1.0)
}
