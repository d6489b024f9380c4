use std::cmp::Ordering;
use std::fmt;

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::peer::PeerId;
use crate::ring::{Coordinate, Resolution};

/// Why a range exists.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
pub enum RangeIntent {
    /// A normal assignment (requested factor, controller output, explicit arc).
    Strict,
    /// Pinned because an entry landed exactly on this range's boundary.
    ///
    /// Pinned ranges take precedence in the boundary tie-break so that an
    /// entry already assigned across a border stays with its assignee.
    BoundaryPinned,
}

/// A peer's claimed arc of ownership on the coordinate ring.
///
/// Covers `[offset, offset + width) mod RING_SIZE`; `width == RING_SIZE`
/// is full-ring coverage. Published ranges are immutable except for
/// replacement by a newer `timestamp` from the same owner over the same
/// span (last-write-wins per owner + span).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize, Serialize, Deserialize,
)]
pub struct ReplicationRange {
    pub owner: PeerId,
    pub offset: Coordinate,
    pub width: u128,
    pub intent: RangeIntent,
    /// Publication time, milliseconds. Only compared between announcements
    /// of the same owner + span.
    pub timestamp: u64,
}

impl ReplicationRange {
    #[must_use]
    pub fn new(owner: PeerId, offset: Coordinate, width: u128, timestamp: u64) -> Self {
        Self {
            owner,
            offset,
            width,
            intent: RangeIntent::Strict,
            timestamp,
        }
    }

    #[must_use]
    pub fn pinned(owner: PeerId, offset: Coordinate, width: u128, timestamp: u64) -> Self {
        Self {
            owner,
            offset,
            width,
            intent: RangeIntent::BoundaryPinned,
            timestamp,
        }
    }

    /// Stable identifier for indexing: hash of `(owner, offset, width)`.
    ///
    /// Deliberately excludes `timestamp` and `intent` so a re-announcement
    /// of the same span replaces rather than duplicates.
    #[must_use]
    pub fn id(&self) -> RangeId {
        let mut hasher = sha2::Sha256::default();
        hasher.update(self.owner.as_bytes());
        hasher.update(self.offset.to_le_bytes());
        hasher.update(self.width.to_le_bytes());
        RangeId(hasher.finalize().into())
    }

    #[must_use]
    pub fn end(&self, resolution: Resolution) -> Coordinate {
        resolution.advance(self.offset, self.width)
    }

    #[must_use]
    pub fn contains(&self, resolution: Resolution, point: Coordinate) -> bool {
        resolution.arc_contains(self.offset, self.width, point)
    }

    #[must_use]
    pub fn is_full_ring(&self, resolution: Resolution) -> bool {
        self.width >= resolution.ring_size()
    }

    /// Whether `point` is the exact half-open start or exclusive end of
    /// this range.
    #[must_use]
    pub fn on_boundary(&self, resolution: Resolution, point: Coordinate) -> bool {
        point == self.offset || point == self.end(resolution)
    }
}

/// Stable index key for a replication range.
#[derive(
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    BorshSerialize,
    BorshDeserialize,
    Serialize,
    Deserialize,
)]
#[serde(transparent)]
pub struct RangeId([u8; 32]);

impl fmt::Display for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&bs58::encode(&self.0).into_string())
    }
}

impl fmt::Debug for RangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RangeId({self})")
    }
}

/// Deterministic tie-break between two ranges competing for a coordinate
/// that lies exactly on their shared boundary.
///
/// Total order over the ranges' identifying data only: a `BoundaryPinned`
/// range beats a `Strict` one, then the smaller owner id wins. Pure and
/// symmetric, so every peer resolves the same single owner regardless of
/// the order the ranges were learned in.
#[must_use]
pub fn boundary_winner<'a>(
    a: &'a ReplicationRange,
    b: &'a ReplicationRange,
) -> &'a ReplicationRange {
    match boundary_precedence(a, b) {
        Ordering::Greater => a,
        _ => b,
    }
}

fn intent_rank(intent: RangeIntent) -> u8 {
    match intent {
        RangeIntent::Strict => 0,
        RangeIntent::BoundaryPinned => 1,
    }
}

/// `Greater` means `a` wins the boundary.
fn boundary_precedence(a: &ReplicationRange, b: &ReplicationRange) -> Ordering {
    intent_rank(a.intent)
        .cmp(&intent_rank(b.intent))
        // Smaller owner wins, hence the reversed comparison.
        .then_with(|| b.owner.cmp(&a.owner))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(tag: u8) -> PeerId {
        PeerId::from([tag; 32])
    }

    #[test]
    fn id_ignores_timestamp_and_intent() {
        let a = ReplicationRange::new(peer(1), 10, 20, 100);
        let mut b = a;
        b.timestamp = 999;
        b.intent = RangeIntent::BoundaryPinned;
        assert_eq!(a.id(), b.id());

        let mut c = a;
        c.offset = 11;
        assert_ne!(a.id(), c.id());
    }

    #[test]
    fn boundary_tie_break_is_symmetric() {
        let a = ReplicationRange::new(peer(1), 0, 100, 5);
        let b = ReplicationRange::new(peer(2), 100, 100, 5);
        assert_eq!(boundary_winner(&a, &b).owner, peer(1));
        assert_eq!(boundary_winner(&b, &a).owner, peer(1));
    }

    #[test]
    fn pinned_intent_beats_owner_order() {
        let small = ReplicationRange::new(peer(1), 0, 100, 5);
        let pinned = ReplicationRange::pinned(peer(9), 100, 100, 5);
        assert_eq!(boundary_winner(&small, &pinned).owner, peer(9));
        assert_eq!(boundary_winner(&pinned, &small).owner, peer(9));
    }

    #[test]
    fn serde_round_trip_preserves_identity() {
        let range = ReplicationRange::pinned(peer(7), 42, 1_u128 << 40, 5);
        let json = serde_json::to_string(&range).unwrap();
        let back: ReplicationRange = serde_json::from_str(&json).unwrap();
        assert_eq!(back, range);
        assert_eq!(back.id(), range.id());
    }

    #[test]
    fn wrap_around_end() {
        let res = Resolution::U32;
        let range = ReplicationRange::new(peer(1), res.max_coordinate() - 9, 20, 0);
        assert_eq!(range.end(res), 10);
        assert!(range.contains(res, 0));
        assert!(range.on_boundary(res, 10));
    }
}
