//! The modular coordinate space entries are sharded over.
//!
//! Coordinates live on a ring of size `MAX + 1` where `MAX` is either
//! `u32::MAX` or `u64::MAX` depending on the configured [`Resolution`].
//! Arc widths are carried as `u128` so that a full-ring arc (`width ==
//! MAX + 1`) is representable without sentinel values. All arcs are
//! half-open: `[offset, offset + width)`, wrapping past `MAX`.

use borsh::{BorshDeserialize, BorshSerialize};
use serde::{Deserialize, Serialize};

/// A point on the coordinate ring.
///
/// Always strictly less than the ring size of the active resolution; the
/// domain that derives coordinates is responsible for truncation.
pub type Coordinate = u64;

/// Width of the coordinate ring, fixed at open time for the life of a log.
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
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 32-bit ring (`2^32` points). The time domain requires this.
    U32,
    /// 64-bit ring (`2^64` points).
    U64,
}

impl Resolution {
    /// Number of points on the ring (`MAX + 1`).
    #[must_use]
    pub const fn ring_size(self) -> u128 {
        match self {
            Self::U32 => 1 << 32,
            Self::U64 => 1 << 64,
        }
    }

    /// Largest representable coordinate.
    #[must_use]
    pub const fn max_coordinate(self) -> Coordinate {
        match self {
            Self::U32 => u32::MAX as u64,
            Self::U64 => u64::MAX,
        }
    }

    /// Reduce an arbitrary 64-bit value onto this ring.
    #[must_use]
    pub const fn truncate(self, raw: u64) -> Coordinate {
        match self {
            Self::U32 => raw & (u32::MAX as u64),
            Self::U64 => raw,
        }
    }

    /// Wrap-aware addition of a width to a point.
    #[must_use]
    pub fn advance(self, point: Coordinate, width: u128) -> Coordinate {
        ((point as u128 + width) % self.ring_size()) as Coordinate
    }

    /// Clockwise distance from `from` to `to` (zero when equal).
    #[must_use]
    pub fn distance(self, from: Coordinate, to: Coordinate) -> u128 {
        let size = self.ring_size();
        (size + to as u128 - from as u128) % size
    }

    /// Whether `point` lies within the half-open arc `[offset, offset + width)`.
    #[must_use]
    pub fn arc_contains(self, offset: Coordinate, width: u128, point: Coordinate) -> bool {
        if width == 0 {
            return false;
        }
        if width >= self.ring_size() {
            return true;
        }
        self.distance(offset, point) < width
    }

    /// Map a fraction of the ring in `[0, 1]` to an arc width.
    ///
    /// Saturates at the full ring; negative or NaN inputs map to zero.
    #[must_use]
    pub fn fraction_to_width(self, fraction: f64) -> u128 {
        if !(fraction > 0.0) {
            return 0;
        }
        if fraction >= 1.0 {
            return self.ring_size();
        }
        (fraction * self.ring_size() as f64) as u128
    }

    /// Inverse of [`Self::fraction_to_width`].
    #[must_use]
    pub fn width_to_fraction(self, width: u128) -> f64 {
        (width.min(self.ring_size()) as f64) / self.ring_size() as f64
    }

    /// Map a fraction of the ring in `[0, 1)` to a coordinate.
    #[must_use]
    pub fn fraction_to_point(self, fraction: f64) -> Coordinate {
        self.advance(0, self.fraction_to_width(fraction))
    }
}

/// A wire-friendly arc expressed by its endpoints.
///
/// `from == to` denotes the full ring; a full-ring request is the common
/// case for reconciliation, while an empty span is never useful on the wire.
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
pub struct Span {
    pub from: Coordinate,
    pub to: Coordinate,
}

impl Span {
    #[must_use]
    pub const fn new(from: Coordinate, to: Coordinate) -> Self {
        Self { from, to }
    }

    /// The span covering the entire ring.
    #[must_use]
    pub const fn full() -> Self {
        Self { from: 0, to: 0 }
    }

    #[must_use]
    pub const fn is_full(self) -> bool {
        self.from == self.to
    }

    /// Arc width under the given resolution.
    #[must_use]
    pub fn width(self, resolution: Resolution) -> u128 {
        if self.is_full() {
            resolution.ring_size()
        } else {
            resolution.distance(self.from, self.to)
        }
    }

    #[must_use]
    pub fn contains(self, resolution: Resolution, point: Coordinate) -> bool {
        resolution.arc_contains(self.from, self.width(resolution), point)
    }

    /// Whether this span shares at least one point with `[offset, offset + width)`.
    #[must_use]
    pub fn intersects(self, resolution: Resolution, offset: Coordinate, width: u128) -> bool {
        if width == 0 {
            return false;
        }
        if self.is_full() || width >= resolution.ring_size() {
            return true;
        }
        // Two wrapping half-open arcs intersect iff either contains the
        // other's start.
        self.contains(resolution, offset) || resolution.arc_contains(offset, width, self.from)
    }
}
