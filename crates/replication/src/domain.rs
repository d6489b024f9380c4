//! Pluggable entry→coordinate mapping strategies.
//!
//! A domain decides where on the ring an entry lives and what a peer's
//! initial self-range looks like. Domains must be pure functions of the
//! entry and the open-time arguments — never of local state — or peers
//! would disagree about shard ownership.

use driftlog_primitives::{
    Coordinate, Entry, PeerId, ReplicationError, ReplicationRange, Resolution, Span,
};
use serde::{Deserialize, Serialize};
use sha2::Digest;

use crate::coverage::cover_set;
use crate::index::RangeIndex;

/// What the caller asked for at open time (or in a later `replicate` call).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationRequest {
    /// No local replication responsibility.
    Observer,
    /// Adaptive share, driven by the replication controller.
    Adaptive,
    /// Fixed fraction of the ring in `[0, 1]`.
    Factor(f64),
    /// Explicit arc, both endpoints as ring fractions.
    Range { offset: f64, factor: f64 },
}

impl ReplicationRequest {
    /// Map the common boolean form: `true` = adaptive, `false` = observer.
    #[must_use]
    pub fn from_bool(replicate: bool) -> Self {
        if replicate {
            Self::Adaptive
        } else {
            Self::Observer
        }
    }
}

/// Starting share for an adaptive peer, before the controller has run.
pub const DEFAULT_ADAPTIVE_FACTOR: f64 = 0.1;

/// Context a domain gets when computing the initial self-range.
#[derive(Clone, Copy, Debug)]
pub struct LogContext {
    pub local: PeerId,
    pub now_ms: u64,
}

/// Argument-shaped queries a domain can answer ("who covers window T").
#[derive(Clone, Copy, Debug)]
pub enum CollectArgs {
    /// A raw coordinate span.
    Span(Span),
    /// A wall-clock window, meaningful for the time domain.
    TimeWindow { from_ms: u64, to_ms: u64 },
}

/// The pluggable mapping from opaque entries to ring coordinates.
pub trait ReplicationDomain: Send + Sync {
    /// Short tag recorded with the shared log; peers must open with the
    /// same domain kind.
    fn kind(&self) -> &'static str;

    fn resolution(&self) -> Resolution;

    /// Project an entry onto the ring. Pure and deterministic: identical
    /// on every peer for the same entry.
    fn coordinate_for(&self, entry: &Entry) -> Coordinate;

    /// The self-range a peer starts with for a given open request.
    /// `None` when the request carries no responsibility.
    fn initial_range(
        &self,
        request: &ReplicationRequest,
        ctx: &LogContext,
    ) -> Option<ReplicationRange>;

    /// Peers whose mature ranges cover the queried window.
    fn collect(
        &self,
        index: &RangeIndex,
        role_age_ms: u64,
        args: &CollectArgs,
        now_ms: u64,
    ) -> Vec<PeerId> {
        let span = match *args {
            CollectArgs::Span(span) => span,
            CollectArgs::TimeWindow { .. } => return Vec::new(),
        };
        cover_set(index, self.resolution(), span, role_age_ms, now_ms).peers
    }
}

/// Deterministic placement of a peer's own range: hash of the peer id.
///
/// Uniformly spreads self-ranges without coordination; every peer computes
/// the same offset for a given peer, so announcements are verifiable.
fn anchor_for(resolution: Resolution, peer: &PeerId) -> Coordinate {
    let digest = sha2::Sha256::digest(peer.as_bytes());
    let mut raw = [0_u8; 8];
    raw.copy_from_slice(&digest[..8]);
    resolution.truncate(u64::from_le_bytes(raw))
}

fn range_for_request(
    resolution: Resolution,
    request: &ReplicationRequest,
    ctx: &LogContext,
) -> Option<ReplicationRange> {
    let (offset, width) = match *request {
        ReplicationRequest::Observer => return None,
        ReplicationRequest::Adaptive => (
            anchor_for(resolution, &ctx.local),
            resolution.fraction_to_width(DEFAULT_ADAPTIVE_FACTOR),
        ),
        ReplicationRequest::Factor(factor) => (
            anchor_for(resolution, &ctx.local),
            resolution.fraction_to_width(factor),
        ),
        ReplicationRequest::Range { offset, factor } => (
            resolution.fraction_to_point(offset),
            resolution.fraction_to_width(factor),
        ),
    };
    (width > 0).then(|| ReplicationRange::new(ctx.local, offset, width, ctx.now_ms))
}

/// Load-uniform domain: entries are placed by hashing their grouping key.
#[derive(Clone, Copy, Debug)]
pub struct HashDomain {
    resolution: Resolution,
}

impl HashDomain {
    #[must_use]
    pub fn new(resolution: Resolution) -> Self {
        Self { resolution }
    }
}

impl ReplicationDomain for HashDomain {
    fn kind(&self) -> &'static str {
        "hash"
    }

    fn resolution(&self) -> Resolution {
        self.resolution
    }

    fn coordinate_for(&self, entry: &Entry) -> Coordinate {
        let digest = sha2::Sha256::digest(&entry.group_key);
        let mut raw = [0_u8; 8];
        raw.copy_from_slice(&digest[..8]);
        self.resolution.truncate(u64::from_le_bytes(raw))
    }

    fn initial_range(
        &self,
        request: &ReplicationRequest,
        ctx: &LogContext,
    ) -> Option<ReplicationRange> {
        range_for_request(self.resolution, request, ctx)
    }
}

/// Recency-weighted domain: entries are placed by creation time.
///
/// Projects milliseconds since a configured origin onto a 32-bit ring, so
/// a range over "the last hour" is expressible as an arc. Only valid at
/// 32-bit resolution; the window wraps after `2^32` ms (about 49 days).
#[derive(Clone, Copy, Debug)]
pub struct TimeDomain {
    origin_ms: u64,
}

impl TimeDomain {
    /// `resolution` is taken to surface the incompatibility at open time
    /// rather than silently truncating differently on different peers.
    pub fn new(origin_ms: u64, resolution: Resolution) -> Result<Self, ReplicationError> {
        match resolution {
            Resolution::U32 => Ok(Self { origin_ms }),
            Resolution::U64 => Err(ReplicationError::Configuration(
                "time domain requires 32-bit resolution".to_owned(),
            )),
        }
    }

    fn project(&self, wall_clock_ms: u64) -> Coordinate {
        Resolution::U32.truncate(wall_clock_ms.saturating_sub(self.origin_ms))
    }
}

impl ReplicationDomain for TimeDomain {
    fn kind(&self) -> &'static str {
        "time"
    }

    fn resolution(&self) -> Resolution {
        Resolution::U32
    }

    fn coordinate_for(&self, entry: &Entry) -> Coordinate {
        self.project(entry.wall_clock_ms)
    }

    fn initial_range(
        &self,
        request: &ReplicationRequest,
        ctx: &LogContext,
    ) -> Option<ReplicationRange> {
        range_for_request(Resolution::U32, request, ctx)
    }

    fn collect(
        &self,
        index: &RangeIndex,
        role_age_ms: u64,
        args: &CollectArgs,
        now_ms: u64,
    ) -> Vec<PeerId> {
        let span = match *args {
            CollectArgs::Span(span) => span,
            CollectArgs::TimeWindow { from_ms, to_ms } => {
                if to_ms <= from_ms {
                    return Vec::new();
                }
                Span::new(self.project(from_ms), self.project(to_ms))
            }
        };
        cover_set(index, Resolution::U32, span, role_age_ms, now_ms).peers
    }
}
