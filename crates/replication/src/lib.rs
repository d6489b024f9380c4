//! Sharding state for the driftlog replication layer.
//!
//! Owns the pure, storage-free pieces: the range index over the coordinate
//! ring, the entry-replication metadata index, the pluggable entry→coordinate
//! domains, the cover-set resolver and the adaptive replication controller.
//! Nothing in this crate performs I/O; the orchestrator in `driftlog-node`
//! drives it and `driftlog-sync` consumes its indexes.

pub mod controller;
pub mod coverage;
pub mod domain;
pub mod entries;
pub mod index;

pub use controller::{ControllerConfig, ControllerInputs, ReplicationController};
pub use coverage::{cover_set, coverage_fraction, CoverSet};
pub use domain::{
    CollectArgs, HashDomain, LogContext, ReplicationDomain, ReplicationRequest, TimeDomain,
};
pub use entries::{EntryIndex, EntryMeta};
pub use index::{InsertOutcome, RangeIndex};
