//! Replication orchestrator for driftlog shared logs.
//!
//! Ties the pure sharding state (`driftlog-replication`) and the
//! synchronizers (`driftlog-sync`) to the external collaborators — log,
//! messenger, identity — behind a single [`ReplicationManager`] handle.
//! All change propagation is debounced: mutations land in a
//! [`ChangeAccumulator`] and a background task flushes them once per
//! window.

pub mod accumulator;
pub mod config;
pub mod manager;
pub mod tracking;

pub use accumulator::{ChangeAccumulator, ChangeSet, EntryDelta, RangeDelta};
pub use config::{
    DomainSelection, ReplicationOptions, SynchronizerChoice, DEFAULT_DEBOUNCE_MS,
    DEFAULT_MAX_SIMPLE_ENTRIES, DEFAULT_ROLE_AGE_MS, DEFAULT_WAIT_MAX_ATTEMPTS,
    DEFAULT_WAIT_RETRY_INTERVAL_MS,
};
pub use manager::ReplicationManager;
pub use tracking::{PeerSyncStats, SyncTracker};

#[cfg(test)]
#[path = "tests_scenarios.rs"]
mod tests_scenarios;
