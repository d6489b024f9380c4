//! Open-time configuration with named-constant defaults.
//!
//! Everything tunable about the replication layer is decided here, once,
//! when a shared log is opened: the replication request, the domain and
//! its resolution, churn damping, wait budgets and synchronizer tuning.

use driftlog_primitives::Resolution;
use driftlog_replication::{ControllerConfig, ReplicationRequest};
use serde::{Deserialize, Serialize};

/// Default minimum age before a peer's range is trusted for coverage
/// decisions (10 seconds). Damps churn-induced flapping.
pub const DEFAULT_ROLE_AGE_MS: u64 = 10_000;

/// Default pause between coverage-wait attempts (500 ms).
pub const DEFAULT_WAIT_RETRY_INTERVAL_MS: u64 = 500;

/// Default number of coverage-wait attempts before surfacing a timeout.
pub const DEFAULT_WAIT_MAX_ATTEMPTS: u32 = 20;

/// Default coalescing window for change notifications (100 ms).
///
/// Bulk operations fold into one synchronizer cycle instead of a message
/// storm; interactive appends still propagate within the window.
pub const DEFAULT_DEBOUNCE_MS: u64 = 100;

/// Default cap on explicit hash-list batches.
pub const DEFAULT_MAX_SIMPLE_ENTRIES: usize = 128;

/// Which entry→coordinate domain to run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DomainSelection {
    /// Load-uniform sharding by grouping key.
    Hash,
    /// Recency-weighted sharding by wall-clock time.
    Time { origin_ms: u64 },
}

/// Which synchronizer implementation to construct.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SynchronizerChoice {
    Simple,
    RatelessIblt,
}

/// Replication configuration, fixed at open time.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationOptions {
    /// What share of the ring this peer takes responsibility for.
    pub request: ReplicationRequest,

    pub domain: DomainSelection,

    /// Coordinate resolution, fixed for the life of the shared log.
    pub resolution: Resolution,

    /// Minimum range age before it counts toward coverage (ms).
    pub role_age_ms: u64,

    /// Pause between coverage-wait attempts (ms).
    pub wait_retry_interval_ms: u64,

    /// Coverage-wait attempts before a timeout is surfaced.
    pub wait_max_attempts: u32,

    /// Change-notification coalescing window (ms).
    pub debounce_ms: u64,

    /// Cap on explicit hash-list batches (simple path and escape hatch).
    pub max_simple_entries: usize,

    pub synchronizer: SynchronizerChoice,

    pub controller: ControllerConfig,
}

impl Default for ReplicationOptions {
    fn default() -> Self {
        Self {
            request: ReplicationRequest::Adaptive,
            domain: DomainSelection::Hash,
            resolution: Resolution::U32,
            role_age_ms: DEFAULT_ROLE_AGE_MS,
            wait_retry_interval_ms: DEFAULT_WAIT_RETRY_INTERVAL_MS,
            wait_max_attempts: DEFAULT_WAIT_MAX_ATTEMPTS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            max_simple_entries: DEFAULT_MAX_SIMPLE_ENTRIES,
            synchronizer: SynchronizerChoice::RatelessIblt,
            controller: ControllerConfig::default(),
        }
    }
}
