//! Set reconciliation for the driftlog replication layer.
//!
//! Two interchangeable synchronizers behind one contract:
//!
//! - [`SimpleSynchronizer`] sends explicit priority-ordered hash lists;
//!   right for small candidate sets and for high-priority pushes.
//! - [`RatelessIbltSynchronizer`] streams coded symbols so the wire cost
//!   tracks the size of the difference, not the size of the sets.
//!
//! Which one runs is decided at construction; the orchestrator drives
//! either through [`Synchronizer`].

pub mod iblt_sync;
pub mod riblt;
pub mod simple;
pub mod synchronizer;

pub use iblt_sync::{RatelessIbltSynchronizer, DEFAULT_ROUND_BUDGET, DEFAULT_SYMBOL_BATCH};
pub use riblt::{Decoded, Decoder, Encoder, SymbolItem};
pub use simple::SimpleSynchronizer;
pub use synchronizer::{
    default_priority, PriorityFn, SessionKey, SyncContext, SyncStep, SyncTuning, Synchronizer,
    SynchronizerKind,
};
