//! # Core Error Types
//!
//! All errors that can cross the public surface of the regionized
//! core. The taxonomy distinguishes fatal invariant violations
//! (surfaced by panicking, not by this enum), programmer errors in
//! collaborator code (affinity violations, re-entrant access), and
//! recoverable operational errors.

use crate::coord::CellPos;
use crate::token::{ObjectId, RegionId, TaskId};
use thiserror::Error;

/// Errors surfaced by the regionized core.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// A guard-protected mutation was attempted from a thread other
    /// than the owning region's worker. Returned only under the
    /// logging guard policy; the fatal policy panics instead.
    #[error("affinity violation: {region} is owned by thread {owner_thread}, called from {calling_thread}")]
    AffinityViolation {
        /// Region owning the resource.
        region: RegionId,
        /// Debug identity of the owning worker thread.
        owner_thread: String,
        /// Debug identity of the violating caller thread.
        calling_thread: String,
    },

    /// An operation carried an ownership token superseded by a later
    /// migration.
    #[error("stale token for {object}: expected generation {expected}, got {actual}")]
    StaleToken {
        /// Object whose token was stale.
        object: ObjectId,
        /// Generation currently recorded by the owner.
        expected: u64,
        /// Generation presented by the caller.
        actual: u64,
    },

    /// The region id is not (or no longer) registered.
    #[error("unknown region: {0}")]
    UnknownRegion(RegionId),

    /// The object id is not owned by any region.
    #[error("unknown object: {0}")]
    UnknownObject(ObjectId),

    /// The object is mid-migration; its state is frozen and cannot be
    /// mutated until the destination installs it.
    #[error("{object} is pending migration from {from} to {to}")]
    ObjectPendingMigration {
        /// Object in the migration window.
        object: ObjectId,
        /// Region that released the object.
        from: RegionId,
        /// Region that will install the object.
        to: RegionId,
    },

    /// The object stands on a cell no region owns. It is parked by the
    /// migration protocol and re-dispatched once the cell is claimed.
    #[error("{object} is parked off-partition, last held by {from}")]
    ObjectParked {
        /// The parked object.
        object: ObjectId,
        /// Region that last held the object.
        from: RegionId,
    },

    /// A cell claim would overlap an existing region's bounds.
    #[error("cell {cell} is already claimed by {existing}")]
    BoundsOverlap {
        /// The contested cell.
        cell: CellPos,
        /// Region currently owning the cell.
        existing: RegionId,
    },

    /// The cell resolves to no region.
    #[error("cell {0} is unowned")]
    UnownedCell(CellPos),

    /// Merge requested for regions whose bounds do not touch.
    #[error("cannot merge {a} and {b}: bounds are not adjacent")]
    MergeNotAdjacent {
        /// First merge operand.
        a: RegionId,
        /// Second merge operand.
        b: RegionId,
    },

    /// A split request selected no cells, or all of them.
    #[error("split of {region} selected {selected} of {total} cells")]
    InvalidSplit {
        /// Region being split.
        region: RegionId,
        /// Cells selected for the new region.
        selected: usize,
        /// Cells currently owned.
        total: usize,
    },

    /// Destroy requested for a region that still owns objects.
    #[error("{region} still owns {objects} objects and cannot be destroyed")]
    RegionNotEmpty {
        /// Region requested for destruction.
        region: RegionId,
        /// Number of objects still owned.
        objects: usize,
    },

    /// A barrier was requested from a thread that belongs to one of
    /// the target regions, which would deadlock.
    #[error("barrier over {region} requested from its own worker thread")]
    BarrierFromOwnedThread {
        /// Region whose worker issued the request.
        region: RegionId,
    },

    /// A guard-checked entry point was re-entered while a borrow of
    /// the region's object table was already live, from inside object
    /// advancement or a nested object closure.
    #[error("re-entrant access to {region} from inside its own tick")]
    ReentrantAccess {
        /// Region whose tick is in progress.
        region: RegionId,
    },

    /// A task could not be routed and was dead-lettered.
    #[error("{task} could not be delivered: {reason}")]
    TaskUndeliverable {
        /// The undeliverable task.
        task: TaskId,
        /// Human-readable routing failure.
        reason: String,
    },

    /// Configuration failed to parse or validate.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operating system refused to spawn a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    ThreadSpawn(String),

    /// The coordinator is shutting down and rejects new work.
    #[error("coordinator is shutting down")]
    ShuttingDown,
}

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;
