//! # Ids and Ownership Tokens
//!
//! Regions, objects and tasks are identified by stable integer ids,
//! allocated monotonically and never reused. Ownership of a mutable
//! resource is encoded as an [`OwnershipToken`]: the owning region id
//! plus a generation counter that increases on every handoff. A stale
//! token reaching a mutation path means a caller acted on a superseded
//! ownership state, which is a fatal invariant violation.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Stable identity of a region. Never reused across the process
/// lifetime, even after merge or destroy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct RegionId(u64);

impl RegionId {
    /// Creates a region id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RegionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "region#{}", self.0)
    }
}

/// Stable identity of a simulation object, independent of which region
/// currently owns it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct ObjectId(u64);

impl ObjectId {
    /// Creates an object id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "object#{}", self.0)
    }
}

/// Handle for a submitted task, usable for cancellation before the
/// task is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct TaskId(u64);

impl TaskId {
    /// Creates a task id from its raw value.
    #[inline]
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw id value.
    #[inline]
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task#{}", self.0)
    }
}

/// Versioned ownership tag for a region-owned resource.
///
/// The token is recorded twice: on the object itself and in the owning
/// region's object table. The two records must always agree; the
/// generation strictly increases across migrations and topology
/// reassignments of the same object, so a task enqueued before a
/// migration cannot silently mutate state after it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OwnershipToken {
    region: RegionId,
    generation: u64,
}

impl OwnershipToken {
    /// Creates the first token for a freshly spawned resource.
    #[inline]
    #[must_use]
    pub const fn initial(region: RegionId) -> Self {
        Self {
            region,
            generation: 1,
        }
    }

    /// Returns the owning region recorded in this token.
    #[inline]
    #[must_use]
    pub const fn region(self) -> RegionId {
        self.region
    }

    /// Returns the generation counter.
    #[inline]
    #[must_use]
    pub const fn generation(self) -> u64 {
        self.generation
    }

    /// Produces the successor token for a handoff to `to`. The
    /// generation always increases, even when a topology change hands
    /// the resource back to a region id it was owned by before.
    #[inline]
    #[must_use]
    pub const fn succeed(self, to: RegionId) -> Self {
        Self {
            region: to,
            generation: self.generation + 1,
        }
    }

    /// Returns true if `other` is an older generation of this token.
    #[inline]
    #[must_use]
    pub const fn supersedes(self, other: Self) -> bool {
        self.generation > other.generation
    }
}

impl fmt::Display for OwnershipToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@g{}", self.region, self.generation)
    }
}

/// Monotonic id source. One allocator exists per id namespace
/// (regions, objects, tasks); ids are never reused.
#[derive(Debug)]
pub struct IdAllocator {
    next: AtomicU64,
}

impl IdAllocator {
    /// Creates an allocator that hands out ids starting at `first`.
    #[must_use]
    pub const fn new(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    /// Allocates the next id.
    #[inline]
    pub fn allocate(&self) -> u64 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}
