//! # Region Directory
//!
//! Process-wide authoritative map from cell coordinates to the owning
//! region. Every region thread resolves cells on its tick hot path, so
//! the read side must never take a lock; writes happen only from the
//! global coordinator while the affected regions are barriered.
//!
//! ## Safety Note
//!
//! This module requires unsafe code for lock-free double buffering.
//! All unsafe blocks are carefully reviewed and documented.

#![allow(unsafe_code)]
//!
//! ## Architecture
//!
//! ```text
//!                 ┌───────────────────────────────┐
//!                 │        RegionDirectory        │
//!                 │                               │
//!                 │  ┌─────────┐    ┌─────────┐   │
//!                 │  │  Map A  │    │  Map B  │   │
//!                 │  └────┬────┘    └────┬────┘   │
//!                 │       │              │        │
//!                 │  ┌────┴──────────────┴─────┐  │
//!                 │  │  Atomic Active Index    │  │
//!                 │  │  Per-buffer read counts │  │
//!                 │  └─────────────────────────┘  │
//!                 └───────────────────────────────┘
//!                        │                │
//!                        ▼                ▼
//!                 region threads    coordinator
//!                 (resolve, many)  (apply, single,
//!                                   under barrier)
//! ```
//!
//! The single writer mutates the inactive map, publishes it by
//! swapping the active index, waits for stragglers on the retired map
//! to drain, then replays the same mutations there so both maps stay
//! identical between writes.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use veldt_core::{CellPos, RegionId};

/// Result of resolving a cell.
///
/// Unclaimed space resolving to [`Owner::Unowned`] is a legal
/// directory state, not an error.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Owner {
    /// The cell is claimed by this region.
    Region(RegionId),
    /// The cell is not claimed by any region.
    Unowned,
}

/// A single directory mutation, applied under barrier.
#[derive(Clone, Copy, Debug)]
pub(crate) enum DirectoryOp {
    /// Map a cell to a region, replacing any previous owner.
    Assign(CellPos, RegionId),
    /// Remove a cell from the claimed partition.
    Remove(CellPos),
}

/// Double-buffered cell map with a lock-free read path.
///
/// ## Thread Safety
///
/// - `resolve`: callable from any thread, any number concurrently
/// - `apply`: single writer only - the coordinator serializes all
///   calls behind its barrier lock
pub struct RegionDirectory {
    /// The two map buffers. `UnsafeCell` because readers and the
    /// writer coordinate through `active` and `readers`, not a lock.
    buffers: [UnsafeCell<HashMap<CellPos, RegionId>>; 2],
    /// Index of the buffer readers should use (0 or 1).
    active: AtomicUsize,
    /// Number of in-flight readers per buffer.
    readers: [AtomicUsize; 2],
}

// SAFETY: all access to the buffers is mediated by the active index
// and reader counts; the writer never mutates a buffer that a reader
// can still dereference (see `resolve` and `apply`).
unsafe impl Send for RegionDirectory {}
// SAFETY: as above.
unsafe impl Sync for RegionDirectory {}

impl RegionDirectory {
    /// Creates an empty directory: all space unowned.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffers: [
                UnsafeCell::new(HashMap::new()),
                UnsafeCell::new(HashMap::new()),
            ],
            active: AtomicUsize::new(0),
            readers: [AtomicUsize::new(0), AtomicUsize::new(0)],
        }
    }

    /// Resolves a cell to its current owner. Lock-free; callable from
    /// any thread.
    ///
    /// `SeqCst` is required on this path: with plain acquire/release a
    /// reader's count increment and the writer's index swap can miss
    /// each other (store-buffer reordering), letting the writer mutate
    /// a map mid-read.
    #[must_use]
    pub fn resolve(&self, cell: CellPos) -> Owner {
        loop {
            let idx = self.active.load(Ordering::SeqCst);
            self.readers[idx].fetch_add(1, Ordering::SeqCst);
            if self.active.load(Ordering::SeqCst) == idx {
                // SAFETY: we announced ourselves on `readers[idx]` and
                // confirmed the buffer is still active; the writer
                // only mutates a buffer after it is inactive AND its
                // reader count has drained to zero.
                let owner = unsafe { (*self.buffers[idx].get()).get(&cell).copied() };
                self.readers[idx].fetch_sub(1, Ordering::SeqCst);
                return match owner {
                    Some(region) => Owner::Region(region),
                    None => Owner::Unowned,
                };
            }
            // The writer swapped underneath us; back out and retry.
            self.readers[idx].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Number of claimed cells. Reads like `resolve`; intended for
    /// diagnostics, not the hot path.
    #[must_use]
    pub fn claimed_cells(&self) -> usize {
        loop {
            let idx = self.active.load(Ordering::SeqCst);
            self.readers[idx].fetch_add(1, Ordering::SeqCst);
            if self.active.load(Ordering::SeqCst) == idx {
                // SAFETY: same protocol as `resolve`.
                let len = unsafe { (*self.buffers[idx].get()).len() };
                self.readers[idx].fetch_sub(1, Ordering::SeqCst);
                return len;
            }
            self.readers[idx].fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Applies a batch of mutations.
    ///
    /// Single writer only: the coordinator calls this while holding
    /// its barrier lock, with every affected region parked. Both
    /// buffers are identical again when this returns.
    pub(crate) fn apply(&self, ops: &[DirectoryOp]) {
        let front = self.active.load(Ordering::SeqCst);
        let back = front ^ 1;

        // Drain stragglers from before the previous swap.
        self.wait_for_readers(back);
        // SAFETY: `back` is inactive; a reader that transiently bumps
        // its count will fail the index recheck and never dereference
        // the map. External serialization guarantees no second writer.
        unsafe {
            Self::apply_ops(&mut *self.buffers[back].get(), ops);
        }

        // Publish the updated buffer.
        self.active.store(back, Ordering::SeqCst);

        // Bring the retired buffer up to date for the next write.
        self.wait_for_readers(front);
        // SAFETY: `front` is now inactive and drained, as above.
        unsafe {
            Self::apply_ops(&mut *self.buffers[front].get(), ops);
        }
    }

    fn wait_for_readers(&self, idx: usize) {
        while self.readers[idx].load(Ordering::SeqCst) != 0 {
            std::thread::yield_now();
        }
    }

    fn apply_ops(map: &mut HashMap<CellPos, RegionId>, ops: &[DirectoryOp]) {
        for op in ops {
            match *op {
                DirectoryOp::Assign(cell, region) => {
                    map.insert(cell, region);
                }
                DirectoryOp::Remove(cell) => {
                    map.remove(&cell);
                }
            }
        }
    }
}

impl Default for RegionDirectory {
    fn default() -> Self {
        Self::new()
    }
}
