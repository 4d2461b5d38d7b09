//! # Region State
//!
//! A region is a bounded spatial partition with a dedicated worker
//! thread. Everything a region owns - its cell set, object table,
//! local task queue and tick counter - lives in [`RegionWorld`],
//! reachable from exactly one thread during normal operation. The
//! coordinator touches a world only while the region is barriered and
//! its worker is parked, which is why the mutex around it is
//! uncontended in steady state.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::Receiver;
use parking_lot::{Condvar, Mutex};

use veldt_core::{CellPos, ObjectId, OwnershipToken, RegionId};

use crate::queue::LocalQueue;
use crate::scheduler::TickStats;
use crate::task::{ObjectLogic, ObjectState, Task};

/// Table entry for an owned object. Carries the table-side ownership
/// record; the object-side record lives in [`ObjectState`]. The two
/// must always agree.
pub(crate) struct OwnedObject {
    pub(crate) state: ObjectState,
    pub(crate) logic: Box<dyn ObjectLogic>,
    /// Table-side ownership record.
    pub(crate) token: OwnershipToken,
    /// Consecutive advancement failures since the last success.
    pub(crate) failures: u32,
    /// Excluded from ticking pending external diagnosis.
    pub(crate) quarantined: bool,
}

impl OwnedObject {
    pub(crate) fn new(state: ObjectState, logic: Box<dyn ObjectLogic>) -> Self {
        let token = state.token();
        Self {
            state,
            logic,
            token,
            failures: 0,
            quarantined: false,
        }
    }

    /// Fatal check that the object-side and table-side ownership
    /// records agree. Disagreement means a migration or topology
    /// change lost bookkeeping, and continuing risks silent
    /// corruption.
    pub(crate) fn verify_token_agreement(&self) {
        assert!(
            self.state.token() == self.token,
            "ownership records disagree for {}: object says {}, table says {}",
            self.state.id(),
            self.state.token(),
            self.token
        );
    }

    /// Rebinds both ownership records to a successor token.
    pub(crate) fn rebind(&mut self, token: OwnershipToken) {
        self.token = token;
        self.state.set_token(token);
    }
}

/// An object in flight between regions. Its state is frozen: nobody
/// mutates it until the destination installs it.
pub(crate) struct ReceiveObject {
    pub(crate) state: ObjectState,
    pub(crate) logic: Box<dyn ObjectLogic>,
}

/// Messages accepted by a region's cross-thread inbox.
pub(crate) enum Inbound {
    /// A routed collaborator task.
    Task(Task),
    /// An object handoff completing a migration.
    Receive(ReceiveObject),
}

/// Scheduler state machine: `Idle -> Ticking -> Idle` at the tick
/// cadence, with `Barriered` entered only on coordinator request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    Idle,
    Ticking,
    Barriered,
}

pub(crate) struct ControlState {
    pub(crate) run: RunState,
    pub(crate) barrier_requested: bool,
    pub(crate) shutdown: bool,
}

/// Shared control block between a region's worker thread and the
/// coordinator: run-state handshake, published tick counter, timing
/// stats.
pub(crate) struct RegionControl {
    pub(crate) state: Mutex<ControlState>,
    pub(crate) cond: Condvar,
    /// Monotonic tick counter, published at the end of every tick.
    /// The coordinator reads it to detect quiescence and progress.
    pub(crate) ticks: AtomicU64,
    pub(crate) stats: Mutex<TickStats>,
}

impl RegionControl {
    /// `start_barriered` spawns the worker parked, so the coordinator
    /// can finish wiring (directory, endpoints) before the first tick.
    pub(crate) fn new(start_barriered: bool) -> Self {
        Self {
            state: Mutex::new(ControlState {
                run: RunState::Idle,
                barrier_requested: start_barriered,
                shutdown: false,
            }),
            cond: Condvar::new(),
            ticks: AtomicU64::new(0),
            stats: Mutex::new(TickStats::default()),
        }
    }

    pub(crate) fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Asks the worker to finish its current tick and park. Returns
    /// immediately; pair with [`Self::wait_barriered`].
    pub(crate) fn request_barrier(&self) {
        let mut s = self.state.lock();
        s.barrier_requested = true;
        self.cond.notify_all();
    }

    /// Blocks until the worker reports `Barriered` (or has shut down,
    /// in which case its world is free anyway).
    pub(crate) fn wait_barriered(&self) {
        let mut s = self.state.lock();
        while s.run != RunState::Barriered && !s.shutdown {
            self.cond.wait(&mut s);
        }
    }

    /// Lifts the barrier, letting the worker resume ticking.
    pub(crate) fn release_barrier(&self) {
        let mut s = self.state.lock();
        s.barrier_requested = false;
        self.cond.notify_all();
    }

    /// Flags the worker for controlled shutdown after its current
    /// park point; it will not start another tick.
    pub(crate) fn request_shutdown(&self) {
        let mut s = self.state.lock();
        s.shutdown = true;
        self.cond.notify_all();
    }
}

/// The state a region owns: cells, objects, queue, tick counter and
/// the receiving end of its inbox.
pub(crate) struct RegionWorld {
    pub(crate) id: RegionId,
    pub(crate) cells: HashSet<CellPos>,
    pub(crate) objects: HashMap<ObjectId, OwnedObject>,
    pub(crate) queue: LocalQueue,
    pub(crate) inbox: Receiver<Inbound>,
    /// Local tick counter; mirrored into the control block at publish.
    pub(crate) tick: u64,
}

impl RegionWorld {
    pub(crate) fn new(id: RegionId, cells: HashSet<CellPos>, inbox: Receiver<Inbound>) -> Self {
        Self {
            id,
            cells,
            objects: HashMap::new(),
            queue: LocalQueue::new(),
            inbox,
            tick: 0,
        }
    }

    pub(crate) fn quarantined_count(&self) -> usize {
        self.objects.values().filter(|o| o.quarantined).count()
    }
}

/// Coordinator-side handle to a live region.
pub(crate) struct RegionHandle {
    pub(crate) id: RegionId,
    pub(crate) world: std::sync::Arc<Mutex<RegionWorld>>,
    pub(crate) control: std::sync::Arc<RegionControl>,
    pub(crate) join: Option<JoinHandle<()>>,
}
