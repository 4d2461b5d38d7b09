//! # Tasks and the Collaborator Seam
//!
//! Simulation rules live outside this crate. They reach region state
//! through two narrow seams:
//!
//! - [`ObjectLogic`], implemented per object kind and invoked once per
//!   tick by the owning region's scheduler;
//! - [`Task`] payloads, deferred closures executed exactly once
//!   against the state of whichever region owns the target when the
//!   task comes due.
//!
//! Both run on the owning region's worker thread with the guard
//! already validated; collaborator code never touches foreign region
//! state directly.

use veldt_core::{CellPos, CoreError, CoreResult, ObjectId, OwnershipToken, RegionId, TaskId};

use crate::region::RegionWorld;

/// Error type produced by collaborator simulation logic. Failures are
/// isolated to the failing object; they never halt a region.
pub type SimError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Per-object simulation behavior supplied by collaborator code.
pub trait ObjectLogic: Send {
    /// Advances the object by one tick. May move the object by
    /// updating [`ObjectState::set_cell`]; the migration protocol
    /// picks up boundary crossings after the tick's advancement phase.
    ///
    /// # Errors
    ///
    /// Returning an error skips the object for the rest of the tick
    /// and counts toward its quarantine threshold.
    fn advance(&mut self, state: &mut ObjectState, tick: u64) -> Result<(), SimError>;
}

/// Engine-visible state of a simulation object: identity, position
/// and the object-side ownership record.
#[derive(Debug, Clone, Copy)]
pub struct ObjectState {
    id: ObjectId,
    cell: CellPos,
    token: OwnershipToken,
}

impl ObjectState {
    pub(crate) const fn new(id: ObjectId, cell: CellPos, token: OwnershipToken) -> Self {
        Self { id, cell, token }
    }

    /// Stable object identity.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> ObjectId {
        self.id
    }

    /// Current cell position.
    #[inline]
    #[must_use]
    pub const fn cell(&self) -> CellPos {
        self.cell
    }

    /// Moves the object. Crossing a region boundary is detected by
    /// the scheduler after the advancement phase, never mid-phase.
    #[inline]
    pub fn set_cell(&mut self, cell: CellPos) {
        self.cell = cell;
    }

    /// The object-side ownership record.
    #[inline]
    #[must_use]
    pub const fn token(&self) -> OwnershipToken {
        self.token
    }

    pub(crate) fn set_token(&mut self, token: OwnershipToken) {
        self.token = token;
    }
}

/// Where a task should execute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskTarget {
    /// A specific region, wherever its bounds currently are.
    Region(RegionId),
    /// Whichever region owns this cell at execution time.
    Cell(CellPos),
    /// The global scope, executed by the coordinator's supervisor.
    Global,
}

/// Deferred work executed against the resolved target's state.
pub type TaskPayload = Box<dyn FnOnce(&mut TaskContext<'_>) + Send + 'static>;

/// A unit of deferred work: target, optional earliest-execution tick,
/// and a collaborator payload. Consumed exactly once.
pub struct Task {
    pub(crate) id: TaskId,
    pub(crate) target: TaskTarget,
    pub(crate) earliest_tick: Option<u64>,
    pub(crate) payload: TaskPayload,
}

impl Task {
    pub(crate) fn new(
        id: TaskId,
        target: TaskTarget,
        earliest_tick: Option<u64>,
        payload: TaskPayload,
    ) -> Self {
        Self {
            id,
            target,
            earliest_tick,
            payload,
        }
    }

    /// The task's id, as carried by its [`TaskHandle`].
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.id
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("target", &self.target)
            .field("earliest_tick", &self.earliest_tick)
            .finish_non_exhaustive()
    }
}

/// Handle returned by task submission, usable for cancellation before
/// the task is consumed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TaskHandle {
    pub(crate) id: TaskId,
}

impl TaskHandle {
    /// The underlying task id.
    #[must_use]
    pub const fn id(&self) -> TaskId {
        self.id
    }
}

/// Execution context handed to task payloads and broadcasts.
///
/// For region-scoped execution the context exposes the owning region's
/// objects, either through a direct world reference (barriers,
/// broadcasts) or through the worker's active-world slot (in-tick
/// payloads). For global-scope tasks there is no region and object
/// access fails with [`CoreError::UnknownObject`].
pub struct TaskContext<'a> {
    pub(crate) region: Option<RegionId>,
    pub(crate) tick: u64,
    pub(crate) world: Option<&'a mut RegionWorld>,
}

impl TaskContext<'_> {
    /// The region this payload executes against, or `None` in global
    /// scope.
    #[must_use]
    pub fn region(&self) -> Option<RegionId> {
        self.region
    }

    /// The executing scope's current tick.
    #[must_use]
    pub fn tick(&self) -> u64 {
        self.tick
    }

    /// Ids of all objects owned by the executing region.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        if let Some(world) = &self.world {
            return world.objects.keys().copied().collect();
        }
        if self.region.is_none() {
            return Vec::new();
        }
        crate::scheduler::with_active_world(|world| world.objects.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Runs `f` against an owned object's state.
    ///
    /// The calling thread is the owning worker by construction, so no
    /// further guard check is needed here; the token agreement between
    /// the object and the region table is still verified.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownObject`] if the executing region
    /// does not own the object, or in global scope where there is no
    /// region at all.
    pub fn with_object<R>(
        &mut self,
        id: ObjectId,
        f: impl FnOnce(&mut ObjectState) -> R,
    ) -> CoreResult<R> {
        if let Some(world) = self.world.as_mut() {
            return lookup(world, id, f);
        }
        crate::scheduler::with_active_world(|world| lookup(world, id, f))
            .unwrap_or(Err(CoreError::UnknownObject(id)))
    }
}

fn lookup<R>(
    world: &mut RegionWorld,
    id: ObjectId,
    f: impl FnOnce(&mut ObjectState) -> R,
) -> CoreResult<R> {
    let owned = world
        .objects
        .get_mut(&id)
        .ok_or(CoreError::UnknownObject(id))?;
    owned.verify_token_agreement();
    Ok(f(&mut owned.state))
}
