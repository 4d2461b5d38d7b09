//! # Global Coordinator
//!
//! The single owner of world topology. Every structural change -
//! creating, splitting, merging or destroying a region, claiming a
//! cell, spawning an object - goes through the coordinator, which
//! serializes writers behind one barrier lock and parks the affected
//! region workers before touching their state.
//!
//! ## Architecture
//!
//! ```text
//!            callers                     supervisor thread
//!               │                              │
//!               ▼                              ▼
//!        ┌─────────────────────────────────────────────┐
//!        │                Coordinator                  │
//!        │  barrier lock · region table · id sources   │
//!        └───────┬─────────────┬─────────────┬─────────┘
//!                │             │             │
//!                ▼             ▼             ▼
//!           directory      migration     region workers
//!           (apply)        protocol      (park/release)
//! ```
//!
//! Barriers park regions in ascending id order, so two overlapping
//! topology operations cannot deadlock on each other's workers. A
//! barrier request from a region's own worker thread is rejected up
//! front: the worker cannot park itself and wait for itself.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, error, info};

use veldt_core::{
    CellBounds, CellPos, CoreConfig, CoreError, CoreResult, IdAllocator, ObjectId, OwnershipToken,
    RegionId, TaskId, ThreadAffinityGuard,
};

use crate::directory::{DirectoryOp, Owner, RegionDirectory};
use crate::migrate::{MigrationProtocol, ObjectLocation};
use crate::queue::QueueItem;
use crate::region::{Inbound, OwnedObject, RegionControl, RegionHandle, RegionWorld};
use crate::scheduler::{run_region, RegionThreadCtx, Shared, TickStats};
use crate::task::{
    ObjectLogic, ObjectState, Task, TaskContext, TaskHandle, TaskPayload, TaskTarget,
};

/// Supervisor passes between load-rebalance checks.
const REBALANCE_INTERVAL: u64 = 32;

/// Bounded retries for operations racing topology changes between a
/// lock-free directory read and the barrier that follows it.
const TOPOLOGY_RETRIES: usize = 8;

/// A region parked for a barrier, with its world and control blocks.
struct ParkedRegion {
    id: RegionId,
    world: Arc<Mutex<RegionWorld>>,
    control: Arc<RegionControl>,
}

/// Barriers are released when this drops, including on error paths.
struct ParkedSet {
    regions: Vec<ParkedRegion>,
}

impl Drop for ParkedSet {
    fn drop(&mut self) {
        for region in &self.regions {
            region.control.release_barrier();
        }
    }
}

/// Exclusive view over a set of parked regions, handed to
/// [`Coordinator::request_barrier`] callbacks. While the scope exists
/// the named regions do not tick, so reads across them are mutually
/// consistent.
pub struct BarrierScope<'a> {
    worlds: Vec<(RegionId, &'a mut RegionWorld)>,
}

impl BarrierScope<'_> {
    /// Ids of the regions held by this barrier.
    #[must_use]
    pub fn region_ids(&self) -> Vec<RegionId> {
        self.worlds.iter().map(|(id, _)| *id).collect()
    }

    /// Total objects owned across all held regions.
    #[must_use]
    pub fn object_count(&self) -> usize {
        self.worlds.iter().map(|(_, w)| w.objects.len()).sum()
    }

    /// The local tick counter of one held region.
    #[must_use]
    pub fn region_tick(&self, region: RegionId) -> Option<u64> {
        self.worlds
            .iter()
            .find(|(id, _)| *id == region)
            .map(|(_, w)| w.tick)
    }

    /// Ids of every object owned by the held regions.
    #[must_use]
    pub fn object_ids(&self) -> Vec<ObjectId> {
        self.worlds
            .iter()
            .flat_map(|(_, w)| w.objects.keys().copied())
            .collect()
    }

    /// Runs `f` against an object owned by any held region. The
    /// barrier substitutes for the affinity guard here: the owning
    /// worker is parked, so this thread has exclusive access.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownObject`] if no held region owns the
    /// object.
    pub fn with_object<R>(
        &mut self,
        object: ObjectId,
        f: impl FnOnce(&mut ObjectState) -> R,
    ) -> CoreResult<R> {
        for (_, world) in &mut self.worlds {
            if let Some(owned) = world.objects.get_mut(&object) {
                owned.verify_token_agreement();
                return Ok(f(&mut owned.state));
            }
        }
        Err(CoreError::UnknownObject(object))
    }
}

/// Point-in-time capture of one object.
#[derive(Clone, Copy, Debug)]
pub struct ObjectSnapshot {
    /// The object's id.
    pub id: ObjectId,
    /// Cell the object stood on at capture.
    pub cell: CellPos,
    /// Ownership generation at capture.
    pub generation: u64,
    /// True if the object is excluded from ticking.
    pub quarantined: bool,
}

/// Point-in-time capture of one region.
#[derive(Clone, Debug)]
pub struct RegionSnapshot {
    /// The region's id.
    pub id: RegionId,
    /// Local tick counter at capture.
    pub tick: u64,
    /// Cells owned, sorted.
    pub cells: Vec<CellPos>,
    /// Objects owned, sorted by id.
    pub objects: Vec<ObjectSnapshot>,
}

/// Globally consistent capture of every region, taken under a
/// world-wide barrier.
#[derive(Clone, Debug)]
pub struct WorldSnapshot {
    /// All live regions, ascending by id.
    pub regions: Vec<RegionSnapshot>,
}

/// Observability counters for one region.
#[derive(Clone, Copy, Debug)]
pub struct RegionStatsSnapshot {
    /// The region's id.
    pub region: RegionId,
    /// Ticks completed so far.
    pub ticks: u64,
    /// Objects currently owned.
    pub objects: usize,
    /// Owned objects currently quarantined.
    pub quarantined: usize,
    /// Items waiting in the local queue.
    pub queued: usize,
    /// Tick timing statistics.
    pub timing: TickStats,
}

/// The global coordinator: topology owner, barrier arbiter and home of
/// the supervisor thread that runs global-scope tasks.
pub struct Coordinator {
    config: CoreConfig,
    directory: Arc<RegionDirectory>,
    guard: Arc<ThreadAffinityGuard>,
    protocol: Arc<MigrationProtocol>,
    shared: Arc<Shared>,
    regions: Mutex<BTreeMap<RegionId, RegionHandle>>,
    /// Serializes every topology writer. Held across park, mutate and
    /// release, so directory writes have exactly one writer.
    barrier_lock: Mutex<()>,
    region_ids: IdAllocator,
    object_ids: IdAllocator,
    task_ids: IdAllocator,
    shutdown: AtomicBool,
    global_tick: AtomicU64,
    supervisor: Mutex<Option<thread::JoinHandle<()>>>,
}

impl Coordinator {
    /// Starts a coordinator with no regions and a running supervisor
    /// thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] for out-of-range knobs, or
    /// [`CoreError::ThreadSpawn`] if the supervisor thread cannot
    /// start.
    pub fn new(config: CoreConfig) -> CoreResult<Arc<Self>> {
        config.validate()?;
        let directory = Arc::new(RegionDirectory::new());
        let guard = Arc::new(ThreadAffinityGuard::new(config.guard_policy));
        let protocol = Arc::new(MigrationProtocol::new(Arc::clone(&directory), config.clone()));
        let shared = Arc::new(Shared {
            config: config.clone(),
            guard: Arc::clone(&guard),
            protocol: Arc::clone(&protocol),
        });

        let coordinator = Arc::new(Self {
            config,
            directory,
            guard,
            protocol,
            shared,
            regions: Mutex::new(BTreeMap::new()),
            barrier_lock: Mutex::new(()),
            region_ids: IdAllocator::new(1),
            object_ids: IdAllocator::new(1),
            task_ids: IdAllocator::new(1),
            shutdown: AtomicBool::new(false),
            global_tick: AtomicU64::new(0),
            supervisor: Mutex::new(None),
        });

        let weak = Arc::downgrade(&coordinator);
        let join = thread::Builder::new()
            .name("veldt-global".to_string())
            .spawn(move || run_global(&weak))
            .map_err(|e| CoreError::ThreadSpawn(e.to_string()))?;
        *coordinator.supervisor.lock() = Some(join);

        info!(
            tick_rate = coordinator.config.tick_rate,
            "coordinator started"
        );
        Ok(coordinator)
    }

    /// The configuration this coordinator runs with.
    #[must_use]
    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    /// Ticks completed by the global supervisor.
    #[must_use]
    pub fn global_tick(&self) -> u64 {
        self.global_tick.load(Ordering::Relaxed)
    }

    /// Ids of all live regions, ascending.
    #[must_use]
    pub fn live_regions(&self) -> Vec<RegionId> {
        self.regions.lock().keys().copied().collect()
    }

    /// Objects currently in the pending-migration window.
    #[must_use]
    pub fn pending_migration_count(&self) -> usize {
        self.protocol.pending_count()
    }

    /// Tasks that could not be delivered anywhere.
    #[must_use]
    pub fn dead_letter_count(&self) -> usize {
        self.protocol.dead_letter_count()
    }

    /// Tasks parked on cells no region currently claims.
    #[must_use]
    pub fn parked_task_count(&self) -> usize {
        self.protocol.parked_task_count()
    }

    /// Objects parked on cells no region currently claims.
    #[must_use]
    pub fn parked_object_count(&self) -> usize {
        self.protocol.parked_object_count()
    }

    /// Resolves which region currently owns a cell. Lock-free.
    #[must_use]
    pub fn current_region_of(&self, cell: CellPos) -> Owner {
        self.directory.resolve(cell)
    }

    /// Reports an object's location: owned, in flight, parked, or
    /// unknown.
    #[must_use]
    pub fn object_location(&self, object: ObjectId) -> ObjectLocation {
        self.protocol.object_location(object)
    }

    /// Creates a region claiming every cell inside `bounds`, with a
    /// freshly spawned worker thread.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BoundsOverlap`] if any cell is already
    /// claimed, or [`CoreError::ThreadSpawn`] if the worker cannot
    /// start.
    pub fn create_region(&self, bounds: CellBounds) -> CoreResult<RegionId> {
        self.ensure_running()?;
        let bl = self.barrier_lock.lock();
        for cell in bounds.cells() {
            if let Owner::Region(existing) = self.directory.resolve(cell) {
                return Err(CoreError::BoundsOverlap { cell, existing });
            }
        }

        let id = RegionId::new(self.region_ids.allocate());
        let cells: HashSet<CellPos> = bounds.cells().collect();
        let handle = self.spawn_worker(id, cells.clone())?;

        let ops: Vec<DirectoryOp> = cells.iter().map(|&c| DirectoryOp::Assign(c, id)).collect();
        self.directory.apply(&ops);

        handle.control.wait_barriered();
        handle.control.release_barrier();
        self.regions.lock().insert(id, handle);
        drop(bl);

        self.protocol.flush_parked();
        info!(region = %id, %bounds, cells = cells.len(), "region created");
        Ok(id)
    }

    /// Extends a region by one currently unowned cell.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BoundsOverlap`] if the cell is claimed, or
    /// [`CoreError::UnknownRegion`] if the region is not live.
    pub fn claim_cell(&self, cell: CellPos, region: RegionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.check_not_owned_thread(&[region])?;
        let bl = self.barrier_lock.lock();
        if let Owner::Region(existing) = self.directory.resolve(cell) {
            return Err(CoreError::BoundsOverlap { cell, existing });
        }
        let parked = self.park(&[region])?;
        parked.regions[0].world.lock().cells.insert(cell);
        self.directory.apply(&[DirectoryOp::Assign(cell, region)]);
        drop(parked);
        drop(bl);
        self.protocol.flush_parked();
        Ok(())
    }

    /// Merges region `b` into region `a`, which absorbs its cells,
    /// objects and queued work. Returns `a`. Every moved object gets
    /// the next token generation; queued work keeps its remaining
    /// delay relative to `a`'s clock.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MergeNotAdjacent`] if the two cell sets
    /// share no edge (or `a == b`), or [`CoreError::UnknownRegion`] if
    /// either is not live.
    pub fn merge_regions(&self, a: RegionId, b: RegionId) -> CoreResult<RegionId> {
        self.ensure_running()?;
        if a == b {
            return Err(CoreError::MergeNotAdjacent { a, b });
        }
        self.check_not_owned_thread(&[a, b])?;
        let bl = self.barrier_lock.lock();
        let parked = self.park(&[a, b])?;
        let pa = parked
            .regions
            .iter()
            .find(|r| r.id == a)
            .ok_or(CoreError::UnknownRegion(a))?;
        let pb = parked
            .regions
            .iter()
            .find(|r| r.id == b)
            .ok_or(CoreError::UnknownRegion(b))?;

        let mut wa = pa.world.lock();
        let mut wb = pb.world.lock();

        let touching = wa
            .cells
            .iter()
            .any(|&ca| wb.cells.iter().any(|&cb| ca.is_adjacent(cb)));
        if !touching {
            return Err(CoreError::MergeNotAdjacent { a, b });
        }

        let b_cells: Vec<CellPos> = wb.cells.drain().collect();
        let a_tick = wa.tick;
        let b_tick = wb.tick;

        let moving: Vec<ObjectId> = wb.objects.keys().copied().collect();
        for id in moving {
            if let Some(mut owned) = wb.objects.remove(&id) {
                let token = owned.token.succeed(a);
                owned.rebind(token);
                self.protocol.index_set(id, a);
                wa.objects.insert(id, owned);
            }
        }

        // Queued work keeps its remaining delay, re-based onto a's
        // clock; the two regions' counters are unrelated.
        for (due, item) in wb.queue.drain_with_due() {
            wa.queue.push(item, a_tick + due.saturating_sub(b_tick));
        }
        wa.cells.extend(b_cells.iter().copied());

        self.protocol.retarget(b, a);
        let ops: Vec<DirectoryOp> = b_cells.iter().map(|&c| DirectoryOp::Assign(c, a)).collect();
        self.directory.apply(&ops);
        // The alias must exist before a resumes, or work addressed to
        // b in a's queue would bounce off the dead endpoint.
        self.protocol.record_alias(b, a);
        // Unregistering takes the endpoint write lock, which fences out
        // every sender that resolved b before the directory swap. Only
        // after it returns is b's inbox quiescent; draining any earlier
        // would strand tasks that land in the channel behind the drain.
        self.protocol.unregister_region(b);
        while let Ok(msg) = wb.inbox.try_recv() {
            match msg {
                Inbound::Task(task) => {
                    let due = task.earliest_tick.map_or(a_tick, |t| t.max(a_tick));
                    wa.queue.push(QueueItem::Task(task), due);
                }
                Inbound::Receive(recv) => wa.queue.push(QueueItem::Receive(recv), a_tick),
            }
        }
        pb.control.request_shutdown();

        drop(wa);
        drop(wb);
        drop(parked);

        self.retire_worker(b, "merge");
        drop(bl);
        self.protocol.flush_parked();
        info!(absorbed = %b, into = %a, "regions merged");
        Ok(a)
    }

    /// Splits off the cells of `region` inside `bounds` into a new
    /// region with its own worker, moving the objects and queued work
    /// standing on them. Returns the new region's id.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidSplit`] if the bounds select none
    /// or all of the region's cells.
    pub fn split_region(&self, region: RegionId, bounds: CellBounds) -> CoreResult<RegionId> {
        self.split_with(region, move |cell| bounds.contains(cell))
    }

    fn split_with(
        &self,
        region: RegionId,
        select: impl Fn(CellPos) -> bool,
    ) -> CoreResult<RegionId> {
        self.ensure_running()?;
        self.check_not_owned_thread(&[region])?;
        let bl = self.barrier_lock.lock();
        let parked = self.park(&[region])?;
        let source = &parked.regions[0];
        let mut old = source.world.lock();

        let selected: HashSet<CellPos> = old.cells.iter().copied().filter(|&c| select(c)).collect();
        if selected.is_empty() || selected.len() == old.cells.len() {
            return Err(CoreError::InvalidSplit {
                region,
                selected: selected.len(),
                total: old.cells.len(),
            });
        }

        let new_id = RegionId::new(self.region_ids.allocate());
        let handle = self.spawn_worker(new_id, selected.clone())?;
        {
            let mut new_world = handle.world.lock();

            let moving: Vec<ObjectId> = old
                .objects
                .iter()
                .filter(|(_, o)| selected.contains(&o.state.cell()))
                .map(|(&id, _)| id)
                .collect();
            for id in moving {
                if let Some(mut owned) = old.objects.remove(&id) {
                    let token = owned.token.succeed(new_id);
                    owned.rebind(token);
                    self.protocol.index_set(id, new_id);
                    new_world.objects.insert(id, owned);
                }
            }

            let old_tick = old.tick;
            for (due, item) in old.queue.drain_with_due() {
                let to_new = match &item {
                    QueueItem::Task(t) => {
                        matches!(t.target, TaskTarget::Cell(c) if selected.contains(&c))
                    }
                    QueueItem::Receive(r) => selected.contains(&r.state.cell()),
                };
                if to_new {
                    // The new region's clock starts at zero; keep the
                    // remaining delay.
                    new_world.queue.push(item, due.saturating_sub(old_tick));
                } else {
                    old.queue.push(item, due);
                }
            }

            old.cells.retain(|c| !selected.contains(c));
        }

        let ops: Vec<DirectoryOp> = selected
            .iter()
            .map(|&c| DirectoryOp::Assign(c, new_id))
            .collect();
        self.directory.apply(&ops);

        handle.control.wait_barriered();
        handle.control.release_barrier();
        self.regions.lock().insert(new_id, handle);

        drop(old);
        drop(parked);
        drop(bl);
        self.protocol.flush_parked();
        info!(from = %region, to = %new_id, cells = selected.len(), "region split");
        Ok(new_id)
    }

    /// Destroys an empty region: unclaims its cells, re-routes its
    /// queued work and retires its worker thread. Tasks addressed to
    /// the destroyed region by id are dead-lettered with a report;
    /// cell-addressed work parks until the cells are claimed again.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::RegionNotEmpty`] if the region still owns
    /// objects; despawn or migrate them first.
    pub fn destroy_region(&self, region: RegionId) -> CoreResult<()> {
        self.ensure_running()?;
        self.check_not_owned_thread(&[region])?;
        let bl = self.barrier_lock.lock();
        let parked = self.park(&[region])?;
        let target = &parked.regions[0];
        let mut world = target.world.lock();

        if !world.objects.is_empty() {
            return Err(CoreError::RegionNotEmpty {
                region,
                objects: world.objects.len(),
            });
        }

        let ops: Vec<DirectoryOp> = world.cells.drain().map(DirectoryOp::Remove).collect();
        self.directory.apply(&ops);
        // Unregister before re-routing so region-addressed tasks are
        // reported as undeliverable instead of looping back here.
        self.protocol.unregister_region(region);

        for (_, item) in world.queue.drain_with_due() {
            match item {
                QueueItem::Task(task) => self.protocol.route_task(task),
                QueueItem::Receive(recv) => self.protocol.redirect_receive(recv, region),
            }
        }
        while let Ok(msg) = world.inbox.try_recv() {
            match msg {
                Inbound::Task(task) => self.protocol.route_task(task),
                Inbound::Receive(recv) => self.protocol.redirect_receive(recv, region),
            }
        }

        target.control.request_shutdown();
        drop(world);
        drop(parked);
        self.retire_worker(region, "destroy");
        drop(bl);
        info!(%region, cells = ops.len(), "region destroyed");
        Ok(())
    }

    /// Spawns an object on a cell, owned by whichever region claims
    /// it. The object starts at generation 1 and ticks from the owning
    /// region's next tick.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnownedCell`] if no region claims the
    /// cell.
    pub fn spawn_object(&self, cell: CellPos, logic: Box<dyn ObjectLogic>) -> CoreResult<ObjectId> {
        self.ensure_running()?;
        let mut logic = Some(logic);
        for _ in 0..TOPOLOGY_RETRIES {
            let owner = match self.directory.resolve(cell) {
                Owner::Region(region) => region,
                Owner::Unowned => return Err(CoreError::UnownedCell(cell)),
            };
            self.check_not_owned_thread(&[owner])?;

            let bl = self.barrier_lock.lock();
            let Ok(parked) = self.park(&[owner]) else {
                // The owner retired between resolve and park.
                drop(bl);
                continue;
            };
            let mut world = parked.regions[0].world.lock();
            if world.cells.contains(&cell) {
                if let Some(logic) = logic.take() {
                    let id = ObjectId::new(self.object_ids.allocate());
                    let token = OwnershipToken::initial(owner);
                    let state = ObjectState::new(id, cell, token);
                    world.objects.insert(id, OwnedObject::new(state, logic));
                    self.protocol.index_set(id, owner);
                    debug!(object = %id, region = %owner, %cell, "object spawned");
                    return Ok(id);
                }
            }
            // Stale resolve raced a topology change; retry.
            drop(world);
            drop(parked);
            drop(bl);
        }
        Err(CoreError::UnownedCell(cell))
    }

    /// Removes an object from the world.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectPendingMigration`] while the object
    /// is in flight, or [`CoreError::UnknownObject`] if it does not
    /// exist.
    pub fn despawn_object(&self, object: ObjectId) -> CoreResult<()> {
        self.ensure_running()?;
        for _ in 0..TOPOLOGY_RETRIES {
            let region = match self.protocol.object_location(object) {
                ObjectLocation::PendingMigration { from, to } => {
                    return Err(CoreError::ObjectPendingMigration { object, from, to });
                }
                ObjectLocation::Parked { .. } => {
                    // Nobody owns it; removal needs no barrier.
                    if self.protocol.remove_parked(object) {
                        debug!(%object, "parked object despawned");
                        return Ok(());
                    }
                    continue;
                }
                ObjectLocation::Unknown => return Err(CoreError::UnknownObject(object)),
                ObjectLocation::Owned(region) => region,
            };
            self.check_not_owned_thread(&[region])?;

            let bl = self.barrier_lock.lock();
            let Ok(parked) = self.park(&[region]) else {
                drop(bl);
                continue;
            };
            let mut world = parked.regions[0].world.lock();
            if world.objects.remove(&object).is_some() {
                self.protocol.index_remove(object);
                debug!(%object, %region, "object despawned");
                return Ok(());
            }
            // Migrated away between the location read and the park.
            drop(world);
            drop(parked);
            drop(bl);
        }
        Err(CoreError::UnknownObject(object))
    }

    /// Submits a task for execution against its target. The payload
    /// runs exactly once, on the worker thread owning the target when
    /// the task comes due; `earliest_tick` defers it in the target's
    /// tick domain.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::TaskUndeliverable`] when a region target
    /// (after following merge aliases) is not live.
    pub fn submit_task(
        &self,
        target: TaskTarget,
        earliest_tick: Option<u64>,
        payload: TaskPayload,
    ) -> CoreResult<TaskHandle> {
        self.ensure_running()?;
        let id = TaskId::new(self.task_ids.allocate());
        if let TaskTarget::Region(region) = target {
            let canonical = self.protocol.canonical_region(region);
            if !self.regions.lock().contains_key(&canonical) {
                return Err(CoreError::TaskUndeliverable {
                    task: id,
                    reason: format!("{canonical} is not live"),
                });
            }
        }
        self.protocol
            .route_task(Task::new(id, target, earliest_tick, payload));
        Ok(TaskHandle { id })
    }

    /// Marks a task cancelled. Best-effort: a payload that already
    /// started executing cannot be recalled.
    pub fn cancel_task(&self, handle: TaskHandle) {
        self.protocol.cancel(handle.id);
    }

    /// Runs `f` once against every live region under a world-wide
    /// barrier: all regions are frozen together and the closures see
    /// a mutually consistent world.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BarrierFromOwnedThread`] when called from
    /// a region worker thread, or [`CoreError::ShuttingDown`] after
    /// shutdown begins.
    pub fn broadcast(&self, mut f: impl FnMut(&mut TaskContext<'_>)) -> CoreResult<()> {
        let ids = self.live_regions();
        self.request_barrier(&ids, |scope| {
            for (id, world) in &mut scope.worlds {
                let mut cx = TaskContext {
                    region: Some(*id),
                    tick: world.tick,
                    world: Some(&mut **world),
                };
                f(&mut cx);
            }
        })
    }

    /// Parks the named regions and runs `f` with exclusive access to
    /// all of them at once. No region in the set ticks while `f` runs;
    /// regions outside the set are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BarrierFromOwnedThread`] when called from
    /// one of the named regions' own workers, or
    /// [`CoreError::UnknownRegion`] for a dead id.
    pub fn request_barrier<R>(
        &self,
        regions: &[RegionId],
        f: impl FnOnce(&mut BarrierScope<'_>) -> R,
    ) -> CoreResult<R> {
        self.ensure_running()?;
        self.check_not_owned_thread(regions)?;
        let bl = self.barrier_lock.lock();
        let parked = self.park(regions)?;
        let mut guards: Vec<(RegionId, parking_lot::MutexGuard<'_, RegionWorld>)> = parked
            .regions
            .iter()
            .map(|r| (r.id, r.world.lock()))
            .collect();
        let mut scope = BarrierScope {
            worlds: guards
                .iter_mut()
                .map(|(id, guard)| (*id, &mut **guard))
                .collect(),
        };
        let out = f(&mut scope);
        drop(scope);
        drop(guards);
        drop(parked);
        drop(bl);
        Ok(out)
    }

    /// Captures a globally consistent snapshot of every region under a
    /// world-wide barrier.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::BarrierFromOwnedThread`] when called from
    /// a worker thread.
    pub fn snapshot(&self) -> CoreResult<WorldSnapshot> {
        let ids = self.live_regions();
        self.request_barrier(&ids, |scope| {
            let regions = scope
                .worlds
                .iter()
                .map(|(id, world)| {
                    let mut cells: Vec<CellPos> = world.cells.iter().copied().collect();
                    cells.sort_unstable();
                    let mut objects: Vec<ObjectSnapshot> = world
                        .objects
                        .values()
                        .map(|o| ObjectSnapshot {
                            id: o.state.id(),
                            cell: o.state.cell(),
                            generation: o.token.generation(),
                            quarantined: o.quarantined,
                        })
                        .collect();
                    objects.sort_by_key(|o| o.id);
                    RegionSnapshot {
                        id: *id,
                        tick: world.tick,
                        cells,
                        objects,
                    }
                })
                .collect();
            WorldSnapshot { regions }
        })
    }

    /// Runs `f` against an owned object's state. Callable only from
    /// the owning worker thread, which means from inside a task
    /// payload executing on that region.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ObjectPendingMigration`] while the object
    /// is in flight, [`CoreError::ObjectParked`] while it waits on an
    /// unowned cell, [`CoreError::AffinityViolation`] (logging guard
    /// policy) from a foreign thread, or [`CoreError::ReentrantAccess`]
    /// from inside an object advancement or a nested object closure,
    /// where a second borrow of the object table cannot be handed out.
    pub fn with_owned_object<R>(
        &self,
        object: ObjectId,
        f: impl FnOnce(&mut ObjectState) -> R,
    ) -> CoreResult<R> {
        self.ensure_running()?;
        match self.protocol.object_location(object) {
            ObjectLocation::PendingMigration { from, to } => {
                Err(CoreError::ObjectPendingMigration { object, from, to })
            }
            ObjectLocation::Parked { from } => Err(CoreError::ObjectParked { object, from }),
            ObjectLocation::Unknown => Err(CoreError::UnknownObject(object)),
            ObjectLocation::Owned(region) => {
                self.guard.assert_owning_thread(region)?;
                // The guard passed, so this is the owning worker and
                // its tick published the world slot before running the
                // payload that called us.
                crate::scheduler::with_active_world(|world| {
                    let owned = world
                        .objects
                        .get_mut(&object)
                        .ok_or(CoreError::UnknownObject(object))?;
                    owned.verify_token_agreement();
                    Ok(f(&mut owned.state))
                })
                .unwrap_or(Err(CoreError::ReentrantAccess { region }))
            }
        }
    }

    /// Observability counters for one region. Does not barrier; the
    /// numbers are a consistent view of a single instant between
    /// ticks.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownRegion`] for a dead id.
    pub fn region_stats(&self, region: RegionId) -> CoreResult<RegionStatsSnapshot> {
        let (world, control) = self
            .region_arcs(region)
            .ok_or(CoreError::UnknownRegion(region))?;
        let timing = *control.stats.lock();
        let world = world.lock();
        Ok(RegionStatsSnapshot {
            region,
            ticks: control.tick_count(),
            objects: world.objects.len(),
            quarantined: world.quarantined_count(),
            queued: world.queue.len(),
            timing,
        })
    }

    /// Stops the supervisor and every region worker, joining their
    /// threads. Idempotent; also invoked on drop.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("coordinator shutting down");

        if let Some(join) = self.supervisor.lock().take() {
            if join.thread().id() != thread::current().id() && join.join().is_err() {
                error!("supervisor thread panicked during shutdown");
            }
        }

        let handles: Vec<RegionHandle> = {
            let mut map = self.regions.lock();
            std::mem::take(&mut *map).into_values().collect()
        };
        for handle in &handles {
            handle.control.request_shutdown();
        }
        for mut handle in handles {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    error!(region = %handle.id, "worker thread panicked during shutdown");
                }
            }
            self.guard.unregister(handle.id);
            self.protocol.unregister_region(handle.id);
        }
    }

    fn ensure_running(&self) -> CoreResult<()> {
        if self.shutdown.load(Ordering::SeqCst) {
            Err(CoreError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    fn check_not_owned_thread(&self, ids: &[RegionId]) -> CoreResult<()> {
        let current = thread::current().id();
        for &id in ids {
            if self.guard.owner_of(id) == Some(current) {
                return Err(CoreError::BarrierFromOwnedThread { region: id });
            }
        }
        Ok(())
    }

    fn region_arcs(
        &self,
        region: RegionId,
    ) -> Option<(Arc<Mutex<RegionWorld>>, Arc<RegionControl>)> {
        self.regions
            .lock()
            .get(&region)
            .map(|h| (Arc::clone(&h.world), Arc::clone(&h.control)))
    }

    /// Parks regions in ascending id order. Caller holds the barrier
    /// lock.
    fn park(&self, ids: &[RegionId]) -> CoreResult<ParkedSet> {
        let mut sorted = ids.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut regions = Vec::with_capacity(sorted.len());
        {
            let map = self.regions.lock();
            for &id in &sorted {
                let handle = map.get(&id).ok_or(CoreError::UnknownRegion(id))?;
                regions.push(ParkedRegion {
                    id,
                    world: Arc::clone(&handle.world),
                    control: Arc::clone(&handle.control),
                });
            }
        }
        for region in &regions {
            region.control.request_barrier();
        }
        for region in &regions {
            region.control.wait_barriered();
        }
        Ok(ParkedSet { regions })
    }

    /// Spawns a region worker, parked until its initial barrier is
    /// released. Registers the guard and the migration endpoint.
    fn spawn_worker(&self, id: RegionId, cells: HashSet<CellPos>) -> CoreResult<RegionHandle> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let control = Arc::new(RegionControl::new(true));
        let world = Arc::new(Mutex::new(RegionWorld::new(id, cells, receiver)));

        let ctx = RegionThreadCtx {
            world: Arc::clone(&world),
            control: Arc::clone(&control),
            shared: Arc::clone(&self.shared),
        };
        let join = thread::Builder::new()
            .name(format!("veldt-region-{}", id.get()))
            .spawn(move || run_region(ctx))
            .map_err(|e| CoreError::ThreadSpawn(e.to_string()))?;

        self.guard.register(id, join.thread().id());
        self.protocol
            .register_region(id, sender, Arc::clone(&control));

        Ok(RegionHandle {
            id,
            world,
            control,
            join: Some(join),
        })
    }

    /// Joins and deregisters a worker whose shutdown was already
    /// requested and barrier released.
    fn retire_worker(&self, region: RegionId, during: &str) {
        if let Some(mut handle) = self.regions.lock().remove(&region) {
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    error!(%region, during, "worker thread panicked while retiring");
                }
            }
        }
        self.guard.unregister(region);
    }

    /// One supervisor pass: run global-scope tasks, retry parked work,
    /// and periodically rebalance region load.
    fn supervise_once(&self) {
        let tick = self.global_tick.fetch_add(1, Ordering::Relaxed) + 1;
        for task in self.protocol.take_global() {
            if self.protocol.consume_cancelled(task.id) {
                continue;
            }
            let mut cx = TaskContext {
                region: None,
                tick,
                world: None,
            };
            (task.payload)(&mut cx);
        }
        self.protocol.flush_parked();
        self.protocol.alert_parked(tick);
        if tick % REBALANCE_INTERVAL == 0 {
            self.rebalance();
        }
    }

    /// Applies at most one automatic split or merge per pass, driven
    /// by the configured object-count thresholds.
    fn rebalance(&self) {
        let split_at = self.config.split_threshold_objects;
        let merge_at = self.config.merge_threshold_objects;
        if split_at == 0 && merge_at == 0 {
            return;
        }

        struct Load {
            id: RegionId,
            objects: usize,
            cells: Vec<CellPos>,
        }
        let loads: Vec<Load> = {
            let map = self.regions.lock();
            map.values()
                .map(|h| {
                    let world = h.world.lock();
                    Load {
                        id: h.id,
                        objects: world.objects.len(),
                        cells: world.cells.iter().copied().collect(),
                    }
                })
                .collect()
        };

        if split_at != 0 {
            if let Some(load) = loads
                .iter()
                .find(|l| l.objects >= split_at && l.cells.len() >= 2)
            {
                let mut cells = load.cells.clone();
                cells.sort_unstable();
                let half: HashSet<CellPos> = cells[..cells.len() / 2].iter().copied().collect();
                match self.split_with(load.id, move |c| half.contains(&c)) {
                    Ok(new_id) => {
                        info!(from = %load.id, to = %new_id, objects = load.objects, "auto-split overloaded region");
                    }
                    Err(err) => debug!(region = %load.id, error = %err, "auto-split skipped"),
                }
                return;
            }
        }

        if merge_at != 0 {
            for (i, a) in loads.iter().enumerate() {
                for b in &loads[i + 1..] {
                    let touching = a
                        .cells
                        .iter()
                        .any(|&ca| b.cells.iter().any(|&cb| ca.is_adjacent(cb)));
                    if touching && a.objects + b.objects < merge_at {
                        match self.merge_regions(a.id, b.id) {
                            Ok(_) => info!(
                                a = %a.id, b = %b.id,
                                objects = a.objects + b.objects,
                                "auto-merged underloaded regions"
                            ),
                            Err(err) => {
                                debug!(a = %a.id, b = %b.id, error = %err, "auto-merge skipped");
                            }
                        }
                        return;
                    }
                }
            }
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_global(weak: &Weak<Coordinator>) {
    let Some(interval) = weak.upgrade().map(|c| c.config.tick_duration()) else {
        return;
    };
    loop {
        thread::sleep(interval);
        let Some(coordinator) = weak.upgrade() else {
            return;
        };
        if coordinator.shutdown.load(Ordering::SeqCst) {
            return;
        }
        coordinator.supervise_once();
    }
}
