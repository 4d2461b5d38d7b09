//! # Per-Region Tick Scheduler
//!
//! Each region's worker thread runs the loop in this module at the
//! configured cadence. A tick has a fixed phase order:
//!
//! ```text
//!   drain inbox -> run due tasks -> advance objects -> flush migrations
//! ```
//!
//! Between ticks the worker sleeps on its control condvar, so a
//! barrier request or shutdown wakes it immediately instead of waiting
//! out the cadence. When the loop falls behind budget it ticks again
//! without sleeping but never runs more than one catch-up tick per
//! missed deadline; the overrun is recorded in [`TickStats`] instead.
//!
//! ## Safety Note
//!
//! This module requires unsafe code for the active-world slot: a
//! thread-local pointer the worker publishes while a task payload
//! runs, so object entry points called on the owning thread can reach
//! the world without re-locking it.

#![allow(unsafe_code)]

use std::cell::Cell;
use std::ptr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, warn};

use veldt_core::{CoreConfig, ThreadAffinityGuard};

use crate::directory::Owner;
use crate::migrate::MigrationProtocol;
use crate::queue::QueueItem;
use crate::region::{Inbound, OwnedObject, ReceiveObject, RegionControl, RegionWorld, RunState};
use crate::task::{TaskContext, TaskTarget};

/// Timing statistics for one region's tick loop.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    total: u64,
    late: u64,
    min: Option<Duration>,
    max: Duration,
    sum: Duration,
}

impl TickStats {
    pub(crate) fn record(&mut self, elapsed: Duration, budget: Duration) {
        self.total += 1;
        if elapsed > budget {
            self.late += 1;
        }
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = self.max.max(elapsed);
        self.sum += elapsed;
    }

    /// Ticks recorded so far.
    #[must_use]
    pub const fn total_ticks(&self) -> u64 {
        self.total
    }

    /// Ticks that ran over their cadence budget.
    #[must_use]
    pub const fn late_ticks(&self) -> u64 {
        self.late
    }

    /// Shortest recorded tick, if any tick has run.
    #[must_use]
    pub const fn min_tick(&self) -> Option<Duration> {
        self.min
    }

    /// Longest recorded tick.
    #[must_use]
    pub const fn max_tick(&self) -> Duration {
        self.max
    }

    /// Mean tick duration over all recorded ticks.
    #[must_use]
    pub fn avg_tick(&self) -> Duration {
        if self.total == 0 {
            Duration::ZERO
        } else {
            self.sum / u32::try_from(self.total).unwrap_or(u32::MAX)
        }
    }
}

thread_local! {
    /// The world a payload is currently executing against, published
    /// by [`run_due_tasks`] for the duration of each payload call.
    static ACTIVE_WORLD: Cell<*mut RegionWorld> = const { Cell::new(ptr::null_mut()) };
}

/// Clears the slot even when a payload unwinds.
struct SlotReset;

impl Drop for SlotReset {
    fn drop(&mut self) {
        ACTIVE_WORLD.with(|slot| slot.set(ptr::null_mut()));
    }
}

/// Runs `f` against the world this thread is mid-payload on, if any.
/// The slot is emptied for the duration of `f`, so a nested call
/// observes no active world instead of aliasing the outer borrow.
pub(crate) fn with_active_world<R>(f: impl FnOnce(&mut RegionWorld) -> R) -> Option<R> {
    ACTIVE_WORLD.with(|slot| {
        let raw = slot.replace(ptr::null_mut());
        if raw.is_null() {
            return None;
        }
        // SAFETY: the pointer was published on this same thread by
        // `run_due_tasks`, derived from the world lock its worker
        // holds, and the worker does not touch the world again until
        // the payload returns. Taking it out of the slot makes this
        // the only live path to the world until it is put back.
        let world = unsafe { &mut *raw };
        let out = f(world);
        slot.set(raw);
        Some(out)
    })
}

/// State shared by every worker thread and the coordinator.
pub(crate) struct Shared {
    pub(crate) config: CoreConfig,
    pub(crate) guard: Arc<ThreadAffinityGuard>,
    pub(crate) protocol: Arc<MigrationProtocol>,
}

/// Everything a worker thread owns for the duration of its region.
pub(crate) struct RegionThreadCtx {
    pub(crate) world: Arc<parking_lot::Mutex<RegionWorld>>,
    pub(crate) control: Arc<RegionControl>,
    pub(crate) shared: Arc<Shared>,
}

/// The worker thread entry point. Returns when shutdown is requested.
pub(crate) fn run_region(ctx: RegionThreadCtx) {
    let budget = ctx.shared.config.tick_duration();
    let mut next_tick = Instant::now() + budget;

    loop {
        // Control section: park for barriers, exit on shutdown, sleep
        // out the remainder of the cadence. All three share the one
        // condvar so external requests take effect immediately.
        {
            let mut s = ctx.control.state.lock();
            loop {
                if s.shutdown {
                    s.run = RunState::Idle;
                    ctx.control.cond.notify_all();
                    return;
                }
                if s.barrier_requested {
                    s.run = RunState::Barriered;
                    ctx.control.cond.notify_all();
                    ctx.control.cond.wait(&mut s);
                    continue;
                }
                s.run = RunState::Idle;
                let now = Instant::now();
                if now >= next_tick {
                    s.run = RunState::Ticking;
                    break;
                }
                ctx.control.cond.wait_until(&mut s, next_tick);
            }
        }

        let started = Instant::now();
        {
            let mut world = ctx.world.lock();
            world.tick += 1;
            drain_inbox(&mut world);
            run_due_tasks(&mut world, &ctx.shared);
            advance_objects(&mut world, &ctx.shared);
            flush_migrations(&mut world, &ctx.shared);
            ctx.shared.protocol.alert_stuck(world.id, world.tick);
            ctx.control.ticks.store(world.tick, Ordering::Release);
        }
        ctx.control.stats.lock().record(started.elapsed(), budget);

        next_tick += budget;
        let now = Instant::now();
        if next_tick < now {
            // Hopelessly behind; rebase instead of spiraling through
            // back-to-back catch-up ticks.
            next_tick = now + budget;
        }
    }
}

/// Moves everything from the cross-thread inbox into the local queue.
/// Tasks keep their earliest-execution tick when it is still in the
/// future; handoffs are due immediately.
pub(crate) fn drain_inbox(world: &mut RegionWorld) {
    let tick = world.tick;
    while let Ok(msg) = world.inbox.try_recv() {
        match msg {
            Inbound::Task(task) => {
                let due = task.earliest_tick.map_or(tick, |t| t.max(tick));
                world.queue.push(QueueItem::Task(task), due);
            }
            Inbound::Receive(recv) => world.queue.push(QueueItem::Receive(recv), tick),
        }
    }
}

/// Executes every queued item due at or before the current tick, in
/// stable (due, arrival) order. Targets are re-resolved at execution
/// time: an item queued before a topology change is forwarded to the
/// current owner instead of executing here.
pub(crate) fn run_due_tasks(world: &mut RegionWorld, shared: &Shared) {
    let tick = world.tick;
    while let Some(item) = world.queue.pop_due(tick) {
        match item {
            QueueItem::Task(task) => {
                if shared.protocol.consume_cancelled(task.id) {
                    continue;
                }
                let executes_here = match task.target {
                    TaskTarget::Cell(cell) => {
                        shared.protocol.directory().resolve(cell) == Owner::Region(world.id)
                    }
                    TaskTarget::Region(region) => {
                        shared.protocol.canonical_region(region) == world.id
                    }
                    TaskTarget::Global => false,
                };
                if executes_here {
                    let mut cx = TaskContext {
                        region: Some(world.id),
                        tick,
                        world: None,
                    };
                    // The payload reaches the world only through the
                    // slot; no other reference is live while it runs.
                    ACTIVE_WORLD.with(|slot| slot.set(&mut *world));
                    let reset = SlotReset;
                    (task.payload)(&mut cx);
                    drop(reset);
                } else {
                    shared.protocol.route_task(task);
                }
            }
            QueueItem::Receive(recv) => install_received(world, shared, recv),
        }
    }
}

/// Completes an object handoff. The cell is re-resolved first: if a
/// topology change redirected it mid-flight, the object is forwarded
/// rather than installed in the wrong region.
fn install_received(world: &mut RegionWorld, shared: &Shared, mut recv: ReceiveObject) {
    match shared.protocol.directory().resolve(recv.state.cell()) {
        Owner::Region(dest) if dest == world.id => {
            let mut token = recv.state.token();
            if token.region() != world.id {
                // Redirected while in flight; mint the next generation
                // for the region actually installing it.
                token = token.succeed(world.id);
                recv.state.set_token(token);
            }
            shared
                .protocol
                .complete_migration(recv.state.id(), world.id, token);
            let owned = OwnedObject::new(recv.state, recv.logic);
            world.objects.insert(owned.state.id(), owned);
        }
        _ => shared.protocol.redirect_receive(recv, world.id),
    }
}

/// Advances every non-quarantined object by one tick. A failing object
/// is skipped and counted; crossing the configured failure threshold
/// quarantines it without disturbing its neighbors.
pub(crate) fn advance_objects(world: &mut RegionWorld, shared: &Shared) {
    if shared.guard.assert_owning_thread(world.id).is_err() {
        // Log policy: the violation was reported by the guard; do not
        // advance anything from the wrong thread.
        return;
    }
    let tick = world.tick;
    let region = world.id;
    let threshold = shared.config.quarantine_threshold;

    for owned in world.objects.values_mut() {
        if owned.quarantined {
            continue;
        }
        owned.verify_token_agreement();
        match owned.logic.advance(&mut owned.state, tick) {
            Ok(()) => owned.failures = 0,
            Err(err) => {
                owned.failures += 1;
                error!(
                    object = %owned.state.id(),
                    %region,
                    tick,
                    failures = owned.failures,
                    error = %err,
                    "object advancement failed"
                );
                if owned.failures >= threshold {
                    owned.quarantined = true;
                    warn!(
                        object = %owned.state.id(),
                        %region,
                        "object quarantined after repeated failures"
                    );
                }
            }
        }
    }
}

/// Hands off every object whose cell now resolves to a different
/// region. Objects standing on unowned cells stay put: ownership is
/// released only by explicit topology operations, never implicitly by
/// movement.
pub(crate) fn flush_migrations(world: &mut RegionWorld, shared: &Shared) {
    let mut departing = Vec::new();
    for (&id, owned) in &world.objects {
        if let Owner::Region(dest) = shared.protocol.directory().resolve(owned.state.cell()) {
            if dest != world.id {
                departing.push(id);
            }
        }
    }
    for id in departing {
        if let Some(owned) = world.objects.remove(&id) {
            shared.protocol.send_object_from(owned, world.id);
        }
    }
}
