//! # Migration Protocol
//!
//! Cross-region movement of objects and tasks. The protocol owns the
//! routing state that no single region may own: the per-region send
//! endpoints, the object location index, the in-flight handoff ledger,
//! and the parking area for work whose destination does not exist yet.
//!
//! A handoff never blocks the sender: the source region drops the
//! object from its table, records the transfer in the ledger and sends
//! it down the destination's channel. The destination installs it on
//! its next tick and retires the ledger entry. Observers asking about
//! the object in between get an explicit pending answer instead of a
//! stale owner.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use crossbeam_channel::Sender;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use veldt_core::{CoreConfig, ObjectId, OwnershipToken, RegionId, TaskId};

use crate::directory::{Owner, RegionDirectory};
use crate::region::{Inbound, OwnedObject, ReceiveObject, RegionControl};
use crate::task::{Task, TaskTarget};

/// Where an object currently is, from an external observer's view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ObjectLocation {
    /// Installed in this region's object table.
    Owned(RegionId),
    /// In flight between two regions; neither will mutate it until
    /// the destination installs it.
    PendingMigration {
        /// The region that released the object.
        from: RegionId,
        /// The region that will install it.
        to: RegionId,
    },
    /// Released onto a cell no region claims; held by the runtime
    /// until the cell is claimed again, then re-routed.
    Parked {
        /// The region that last held the object.
        from: RegionId,
    },
    /// Not known to the runtime (never spawned, or despawned).
    Unknown,
}

/// Send side of one region's inbox plus its control block, kept so the
/// protocol can stamp ledger entries with the destination's tick.
struct Endpoint {
    sender: Sender<Inbound>,
    control: Arc<RegionControl>,
}

/// An object held off-partition: its cell stopped resolving to any
/// region mid-handoff.
struct ParkedObject {
    recv: ReceiveObject,
    from: RegionId,
    /// Supervisor tick at which the park was first observed.
    seen_tick: Option<u64>,
    alerted: bool,
}

/// One in-flight handoff.
struct PendingEntry {
    from: RegionId,
    to: RegionId,
    /// Destination tick counter at send time, for stuck-delivery
    /// detection.
    sent_dest_tick: u64,
    /// Generation minted for the handoff; delivery below it is stale.
    generation: u64,
    alerted: bool,
}

/// The process-wide migration state. One instance per coordinator,
/// shared with every worker thread.
pub(crate) struct MigrationProtocol {
    directory: Arc<RegionDirectory>,
    config: CoreConfig,
    endpoints: RwLock<HashMap<RegionId, Endpoint>>,
    /// Retired region id -> successor, from merges. Chains are short
    /// (one link per merge) and never cyclic.
    aliases: RwLock<HashMap<RegionId, RegionId>>,
    /// Installed location of every live object.
    object_index: Mutex<HashMap<ObjectId, RegionId>>,
    /// In-flight handoffs.
    ledger: Mutex<HashMap<ObjectId, PendingEntry>>,
    /// Tasks whose destination cell is currently unowned.
    parked_tasks: Mutex<VecDeque<Task>>,
    /// Objects whose destination cell is currently unowned.
    parked_objects: Mutex<HashMap<ObjectId, ParkedObject>>,
    /// Cancelled task ids, consumed at execution time.
    cancelled: Mutex<HashSet<TaskId>>,
    /// Tasks for the global scope, drained by the supervisor.
    global: Mutex<VecDeque<Task>>,
    /// Tasks that could not be delivered anywhere, with the reason.
    dead_letters: Mutex<Vec<(TaskId, String)>>,
}

impl MigrationProtocol {
    pub(crate) fn new(directory: Arc<RegionDirectory>, config: CoreConfig) -> Self {
        Self {
            directory,
            config,
            endpoints: RwLock::new(HashMap::new()),
            aliases: RwLock::new(HashMap::new()),
            object_index: Mutex::new(HashMap::new()),
            ledger: Mutex::new(HashMap::new()),
            parked_tasks: Mutex::new(VecDeque::new()),
            parked_objects: Mutex::new(HashMap::new()),
            cancelled: Mutex::new(HashSet::new()),
            global: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn directory(&self) -> &RegionDirectory {
        &self.directory
    }

    pub(crate) fn register_region(
        &self,
        region: RegionId,
        sender: Sender<Inbound>,
        control: Arc<RegionControl>,
    ) {
        self.endpoints
            .write()
            .insert(region, Endpoint { sender, control });
    }

    pub(crate) fn unregister_region(&self, region: RegionId) {
        self.endpoints.write().remove(&region);
    }

    /// Records that `retired` was absorbed into `successor`. Work
    /// addressed to the retired id follows the alias from then on.
    pub(crate) fn record_alias(&self, retired: RegionId, successor: RegionId) {
        self.aliases.write().insert(retired, successor);
    }

    /// Follows the alias chain from `region` to the live region id.
    pub(crate) fn canonical_region(&self, region: RegionId) -> RegionId {
        let aliases = self.aliases.read();
        let mut current = region;
        while let Some(&next) = aliases.get(&current) {
            current = next;
        }
        current
    }

    /// Marks a task cancelled. Best-effort: a task already executing
    /// cannot be recalled.
    pub(crate) fn cancel(&self, task: TaskId) {
        self.cancelled.lock().insert(task);
    }

    /// Consumes a cancellation for `task`, returning true if it was
    /// cancelled. Called exactly once per task, at execution time.
    pub(crate) fn consume_cancelled(&self, task: TaskId) -> bool {
        self.cancelled.lock().remove(&task)
    }

    /// Delivers a task toward its target. Region targets follow merge
    /// aliases; cell targets resolve through the directory; tasks for
    /// unowned cells park until the cell is claimed. Undeliverable
    /// tasks are reported and dead-lettered, never silently dropped.
    pub(crate) fn route_task(&self, task: Task) {
        match task.target {
            TaskTarget::Global => self.global.lock().push_back(task),
            TaskTarget::Region(region) => {
                let canonical = self.canonical_region(region);
                self.send_task_to(canonical, task);
            }
            TaskTarget::Cell(cell) => match self.directory.resolve(cell) {
                Owner::Region(region) => self.send_task_to(region, task),
                Owner::Unowned => {
                    debug!(task = %task.id, %cell, "parking task for unowned cell");
                    self.parked_tasks.lock().push_back(task);
                }
            },
        }
    }

    fn send_task_to(&self, region: RegionId, task: Task) {
        let undelivered = {
            let endpoints = self.endpoints.read();
            match endpoints.get(&region) {
                None => Some((task, "has no endpoint")),
                Some(endpoint) => match endpoint.sender.send(Inbound::Task(task)) {
                    Ok(()) => None,
                    Err(crossbeam_channel::SendError(Inbound::Task(task))) => {
                        Some((task, "inbox is closed"))
                    }
                    Err(_) => None,
                },
            }
        };
        if let Some((task, why)) = undelivered {
            self.dead_letter(task, format!("{region} {why}"));
        }
    }

    fn dead_letter(&self, task: Task, reason: String) {
        warn!(task = %task.id, reason, "task undeliverable");
        self.dead_letters.lock().push((task.id, reason));
    }

    /// Begins a handoff for an object released by `source`. The next
    /// token generation is minted here; the destination validates it
    /// at install. If the destination cell went unowned in between,
    /// the object parks instead.
    pub(crate) fn send_object_from(&self, mut owned: OwnedObject, source: RegionId) {
        let cell = owned.state.cell();
        let dest = match self.directory.resolve(cell) {
            Owner::Region(dest) => dest,
            Owner::Unowned => {
                self.park_object(
                    ReceiveObject {
                        state: owned.state,
                        logic: owned.logic,
                    },
                    source,
                );
                return;
            }
        };

        let token = owned.token.succeed(dest);
        owned.rebind(token);
        let id = owned.state.id();

        let recv = ReceiveObject {
            state: owned.state,
            logic: owned.logic,
        };
        let returned = {
            let endpoints = self.endpoints.read();
            match endpoints.get(&dest) {
                None => Some(recv),
                Some(endpoint) => {
                    self.ledger.lock().insert(
                        id,
                        PendingEntry {
                            from: source,
                            to: dest,
                            sent_dest_tick: endpoint.control.tick_count(),
                            generation: token.generation(),
                            alerted: false,
                        },
                    );
                    self.object_index.lock().remove(&id);
                    match endpoint.sender.send(Inbound::Receive(recv)) {
                        Ok(()) => None,
                        Err(crossbeam_channel::SendError(Inbound::Receive(recv))) => Some(recv),
                        Err(_) => None,
                    }
                }
            }
        };
        // Destination retired between resolve and send; park and let
        // the supervisor re-route once cells are claimed again.
        if let Some(recv) = returned {
            self.ledger.lock().remove(&id);
            self.park_object(recv, source);
        }
    }

    /// Holds an object whose cell has no owner. The object stays
    /// observable through [`Self::object_location`] and counts toward
    /// [`Self::parked_object_count`] until a claim re-routes it.
    fn park_object(&self, recv: ReceiveObject, from: RegionId) {
        let id = recv.state.id();
        warn!(object = %id, %from, cell = %recv.state.cell(), "object parked on unowned cell");
        self.object_index.lock().remove(&id);
        self.parked_objects.lock().insert(
            id,
            ParkedObject {
                recv,
                from,
                seen_tick: None,
                alerted: false,
            },
        );
    }

    /// Removes a parked object outright (despawn). Returns false if it
    /// was re-routed in the meantime.
    pub(crate) fn remove_parked(&self, object: ObjectId) -> bool {
        self.parked_objects.lock().remove(&object).is_some()
    }

    /// Re-sends an in-flight object whose cell stopped resolving to
    /// the region that received it. Called from the installing side.
    pub(crate) fn redirect_receive(&self, recv: ReceiveObject, at: RegionId) {
        let id = recv.state.id();
        debug!(object = %id, region = %at, "handoff redirected by topology change");
        self.ledger.lock().remove(&id);
        let owned = OwnedObject::new(recv.state, recv.logic);
        self.send_object_from(owned, at);
    }

    /// Retires a handoff: the object is installed in `region` under
    /// `token`.
    ///
    /// # Panics
    ///
    /// Panics if the delivered generation is older than the ledger's
    /// record; a stale delivery means two copies of the object exist.
    pub(crate) fn complete_migration(
        &self,
        object: ObjectId,
        region: RegionId,
        token: OwnershipToken,
    ) {
        if let Some(entry) = self.ledger.lock().remove(&object) {
            assert!(
                token.generation() >= entry.generation,
                "stale handoff delivered for {object}: installed {token}, ledger expected g{}",
                entry.generation
            );
        }
        self.object_index.lock().insert(object, region);
    }

    /// Records an installed object's location outside the handoff
    /// path (spawn, merge, split).
    pub(crate) fn index_set(&self, object: ObjectId, region: RegionId) {
        self.object_index.lock().insert(object, region);
    }

    pub(crate) fn index_remove(&self, object: ObjectId) {
        self.object_index.lock().remove(&object);
    }

    /// Rewrites every location record pointing at `from` to point at
    /// `to`. Used when a merge retires `from` with `to` absorbing its
    /// state, including handoffs still in flight toward `from`.
    pub(crate) fn retarget(&self, from: RegionId, to: RegionId) {
        for region in self.object_index.lock().values_mut() {
            if *region == from {
                *region = to;
            }
        }
        for entry in self.ledger.lock().values_mut() {
            if entry.to == from {
                entry.to = to;
            }
            if entry.from == from {
                entry.from = to;
            }
        }
    }

    /// External view of an object's location. The ledger is consulted
    /// first so an in-flight object is reported as pending, never as
    /// owned by a region that already released it.
    pub(crate) fn object_location(&self, object: ObjectId) -> ObjectLocation {
        if let Some(entry) = self.ledger.lock().get(&object) {
            return ObjectLocation::PendingMigration {
                from: entry.from,
                to: entry.to,
            };
        }
        if let Some(entry) = self.parked_objects.lock().get(&object) {
            return ObjectLocation::Parked { from: entry.from };
        }
        match self.object_index.lock().get(&object) {
            Some(&region) => ObjectLocation::Owned(region),
            None => ObjectLocation::Unknown,
        }
    }

    /// Reports handoffs toward `region` that its loop has ticked past
    /// without installing. Called by the destination at end of tick.
    pub(crate) fn alert_stuck(&self, region: RegionId, dest_tick: u64) {
        let threshold = self.config.pending_migration_alert_ticks;
        for (object, entry) in self.ledger.lock().iter_mut() {
            if entry.to == region
                && !entry.alerted
                && dest_tick > entry.sent_dest_tick.saturating_add(threshold)
            {
                entry.alerted = true;
                warn!(
                    object = %object,
                    from = %entry.from,
                    to = %entry.to,
                    sent_dest_tick = entry.sent_dest_tick,
                    dest_tick,
                    "handoff not installed within alert window"
                );
            }
        }
    }

    /// Retries everything parked on unowned cells. Called after any
    /// topology change that claims cells.
    pub(crate) fn flush_parked(&self) {
        let tasks: Vec<Task> = self.parked_tasks.lock().drain(..).collect();
        for task in tasks {
            self.route_task(task);
        }

        let objects: Vec<(ObjectId, ParkedObject)> =
            self.parked_objects.lock().drain().collect();
        for (id, entry) in objects {
            match self.directory.resolve(entry.recv.state.cell()) {
                Owner::Region(_) => {
                    // Re-enters the normal handoff path.
                    let owned = OwnedObject::new(entry.recv.state, entry.recv.logic);
                    self.send_object_from(owned, entry.from);
                }
                Owner::Unowned => {
                    // Still unowned; keep the park's alert bookkeeping.
                    self.parked_objects.lock().insert(id, entry);
                }
            }
        }
    }

    /// Flags parked objects that have outlived the alert bound,
    /// measured in supervisor ticks. Returns how many were newly
    /// flagged.
    pub(crate) fn alert_parked(&self, global_tick: u64) -> usize {
        let threshold = self.config.pending_migration_alert_ticks;
        let mut flagged = 0;
        for (object, entry) in self.parked_objects.lock().iter_mut() {
            match entry.seen_tick {
                None => entry.seen_tick = Some(global_tick),
                Some(seen) => {
                    if !entry.alerted && global_tick > seen.saturating_add(threshold) {
                        entry.alerted = true;
                        flagged += 1;
                        warn!(
                            object = %object,
                            from = %entry.from,
                            cell = %entry.recv.state.cell(),
                            parked_for = global_tick - seen,
                            "parked object exceeded the alert window"
                        );
                    }
                }
            }
        }
        flagged
    }

    /// Drains the global-scope task queue.
    pub(crate) fn take_global(&self) -> Vec<Task> {
        self.global.lock().drain(..).collect()
    }

    pub(crate) fn pending_count(&self) -> usize {
        self.ledger.lock().len()
    }

    pub(crate) fn parked_task_count(&self) -> usize {
        self.parked_tasks.lock().len()
    }

    pub(crate) fn parked_object_count(&self) -> usize {
        self.parked_objects.lock().len()
    }

    pub(crate) fn dead_letter_count(&self) -> usize {
        self.dead_letters.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::DirectoryOp;
    use crate::task::{ObjectLogic, ObjectState, SimError};
    use veldt_core::CellPos;

    struct Still;

    impl ObjectLogic for Still {
        fn advance(&mut self, _state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
            Ok(())
        }
    }

    fn owned(id: u64, cell: CellPos, region: RegionId) -> OwnedObject {
        let state = ObjectState::new(
            ObjectId::new(id),
            cell,
            OwnershipToken::initial(region),
        );
        OwnedObject::new(state, Box::new(Still))
    }

    #[test]
    fn test_object_parked_on_unowned_cell_stays_observable() {
        let directory = Arc::new(RegionDirectory::new());
        let protocol = MigrationProtocol::new(Arc::clone(&directory), CoreConfig::default());
        let a = RegionId::new(1);
        let id = ObjectId::new(7);

        protocol.send_object_from(owned(7, CellPos::new(0, 0), a), a);
        assert_eq!(protocol.parked_object_count(), 1);
        assert_eq!(protocol.object_location(id), ObjectLocation::Parked { from: a });

        // Claiming the cell drains the park into a normal handoff.
        let b = RegionId::new(2);
        directory.apply(&[DirectoryOp::Assign(CellPos::new(0, 0), b)]);
        let (sender, receiver) = crossbeam_channel::unbounded();
        protocol.register_region(b, sender, Arc::new(RegionControl::new(true)));
        protocol.flush_parked();

        assert_eq!(protocol.parked_object_count(), 0);
        assert!(matches!(
            protocol.object_location(id),
            ObjectLocation::PendingMigration { to, .. } if to == b
        ));
        assert!(matches!(receiver.try_recv(), Ok(Inbound::Receive(_))));
    }

    #[test]
    fn test_parked_object_alert_fires_once_after_the_bound() {
        let directory = Arc::new(RegionDirectory::new());
        let protocol = MigrationProtocol::new(directory, CoreConfig::default());
        let a = RegionId::new(1);

        protocol.send_object_from(owned(3, CellPos::new(5, 5), a), a);

        // Default bound is one supervisor tick past first observation.
        assert_eq!(protocol.alert_parked(10), 0);
        assert_eq!(protocol.alert_parked(11), 0);
        assert_eq!(protocol.alert_parked(12), 1);
        assert_eq!(protocol.alert_parked(13), 0);
    }

    #[test]
    fn test_despawn_clears_a_parked_object() {
        let directory = Arc::new(RegionDirectory::new());
        let protocol = MigrationProtocol::new(directory, CoreConfig::default());
        let a = RegionId::new(1);
        let id = ObjectId::new(9);

        protocol.send_object_from(owned(9, CellPos::new(2, 2), a), a);
        assert!(protocol.remove_parked(id));
        assert!(!protocol.remove_parked(id));
        assert_eq!(protocol.object_location(id), ObjectLocation::Unknown);
    }
}
