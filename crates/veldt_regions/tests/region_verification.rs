//! End-to-end verification of the regionized core: partitioning,
//! per-region ticking, guard enforcement, migration, topology changes
//! and failure isolation, all through the public coordinator surface.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use veldt_regions::{
    CellBounds, CellPos, Coordinator, CoreConfig, CoreError, GuardPolicy, ObjectLocation,
    ObjectLogic, ObjectState, Owner, RegionId, SimError, TaskTarget,
};

fn fast_config() -> CoreConfig {
    CoreConfig {
        tick_rate: 200,
        ..CoreConfig::default()
    }
}

/// Polls `cond` until it holds or the deadline passes.
fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    false
}

fn bounds(x0: i32, z0: i32, x1: i32, z1: i32) -> CellBounds {
    CellBounds::new(CellPos::new(x0, z0), CellPos::new(x1, z1))
}

/// Stays put, never fails.
struct Idle;

impl ObjectLogic for Idle {
    fn advance(&mut self, _state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
        Ok(())
    }
}

/// Steps one cell east per tick.
struct WalkEast;

impl ObjectLogic for WalkEast {
    fn advance(&mut self, state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
        state.set_cell(state.cell().offset(1, 0));
        Ok(())
    }
}

/// Counts its own advancements.
struct Counting(Arc<AtomicU64>);

impl ObjectLogic for Counting {
    fn advance(&mut self, _state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
        self.0.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Fails every tick.
struct FailAlways;

impl ObjectLogic for FailAlways {
    fn advance(&mut self, _state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
        Err("simulated rule failure".into())
    }
}

#[test]
fn test_partition_is_exclusive_and_rejects_overlap() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 3, 3)).unwrap();
    let b = coordinator.create_region(bounds(4, 0, 7, 3)).unwrap();

    for z in 0..=3 {
        for x in 0..=3 {
            assert_eq!(
                coordinator.current_region_of(CellPos::new(x, z)),
                Owner::Region(a)
            );
        }
        for x in 4..=7 {
            assert_eq!(
                coordinator.current_region_of(CellPos::new(x, z)),
                Owner::Region(b)
            );
        }
    }
    assert_eq!(
        coordinator.current_region_of(CellPos::new(0, 10)),
        Owner::Unowned
    );

    // A region claiming any already-owned cell is rejected whole.
    let err = coordinator.create_region(bounds(3, 3, 5, 5)).unwrap_err();
    assert!(matches!(err, CoreError::BoundsOverlap { .. }));
    assert_eq!(coordinator.live_regions(), vec![a, b]);
}

#[test]
fn test_regions_tick_independently_at_cadence() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 1)).unwrap();
    let b = coordinator.create_region(bounds(2, 0, 3, 1)).unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        coordinator.region_stats(a).unwrap().ticks >= 10
            && coordinator.region_stats(b).unwrap().ticks >= 10
    }));
    let stats = coordinator.region_stats(a).unwrap();
    assert_eq!(stats.region, a);
    assert!(stats.timing.total_ticks() >= 10);
}

#[test]
fn test_objects_advance_every_tick() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    coordinator.create_region(bounds(0, 0, 3, 3)).unwrap();

    let count = Arc::new(AtomicU64::new(0));
    let object = coordinator
        .spawn_object(CellPos::new(1, 1), Box::new(Counting(Arc::clone(&count))))
        .unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        count.load(Ordering::Relaxed) >= 20
    }));
    assert!(matches!(
        coordinator.object_location(object),
        ObjectLocation::Owned(_)
    ));
}

#[test]
fn test_boundary_crossing_hands_off_with_new_generation() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 4, 0)).unwrap();
    let b = coordinator.create_region(bounds(5, 0, 9, 0)).unwrap();

    let walker = coordinator
        .spawn_object(CellPos::new(3, 0), Box::new(WalkEast))
        .unwrap();
    assert_eq!(coordinator.object_location(walker), ObjectLocation::Owned(a));

    assert!(wait_for(Duration::from_secs(2), || {
        coordinator.object_location(walker) == ObjectLocation::Owned(b)
    }));

    let snapshot = coordinator.snapshot().unwrap();
    let region_b = snapshot.regions.iter().find(|r| r.id == b).unwrap();
    let object = region_b.objects.iter().find(|o| o.id == walker).unwrap();
    assert!(object.generation >= 2, "handoff must mint a new generation");
    assert!(object.cell.x >= 5);

    // The pending window closes once the destination installs.
    assert!(wait_for(Duration::from_secs(1), || {
        coordinator.pending_migration_count() == 0
    }));
}

#[test]
fn test_cell_task_runs_exactly_once_on_the_owner() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    coordinator.create_region(bounds(0, 0, 3, 0)).unwrap();
    let b = coordinator.create_region(bounds(4, 0, 7, 0)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let seen_region = Arc::new(Mutex::new(None));
    {
        let runs = Arc::clone(&runs);
        let seen_region = Arc::clone(&seen_region);
        coordinator
            .submit_task(
                TaskTarget::Cell(CellPos::new(5, 0)),
                None,
                Box::new(move |cx| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    *seen_region.lock().unwrap() = cx.region();
                }),
            )
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 1, "payload must run exactly once");
    assert_eq!(*seen_region.lock().unwrap(), Some(b));
}

#[test]
fn test_delayed_task_waits_for_its_tick() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();

    let now = coordinator.region_stats(a).unwrap().ticks;
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        coordinator
            .submit_task(
                TaskTarget::Region(a),
                Some(now + 40),
                Box::new(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    thread::sleep(Duration::from_millis(20));
    assert_eq!(runs.load(Ordering::SeqCst), 0, "task ran before its due tick");
    assert!(wait_for(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    assert!(coordinator.region_stats(a).unwrap().ticks >= now + 40);
}

#[test]
fn test_cancelled_task_never_runs() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    let handle = {
        let runs = Arc::clone(&runs);
        coordinator
            .submit_task(
                TaskTarget::Region(a),
                Some(10_000),
                Box::new(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap()
    };
    coordinator.cancel_task(handle);

    thread::sleep(Duration::from_millis(150));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
}

#[test]
fn test_barrier_freezes_named_regions_only() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let b = coordinator.create_region(bounds(2, 0, 3, 0)).unwrap();
    let c = coordinator.create_region(bounds(4, 0, 5, 0)).unwrap();

    coordinator
        .request_barrier(&[a, b], |scope| {
            let mut ids = scope.region_ids();
            ids.sort_unstable();
            assert_eq!(ids, vec![a, b]);

            let a_tick = scope.region_tick(a).unwrap();
            let c_before = coordinator.region_stats(c).unwrap().ticks;
            thread::sleep(Duration::from_millis(150));
            let c_after = coordinator.region_stats(c).unwrap().ticks;

            // c kept ticking while a and b were frozen.
            assert!(c_after > c_before);
            assert_eq!(scope.region_tick(a).unwrap(), a_tick);
        })
        .unwrap();

    // Frozen regions resume once the barrier lifts.
    let resumed = coordinator.region_stats(a).unwrap().ticks;
    assert!(wait_for(Duration::from_secs(2), || {
        coordinator.region_stats(a).unwrap().ticks > resumed
    }));
}

#[test]
fn test_guard_rejects_mutation_from_foreign_threads() {
    let config = CoreConfig {
        guard_policy: GuardPolicy::Log,
        ..fast_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.create_region(bounds(0, 0, 3, 3)).unwrap();
    let object = coordinator
        .spawn_object(CellPos::new(2, 2), Box::new(Idle))
        .unwrap();

    // The test thread is not the owning worker.
    let err = coordinator
        .with_owned_object(object, |state| state.set_cell(CellPos::new(0, 0)))
        .unwrap_err();
    assert!(matches!(err, CoreError::AffinityViolation { .. }));

    // Hammer it from several threads; every attempt must be rejected.
    thread::scope(|s| {
        for _ in 0..4 {
            s.spawn(|| {
                for _ in 0..50 {
                    let result =
                        coordinator.with_owned_object(object, |state| state.set_cell(CellPos::new(0, 0)));
                    assert!(matches!(result, Err(CoreError::AffinityViolation { .. })));
                }
            });
        }
    });

    // The object never moved.
    let snapshot = coordinator.snapshot().unwrap();
    let seen = snapshot
        .regions
        .iter()
        .flat_map(|r| r.objects.iter())
        .find(|o| o.id == object)
        .unwrap();
    assert_eq!(seen.cell, CellPos::new(2, 2));
    assert_eq!(seen.generation, 1);
}

#[test]
fn test_barrier_request_from_worker_thread_is_rejected() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let coordinator = Arc::clone(&coordinator);
        coordinator
            .clone()
            .submit_task(
                TaskTarget::Region(a),
                None,
                Box::new(move |_| {
                    let result = coordinator.request_barrier(&[a], |_| ());
                    tx.send(result.map(|()| ())).unwrap();
                }),
            )
            .unwrap();
    }

    let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(matches!(
        result,
        Err(CoreError::BarrierFromOwnedThread { region }) if region == a
    ));
}

#[test]
fn test_in_tick_object_access_through_the_external_entry_point() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let object = coordinator
        .spawn_object(CellPos::new(0, 0), Box::new(Idle))
        .unwrap();

    let (tx, rx) = mpsc::channel();
    {
        let coordinator = Arc::clone(&coordinator);
        coordinator
            .clone()
            .submit_task(
                TaskTarget::Region(a),
                None,
                Box::new(move |cx| {
                    // On the owning thread the entry point reaches the
                    // live world.
                    let direct = coordinator.with_owned_object(object, |state| state.cell());
                    // Nested inside an object borrow it must refuse.
                    let nested = cx
                        .with_object(object, |_| {
                            coordinator.with_owned_object(object, |state| state.cell())
                        })
                        .unwrap();
                    tx.send((direct, nested)).unwrap();
                }),
            )
            .unwrap();
    }

    let (direct, nested) = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(direct.unwrap(), CellPos::new(0, 0));
    assert!(matches!(
        nested,
        Err(CoreError::ReentrantAccess { region }) if region == a
    ));
}

#[test]
fn test_merge_absorbs_objects_cells_and_aliases() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let b = coordinator.create_region(bounds(2, 0, 3, 0)).unwrap();

    let in_a = coordinator
        .spawn_object(CellPos::new(0, 0), Box::new(Idle))
        .unwrap();
    let in_b = coordinator
        .spawn_object(CellPos::new(3, 0), Box::new(Idle))
        .unwrap();

    let merged = coordinator.merge_regions(a, b).unwrap();
    assert_eq!(merged, a);
    assert_eq!(coordinator.live_regions(), vec![a]);
    assert_eq!(
        coordinator.current_region_of(CellPos::new(3, 0)),
        Owner::Region(a)
    );

    let snapshot = coordinator.snapshot().unwrap();
    let region = &snapshot.regions[0];
    assert_eq!(region.id, a);
    assert_eq!(region.cells.len(), 4);
    assert_eq!(region.objects.len(), 2);
    let moved = region.objects.iter().find(|o| o.id == in_b).unwrap();
    assert_eq!(moved.generation, 2, "absorbed objects get a new generation");
    let stayed = region.objects.iter().find(|o| o.id == in_a).unwrap();
    assert_eq!(stayed.generation, 1);

    // Tasks addressed to the retired id follow the alias.
    let runs = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(None));
    {
        let runs = Arc::clone(&runs);
        let seen = Arc::clone(&seen);
        coordinator
            .submit_task(
                TaskTarget::Region(b),
                None,
                Box::new(move |cx| {
                    runs.fetch_add(1, Ordering::SeqCst);
                    *seen.lock().unwrap() = cx.region();
                }),
            )
            .unwrap();
    }
    assert!(wait_for(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(*seen.lock().unwrap(), Some(a));
}

#[test]
fn test_tasks_submitted_during_merge_cycles_are_accounted_for() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let mut b = coordinator.create_region(bounds(2, 0, 3, 0)).unwrap();

    let stop = AtomicBool::new(false);
    let delivered = Arc::new(AtomicUsize::new(0));
    let submitted = AtomicUsize::new(0);

    // Submit against the absorbed region's cell while the topology
    // churns underneath.
    thread::scope(|s| {
        s.spawn(|| {
            while !stop.load(Ordering::Acquire) {
                let delivered = Arc::clone(&delivered);
                coordinator
                    .submit_task(
                        TaskTarget::Cell(CellPos::new(2, 0)),
                        None,
                        Box::new(move |_| {
                            delivered.fetch_add(1, Ordering::SeqCst);
                        }),
                    )
                    .unwrap();
                submitted.fetch_add(1, Ordering::SeqCst);
                thread::sleep(Duration::from_micros(50));
            }
        });

        for _ in 0..10 {
            coordinator.merge_regions(a, b).unwrap();
            b = coordinator.split_region(a, bounds(2, 0, 3, 0)).unwrap();
        }
        stop.store(true, Ordering::Release);
    });

    let total = submitted.load(Ordering::SeqCst);
    assert!(total > 0);
    // Every submitted task either ran or is explicitly accounted for;
    // none vanish in a merge.
    assert!(
        wait_for(Duration::from_secs(5), || {
            delivered.load(Ordering::SeqCst)
                + coordinator.dead_letter_count()
                + coordinator.parked_task_count()
                == total
        }),
        "lost tasks: delivered {} + dead {} + parked {} != submitted {}",
        delivered.load(Ordering::SeqCst),
        coordinator.dead_letter_count(),
        coordinator.parked_task_count(),
        total
    );
}

#[test]
fn test_merge_rejects_non_adjacent_regions() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let b = coordinator.create_region(bounds(5, 0, 6, 0)).unwrap();

    let err = coordinator.merge_regions(a, b).unwrap_err();
    assert!(matches!(err, CoreError::MergeNotAdjacent { .. }));
    assert_eq!(coordinator.live_regions(), vec![a, b]);
}

#[test]
fn test_split_moves_selected_cells_and_objects() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 7, 0)).unwrap();
    let west = coordinator
        .spawn_object(CellPos::new(1, 0), Box::new(Idle))
        .unwrap();
    let east = coordinator
        .spawn_object(CellPos::new(6, 0), Box::new(Idle))
        .unwrap();

    // Selecting nothing or everything is invalid.
    assert!(matches!(
        coordinator.split_region(a, bounds(20, 0, 25, 0)).unwrap_err(),
        CoreError::InvalidSplit { .. }
    ));
    assert!(matches!(
        coordinator.split_region(a, bounds(0, 0, 7, 0)).unwrap_err(),
        CoreError::InvalidSplit { .. }
    ));

    let new_region = coordinator.split_region(a, bounds(4, 0, 7, 0)).unwrap();
    assert_ne!(new_region, a);
    assert_eq!(
        coordinator.current_region_of(CellPos::new(6, 0)),
        Owner::Region(new_region)
    );
    assert_eq!(
        coordinator.current_region_of(CellPos::new(1, 0)),
        Owner::Region(a)
    );
    assert_eq!(coordinator.object_location(west), ObjectLocation::Owned(a));
    assert_eq!(
        coordinator.object_location(east),
        ObjectLocation::Owned(new_region)
    );

    let snapshot = coordinator.snapshot().unwrap();
    let moved = snapshot
        .regions
        .iter()
        .flat_map(|r| r.objects.iter())
        .find(|o| o.id == east)
        .unwrap();
    assert_eq!(moved.generation, 2);
}

#[test]
fn test_delayed_task_survives_split_and_runs_once() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 7, 0)).unwrap();

    let now = coordinator.region_stats(a).unwrap().ticks;
    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        coordinator
            .submit_task(
                TaskTarget::Cell(CellPos::new(6, 0)),
                Some(now + 30),
                Box::new(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }

    // Move the target cell to a new region before the task comes due.
    coordinator.split_region(a, bounds(4, 0, 7, 0)).unwrap();

    assert!(wait_for(Duration::from_secs(3), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_destroy_requires_empty_region_and_reports_undeliverable() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let object = coordinator
        .spawn_object(CellPos::new(0, 0), Box::new(Idle))
        .unwrap();

    let err = coordinator.destroy_region(a).unwrap_err();
    assert!(matches!(err, CoreError::RegionNotEmpty { .. }));

    coordinator.despawn_object(object).unwrap();
    assert_eq!(coordinator.object_location(object), ObjectLocation::Unknown);
    coordinator.destroy_region(a).unwrap();

    assert_eq!(
        coordinator.current_region_of(CellPos::new(0, 0)),
        Owner::Unowned
    );
    assert!(matches!(
        coordinator.spawn_object(CellPos::new(0, 0), Box::new(Idle)),
        Err(CoreError::UnownedCell(_))
    ));
    assert!(matches!(
        coordinator.submit_task(TaskTarget::Region(a), None, Box::new(|_| ())),
        Err(CoreError::TaskUndeliverable { .. })
    ));
}

#[test]
fn test_task_for_unowned_cell_parks_until_claimed() {
    let coordinator = Coordinator::new(fast_config()).unwrap();

    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        coordinator
            .submit_task(
                TaskTarget::Cell(CellPos::new(50, 50)),
                None,
                Box::new(move |_| {
                    runs.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();
    }
    thread::sleep(Duration::from_millis(100));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(coordinator.parked_task_count(), 1);
    assert_eq!(coordinator.dead_letter_count(), 0);

    coordinator.create_region(bounds(50, 50, 51, 51)).unwrap();
    assert!(wait_for(Duration::from_secs(2), || {
        runs.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(coordinator.parked_task_count(), 0);
}

#[test]
fn test_failing_object_is_quarantined_without_stopping_the_region() {
    let config = CoreConfig {
        quarantine_threshold: 3,
        ..fast_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();

    let healthy_count = Arc::new(AtomicU64::new(0));
    coordinator
        .spawn_object(CellPos::new(0, 0), Box::new(FailAlways))
        .unwrap();
    coordinator
        .spawn_object(
            CellPos::new(1, 0),
            Box::new(Counting(Arc::clone(&healthy_count))),
        )
        .unwrap();

    assert!(wait_for(Duration::from_secs(2), || {
        coordinator.region_stats(a).unwrap().quarantined == 1
    }));
    // The healthy neighbor keeps advancing.
    let before = healthy_count.load(Ordering::Relaxed);
    assert!(wait_for(Duration::from_secs(2), || {
        healthy_count.load(Ordering::Relaxed) > before + 10
    }));
}

#[test]
fn test_global_tasks_run_on_the_supervisor() {
    let coordinator = Coordinator::new(fast_config()).unwrap();

    let (tx, rx) = mpsc::channel();
    coordinator
        .submit_task(
            TaskTarget::Global,
            None,
            Box::new(move |cx| {
                tx.send(cx.region()).unwrap();
            }),
        )
        .unwrap();

    let region = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(region, None, "global scope has no region");
    assert!(coordinator.global_tick() >= 1);
}

#[test]
fn test_broadcast_visits_every_region_under_one_barrier() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    let b = coordinator.create_region(bounds(2, 0, 3, 0)).unwrap();
    let in_b = coordinator
        .spawn_object(CellPos::new(2, 0), Box::new(Idle))
        .unwrap();

    let mut seen: Vec<RegionId> = Vec::new();
    let mut found = None;
    coordinator
        .broadcast(|cx| {
            if let Some(region) = cx.region() {
                seen.push(region);
            }
            if let Ok(cell) = cx.with_object(in_b, |state| state.cell()) {
                found = Some((cx.region(), cell));
            }
        })
        .unwrap();

    seen.sort_unstable();
    assert_eq!(seen, vec![a, b]);
    assert_eq!(found, Some((Some(b), CellPos::new(2, 0))));
}

#[test]
fn test_overloaded_region_splits_automatically() {
    let config = CoreConfig {
        split_threshold_objects: 4,
        ..fast_config()
    };
    let coordinator = Coordinator::new(config).unwrap();
    coordinator.create_region(bounds(0, 0, 3, 0)).unwrap();
    for x in 0..4 {
        coordinator
            .spawn_object(CellPos::new(x, 0), Box::new(Idle))
            .unwrap();
    }

    assert!(wait_for(Duration::from_secs(4), || {
        coordinator.live_regions().len() == 2
    }));
    // No object was lost in the rebalance.
    let snapshot = coordinator.snapshot().unwrap();
    let total: usize = snapshot.regions.iter().map(|r| r.objects.len()).sum();
    assert_eq!(total, 4);
}

#[test]
fn test_randomized_spawns_are_all_accounted_for() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    let a = coordinator.create_region(bounds(0, 0, 7, 7)).unwrap();
    let b = coordinator.create_region(bounds(8, 0, 15, 7)).unwrap();

    let mut rng = StdRng::seed_from_u64(7);
    let mut spawned = Vec::new();
    for _ in 0..32 {
        let cell = CellPos::new(rng.gen_range(0..16), rng.gen_range(0..8));
        spawned.push(coordinator.spawn_object(cell, Box::new(Idle)).unwrap());
    }

    let snapshot = coordinator.snapshot().unwrap();
    let total: usize = snapshot.regions.iter().map(|r| r.objects.len()).sum();
    assert_eq!(total, 32);
    for id in spawned {
        let location = coordinator.object_location(id);
        assert!(
            location == ObjectLocation::Owned(a) || location == ObjectLocation::Owned(b),
            "{id} has unexpected location {location:?}"
        );
    }
}

#[test]
fn test_shutdown_rejects_new_work() {
    let coordinator = Coordinator::new(fast_config()).unwrap();
    coordinator.create_region(bounds(0, 0, 1, 0)).unwrap();
    coordinator.shutdown();

    assert!(matches!(
        coordinator.create_region(bounds(4, 0, 5, 0)),
        Err(CoreError::ShuttingDown)
    ));
    assert!(matches!(
        coordinator.spawn_object(CellPos::new(0, 0), Box::new(Idle)),
        Err(CoreError::ShuttingDown)
    ));
}
