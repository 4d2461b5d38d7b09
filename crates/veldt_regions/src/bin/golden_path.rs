//! Golden-path walkthrough of the regionized core: two regions, a
//! walker crossing the boundary, a cell-addressed task, a merge and a
//! split, ending with timing stats. Run with `cargo run --bin
//! golden_path`.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use veldt_regions::{
    CellBounds, CellPos, Coordinator, CoreConfig, CoreError, ObjectLocation, ObjectLogic,
    ObjectState, SimError, TaskTarget,
};

struct WalkEast;

impl ObjectLogic for WalkEast {
    fn advance(&mut self, state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
        state.set_cell(state.cell().offset(1, 0));
        Ok(())
    }
}

fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn main() -> Result<(), CoreError> {
    let config = CoreConfig {
        tick_rate: 100,
        ..CoreConfig::default()
    };
    let coordinator = Coordinator::new(config)?;
    println!("coordinator up, tick rate 100/s");

    let a = coordinator.create_region(CellBounds::new(CellPos::new(0, 0), CellPos::new(7, 7)))?;
    let b = coordinator.create_region(CellBounds::new(CellPos::new(8, 0), CellPos::new(15, 7)))?;
    println!("regions: {a} owns x0..=7, {b} owns x8..=15");

    let walker = coordinator.spawn_object(CellPos::new(5, 3), Box::new(WalkEast))?;
    println!("spawned {walker} at (5, 3), walking east");

    let runs = Arc::new(AtomicUsize::new(0));
    {
        let runs = Arc::clone(&runs);
        coordinator.submit_task(
            TaskTarget::Cell(CellPos::new(10, 3)),
            None,
            Box::new(move |cx| {
                runs.fetch_add(1, Ordering::SeqCst);
                println!(
                    "  task ran in {:?} at tick {}",
                    cx.region(),
                    cx.tick()
                );
            }),
        )?;
    }

    let crossed = wait_for(Duration::from_secs(3), || {
        coordinator.object_location(walker) == ObjectLocation::Owned(b)
    });
    println!(
        "walker crossed into {b}: {crossed} (location now {:?})",
        coordinator.object_location(walker)
    );
    wait_for(Duration::from_secs(2), || runs.load(Ordering::SeqCst) == 1);
    println!("cell task executed {} time(s)", runs.load(Ordering::SeqCst));

    let snapshot = coordinator.snapshot()?;
    for region in &snapshot.regions {
        println!(
            "  {} tick {} cells {} objects {:?}",
            region.id,
            region.tick,
            region.cells.len(),
            region
                .objects
                .iter()
                .map(|o| format!("{}@g{}", o.id, o.generation))
                .collect::<Vec<_>>()
        );
    }

    let merged = coordinator.merge_regions(a, b)?;
    println!("merged {b} into {a} -> {merged}, live: {:?}", coordinator.live_regions());

    let split = coordinator.split_region(a, CellBounds::new(CellPos::new(8, 0), CellPos::new(15, 7)))?;
    println!("split x8..=15 back out as {split}, live: {:?}", coordinator.live_regions());

    thread::sleep(Duration::from_millis(300));
    for region in coordinator.live_regions() {
        let stats = coordinator.region_stats(region)?;
        println!(
            "  {} ticks {} (late {}) avg {:?} max {:?} objects {} queued {}",
            stats.region,
            stats.ticks,
            stats.timing.late_ticks(),
            stats.timing.avg_tick(),
            stats.timing.max_tick(),
            stats.objects,
            stats.queued
        );
    }

    coordinator.shutdown();
    println!("clean shutdown");
    Ok(())
}
