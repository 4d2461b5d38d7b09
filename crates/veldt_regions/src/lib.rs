//! # VELDT Regions
//!
//! The regionized concurrency core: the world is partitioned into
//! regions of cells, each ticked by a dedicated worker thread at a
//! fixed cadence, with no shared mutable simulation state between
//! regions. Cross-region effects travel as messages; topology changes
//! happen under coordinator barriers; every externally reachable
//! mutation is checked by the thread-affinity guard.
//!
//! ## Layout
//!
//! - [`directory`] - the lock-free cell-to-region map
//! - [`task`] - the collaborator seams ([`ObjectLogic`], task payloads)
//! - [`scheduler`] - the per-region tick loop (crate-internal)
//! - [`migrate`] - object handoff and task routing
//! - [`coordinator`] - topology operations, barriers, observation
//!
//! ## Quick Start
//!
//! ```no_run
//! use veldt_core::{CellBounds, CellPos, CoreConfig};
//! use veldt_regions::{Coordinator, ObjectLogic, ObjectState, SimError};
//!
//! struct Walker;
//!
//! impl ObjectLogic for Walker {
//!     fn advance(&mut self, state: &mut ObjectState, _tick: u64) -> Result<(), SimError> {
//!         state.set_cell(state.cell().offset(1, 0));
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), veldt_core::CoreError> {
//! let coordinator = Coordinator::new(CoreConfig::default())?;
//! coordinator.create_region(CellBounds::new(CellPos::new(0, 0), CellPos::new(7, 7)))?;
//! let walker = coordinator.spawn_object(CellPos::new(0, 0), Box::new(Walker))?;
//! # let _ = walker;
//! # Ok(())
//! # }
//! ```

pub mod coordinator;
pub mod directory;
pub mod migrate;
mod queue;
mod region;
pub mod scheduler;
pub mod task;

pub use coordinator::{
    BarrierScope, Coordinator, ObjectSnapshot, RegionSnapshot, RegionStatsSnapshot, WorldSnapshot,
};
pub use directory::{Owner, RegionDirectory};
pub use migrate::ObjectLocation;
pub use scheduler::TickStats;
pub use task::{
    ObjectLogic, ObjectState, SimError, Task, TaskContext, TaskHandle, TaskPayload, TaskTarget,
};

pub use veldt_core::{
    CellBounds, CellPos, CoreConfig, CoreError, CoreResult, GuardPolicy, ObjectId, OwnershipToken,
    RegionId, TaskId, ThreadAffinityGuard,
};
