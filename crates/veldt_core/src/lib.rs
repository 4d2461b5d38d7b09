//! # VELDT Core
//!
//! Primitives shared by every layer of the regionized world simulator:
//!
//! - Cell coordinates and rectangular bounds ([`coord`])
//! - Stable ids and versioned ownership tokens ([`token`])
//! - The thread-affinity guard ([`guard`])
//! - Startup configuration ([`config`])
//! - The error taxonomy ([`error`])
//!
//! ## Ownership Rules
//!
//! 1. **Every cell has at most one owner** - the directory is a total,
//!    non-overlapping partition of claimed space
//! 2. **Every object has exactly one owner** - outside the bounded
//!    migration window
//! 3. **Region state is mutated only by its owning thread** - enforced
//!    at runtime by [`guard::ThreadAffinityGuard`]

pub mod config;
pub mod coord;
pub mod error;
pub mod guard;
pub mod token;

pub use config::{CoreConfig, GuardPolicy};
pub use coord::{CellBounds, CellPos};
pub use error::{CoreError, CoreResult};
pub use guard::ThreadAffinityGuard;
pub use token::{IdAllocator, ObjectId, OwnershipToken, RegionId, TaskId};
