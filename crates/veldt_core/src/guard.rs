//! # Thread-Affinity Guard
//!
//! The runtime check enforcing that region-owned state is mutated only
//! by the region's worker thread. It replaces compile-time alias
//! checking at the collaborator boundary: many independent code paths
//! reach region state, and the guard is the last line of defense
//! against cross-thread races.
//!
//! The check is O(1): one registry lookup plus a thread-id comparison.
//! It never blocks and never queues - a violation is a caller bug, not
//! a recoverable runtime condition. The [`GuardPolicy`] decides
//! between crashing loudly (development) and log-and-reject
//! (production degradation).

use crate::config::GuardPolicy;
use crate::error::{CoreError, CoreResult};
use crate::token::RegionId;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::thread::{self, ThreadId};
use tracing::error;

/// Registry of region worker threads plus the violation policy.
///
/// Registration changes only when the coordinator spawns or retires a
/// worker thread; `assert_owning_thread` is called on every
/// externally-reachable mutation.
#[derive(Debug)]
pub struct ThreadAffinityGuard {
    policy: GuardPolicy,
    owners: RwLock<HashMap<RegionId, ThreadId>>,
}

impl ThreadAffinityGuard {
    /// Creates a guard with the given violation policy.
    #[must_use]
    pub fn new(policy: GuardPolicy) -> Self {
        Self {
            policy,
            owners: RwLock::new(HashMap::new()),
        }
    }

    /// Returns the configured violation policy.
    #[must_use]
    pub fn policy(&self) -> GuardPolicy {
        self.policy
    }

    /// Records `thread` as the worker owning `region`. Coordinator
    /// use only, while the region is not ticking.
    pub fn register(&self, region: RegionId, thread: ThreadId) {
        self.owners.write().insert(region, thread);
    }

    /// Removes the registration for a retired region.
    pub fn unregister(&self, region: RegionId) {
        self.owners.write().remove(&region);
    }

    /// Returns the worker thread currently registered for `region`.
    #[must_use]
    pub fn owner_of(&self, region: RegionId) -> Option<ThreadId> {
        self.owners.read().get(&region).copied()
    }

    /// Returns true if the calling thread is the registered worker for
    /// `region`. Never panics; used on observation paths.
    #[must_use]
    pub fn is_owning_thread(&self, region: RegionId) -> bool {
        self.owner_of(region) == Some(thread::current().id())
    }

    /// Validates that the calling thread owns `region`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::UnknownRegion`] if the region has no
    /// registered worker, or [`CoreError::AffinityViolation`] under
    /// the logging policy when the caller is the wrong thread.
    ///
    /// # Panics
    ///
    /// Panics on violation under [`GuardPolicy::Fatal`].
    pub fn assert_owning_thread(&self, region: RegionId) -> CoreResult<()> {
        let owner = self
            .owner_of(region)
            .ok_or(CoreError::UnknownRegion(region))?;
        let caller = thread::current().id();
        if owner == caller {
            return Ok(());
        }

        match self.policy {
            GuardPolicy::Fatal => {
                panic!(
                    "affinity violation: {region} is owned by {owner:?}, mutation attempted from {caller:?}"
                );
            }
            GuardPolicy::Log => {
                error!(
                    region = %region,
                    owner = ?owner,
                    caller = ?caller,
                    "affinity violation rejected"
                );
                Err(CoreError::AffinityViolation {
                    region,
                    owner_thread: format!("{owner:?}"),
                    calling_thread: format!("{caller:?}"),
                })
            }
        }
    }
}
