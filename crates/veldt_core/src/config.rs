//! # Core Configuration
//!
//! Startup configuration for the regionized core, loaded once from
//! TOML. The core consumes these knobs; it does not own them - an
//! embedding server decides tick rate, sizing and policies.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Policy applied when the thread-affinity guard detects a violation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuardPolicy {
    /// Panic with full context. Development posture; a violation is a
    /// caller bug and continuing risks silent corruption.
    #[default]
    Fatal,
    /// Log the violation and reject the mutation. Production
    /// degradation mode.
    Log,
}

/// Configuration consumed by the regionized core.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Target region ticks per second.
    pub tick_rate: u32,

    /// Power-of-two shift mapping world units to cells (a shift of 4
    /// groups 16 world units per cell edge).
    pub section_shift: u8,

    /// Split a region once it owns more than this many objects.
    /// Zero disables automatic splitting.
    pub split_threshold_objects: usize,

    /// Merge two adjacent regions when their combined object count
    /// falls below this. Zero disables automatic merging.
    pub merge_threshold_objects: usize,

    /// What to do when the thread-affinity guard fires.
    pub guard_policy: GuardPolicy,

    /// Quarantine an object after this many consecutive tick failures.
    pub quarantine_threshold: u32,

    /// Warn when an object stays in the pending-migration window for
    /// more than this many destination ticks.
    pub pending_migration_alert_ticks: u64,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            tick_rate: 20,
            section_shift: 4,
            split_threshold_objects: 0,
            merge_threshold_objects: 0,
            guard_policy: GuardPolicy::Fatal,
            quarantine_threshold: 3,
            pending_migration_alert_ticks: 1,
        }
    }
}

impl CoreConfig {
    /// Parses and validates a TOML configuration document.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] when the document fails to
    /// parse or a knob is out of range.
    pub fn from_toml_str(text: &str) -> CoreResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| CoreError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates knob ranges.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidConfig`] naming the offending knob.
    pub fn validate(&self) -> CoreResult<()> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(CoreError::InvalidConfig(format!(
                "tick_rate must be in 1..=1000, got {}",
                self.tick_rate
            )));
        }
        if self.section_shift > 16 {
            return Err(CoreError::InvalidConfig(format!(
                "section_shift must be at most 16, got {}",
                self.section_shift
            )));
        }
        if self.quarantine_threshold == 0 {
            return Err(CoreError::InvalidConfig(
                "quarantine_threshold must be at least 1".to_string(),
            ));
        }
        if self.split_threshold_objects != 0
            && self.merge_threshold_objects >= self.split_threshold_objects
        {
            return Err(CoreError::InvalidConfig(format!(
                "merge_threshold_objects ({}) must be below split_threshold_objects ({})",
                self.merge_threshold_objects, self.split_threshold_objects
            )));
        }
        Ok(())
    }

    /// Target duration of one region tick.
    #[must_use]
    pub fn tick_duration(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.tick_rate))
    }
}
