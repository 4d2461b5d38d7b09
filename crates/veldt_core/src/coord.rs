//! # Cell Coordinates
//!
//! The world is partitioned into an integer grid of cells on the X/Z
//! plane. A cell is the unit of ownership: the directory maps each
//! claimed cell to exactly one region. Continuous world positions map
//! to cells through a power-of-two section shift.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A cell coordinate on the world grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CellPos {
    /// Cell X coordinate.
    pub x: i32,
    /// Cell Z coordinate.
    pub z: i32,
}

impl CellPos {
    /// Creates a cell position.
    #[inline]
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }

    /// Maps a continuous world position to its cell, given the
    /// configured section shift.
    #[inline]
    #[must_use]
    pub fn from_world(wx: f64, wz: f64, section_shift: u8) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        Self {
            x: (wx.floor() as i32) >> section_shift,
            z: (wz.floor() as i32) >> section_shift,
        }
    }

    /// Returns the cell offset by `(dx, dz)`.
    #[inline]
    #[must_use]
    pub const fn offset(self, dx: i32, dz: i32) -> Self {
        Self {
            x: self.x + dx,
            z: self.z + dz,
        }
    }

    /// Returns true if `other` shares an edge with this cell.
    #[inline]
    #[must_use]
    pub const fn is_adjacent(self, other: Self) -> bool {
        let dx = (self.x - other.x).abs();
        let dz = (self.z - other.z).abs();
        dx + dz == 1
    }
}

impl fmt::Display for CellPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.z)
    }
}

/// An inclusive rectangle of cells, used to describe initial region
/// bounds and split requests. Regions themselves track arbitrary
/// (possibly non-rectangular) cell sets; bounds are a convenience for
/// callers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellBounds {
    /// Minimum corner (inclusive).
    pub min: CellPos,
    /// Maximum corner (inclusive).
    pub max: CellPos,
}

impl CellBounds {
    /// Creates bounds from two corners. The corners are normalized so
    /// callers may pass them in either order.
    #[must_use]
    pub fn new(a: CellPos, b: CellPos) -> Self {
        Self {
            min: CellPos::new(a.x.min(b.x), a.z.min(b.z)),
            max: CellPos::new(a.x.max(b.x), a.z.max(b.z)),
        }
    }

    /// Returns true if the cell lies inside these bounds.
    #[inline]
    #[must_use]
    pub const fn contains(&self, cell: CellPos) -> bool {
        cell.x >= self.min.x && cell.x <= self.max.x && cell.z >= self.min.z && cell.z <= self.max.z
    }

    /// Number of cells covered.
    #[must_use]
    pub const fn cell_count(&self) -> u64 {
        let w = (self.max.x - self.min.x + 1) as u64;
        let h = (self.max.z - self.min.z + 1) as u64;
        w * h
    }

    /// Iterates every cell inside the bounds, row by row.
    pub fn cells(&self) -> impl Iterator<Item = CellPos> + '_ {
        let min = self.min;
        let max = self.max;
        (min.z..=max.z).flat_map(move |z| (min.x..=max.x).map(move |x| CellPos::new(x, z)))
    }
}

impl fmt::Display for CellBounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{}]", self.min, self.max)
    }
}
