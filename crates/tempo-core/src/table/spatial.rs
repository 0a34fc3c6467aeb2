// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Spatial partitioning for row tables.
//!
//! Two layouts share one query contract:
//! - [`SpatialIndex::Single`]: one `grid_size x grid_size` grid of
//!   `cell_size` world units per cell, centred on the origin. Positions
//!   outside the covered square clamp to the border cells so the ordering
//!   stays total.
//! - [`SpatialIndex::Chunked`]: an origin-centred infinite plane tiled by
//!   chunks of `grid_size` cells per side, each chunk holding its own grid.
//!   Chunks live in a `BTreeMap` keyed by chunk coordinate — deterministic
//!   iteration is the point, never use a hash map here.
//!
//! Buckets store **row indices**, not handles: indices are stable only
//! within a frame, and the index is rebuilt once per frame after movement.
//! Cell addressing is integer floor division of raw Q32.32 coordinates;
//! no float cast anywhere.
//!
//! Query visit order is part of the determinism contract: ascending global
//! cell coordinate (row-major, `y` outer), then ascending row index within a
//! cell. Buckets are filled by a `0..count` scan, so they are ascending by
//! construction.

use std::collections::BTreeMap;

use crate::math::{Fixed, Fixed2};

/// Shared grid dimensions for both spatial layouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSpec {
    /// World units per cell (Q32.32).
    pub cell_size: Fixed,
    /// Cells per grid side.
    pub grid_size: u32,
}

/// Spatial layout selection for a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpatialSpec {
    /// One origin-centred grid; out-of-range positions clamp to the border.
    Single(GridSpec),
    /// Infinite plane of per-chunk grids.
    Chunked(GridSpec),
}

/// Result of a spatial query into a caller-provided span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryOutcome {
    /// Number of row indices written.
    pub count: usize,
    /// True when the span filled before every match was written.
    pub truncated: bool,
}

pub(crate) enum SpatialIndex {
    Single(SingleGrid),
    Chunked(ChunkedGrid),
}

impl SpatialIndex {
    pub(crate) fn new(spec: SpatialSpec) -> Self {
        match spec {
            SpatialSpec::Single(g) => Self::Single(SingleGrid::new(g)),
            SpatialSpec::Chunked(g) => Self::Chunked(ChunkedGrid::new(g)),
        }
    }

    pub(crate) fn clear(&mut self) {
        match self {
            Self::Single(g) => g.clear(),
            Self::Chunked(g) => g.clear(),
        }
    }

    pub(crate) fn insert(&mut self, row: u32, pos: Fixed2) {
        match self {
            Self::Single(g) => g.insert(row, pos),
            Self::Chunked(g) => g.insert(row, pos),
        }
    }

    /// Visits every candidate row in cells overlapping the world-space AABB,
    /// in the canonical cell-then-row order. The callback returns `false` to
    /// stop early (span exhausted).
    pub(crate) fn for_each_candidate(
        &self,
        min: Fixed2,
        max: Fixed2,
        mut visit: impl FnMut(u32) -> bool,
    ) {
        match self {
            Self::Single(g) => g.for_each_candidate(min, max, &mut visit),
            Self::Chunked(g) => g.for_each_candidate(min, max, &mut visit),
        }
    }
}

/// Integer floor of `raw / cell` over raw Q32.32 coordinates.
fn cell_coord(raw: i64, cell: i64) -> i64 {
    debug_assert!(cell > 0, "cell_size must be positive");
    raw.div_euclid(cell)
}

// ── Single grid ─────────────────────────────────────────────────

pub(crate) struct SingleGrid {
    spec: GridSpec,
    /// `grid_size * grid_size` buckets, row-major.
    cells: Vec<Vec<u32>>,
}

impl SingleGrid {
    fn new(spec: GridSpec) -> Self {
        let n = spec.grid_size as usize * spec.grid_size as usize;
        Self {
            spec,
            cells: vec![Vec::new(); n],
        }
    }

    fn clear(&mut self) {
        for bucket in &mut self.cells {
            bucket.clear();
        }
    }

    /// Grid coordinate for one axis, offset so the grid is origin-centred,
    /// clamped into `0..grid_size`.
    fn axis_cell(&self, raw: i64) -> i64 {
        let half = i64::from(self.spec.grid_size / 2);
        let c = cell_coord(raw, self.spec.cell_size.raw()) + half;
        c.clamp(0, i64::from(self.spec.grid_size) - 1)
    }

    fn bucket_index(&self, pos: Fixed2) -> usize {
        let cx = self.axis_cell(pos.x.raw());
        let cy = self.axis_cell(pos.y.raw());
        usize::try_from(cy * i64::from(self.spec.grid_size) + cx).unwrap_or(0)
    }

    fn insert(&mut self, row: u32, pos: Fixed2) {
        let at = self.bucket_index(pos);
        self.cells[at].push(row);
    }

    fn for_each_candidate(&self, min: Fixed2, max: Fixed2, visit: &mut impl FnMut(u32) -> bool) {
        let x0 = self.axis_cell(min.x.raw());
        let x1 = self.axis_cell(max.x.raw());
        let y0 = self.axis_cell(min.y.raw());
        let y1 = self.axis_cell(max.y.raw());
        for cy in y0..=y1 {
            for cx in x0..=x1 {
                let at = usize::try_from(cy * i64::from(self.spec.grid_size) + cx).unwrap_or(0);
                for &row in &self.cells[at] {
                    if !visit(row) {
                        return;
                    }
                }
            }
        }
    }
}

// ── Chunked grid ────────────────────────────────────────────────

pub(crate) struct ChunkedGrid {
    spec: GridSpec,
    /// Chunk coordinate -> per-chunk buckets (`grid_size^2`, row-major).
    /// Bucket vectors persist across rebuilds to keep their capacity.
    chunks: BTreeMap<(i64, i64), Vec<Vec<u32>>>,
}

impl ChunkedGrid {
    fn new(spec: GridSpec) -> Self {
        Self {
            spec,
            chunks: BTreeMap::new(),
        }
    }

    fn clear(&mut self) {
        for buckets in self.chunks.values_mut() {
            for bucket in buckets {
                bucket.clear();
            }
        }
    }

    /// Splits a global cell coordinate into `(chunk, cell-in-chunk)`.
    fn split(&self, global_cell: i64) -> (i64, i64) {
        let side = i64::from(self.spec.grid_size);
        (global_cell.div_euclid(side), global_cell.rem_euclid(side))
    }

    fn insert(&mut self, row: u32, pos: Fixed2) {
        let cell = self.spec.cell_size.raw();
        let (chunk_x, in_x) = self.split(cell_coord(pos.x.raw(), cell));
        let (chunk_y, in_y) = self.split(cell_coord(pos.y.raw(), cell));
        let side = self.spec.grid_size as usize;
        let buckets = self
            .chunks
            .entry((chunk_y, chunk_x))
            .or_insert_with(|| vec![Vec::new(); side * side]);
        let at = usize::try_from(in_y).unwrap_or(0) * side + usize::try_from(in_x).unwrap_or(0);
        buckets[at].push(row);
    }

    fn for_each_candidate(&self, min: Fixed2, max: Fixed2, visit: &mut impl FnMut(u32) -> bool) {
        let cell = self.spec.cell_size.raw();
        let x0 = cell_coord(min.x.raw(), cell);
        let x1 = cell_coord(max.x.raw(), cell);
        let y0 = cell_coord(min.y.raw(), cell);
        let y1 = cell_coord(max.y.raw(), cell);
        let side = i64::from(self.spec.grid_size);
        for gy in y0..=y1 {
            let (chunk_y, in_y) = (gy.div_euclid(side), gy.rem_euclid(side));
            for gx in x0..=x1 {
                let (chunk_x, in_x) = (gx.div_euclid(side), gx.rem_euclid(side));
                let Some(buckets) = self.chunks.get(&(chunk_y, chunk_x)) else {
                    continue;
                };
                let at = usize::try_from(in_y).unwrap_or(0) * side as usize
                    + usize::try_from(in_x).unwrap_or(0);
                for &row in &buckets[at] {
                    if !visit(row) {
                        return;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> GridSpec {
        GridSpec {
            cell_size: Fixed::from_int(8),
            grid_size: 16,
        }
    }

    fn collect(index: &SpatialIndex, min: Fixed2, max: Fixed2) -> Vec<u32> {
        let mut out = Vec::new();
        index.for_each_candidate(min, max, |row| {
            out.push(row);
            true
        });
        out
    }

    #[test]
    fn single_grid_buckets_by_floor_division() {
        let mut index = SpatialIndex::new(SpatialSpec::Single(spec()));
        index.insert(0, Fixed2::from_ints(1, 1));
        index.insert(1, Fixed2::from_ints(-1, -1));
        // Distinct cells: floor(1/8) = 0 vs floor(-1/8) = -1.
        let near_origin = collect(
            &index,
            Fixed2::from_ints(0, 0),
            Fixed2::from_ints(0, 0),
        );
        assert_eq!(near_origin, vec![0]);
    }

    #[test]
    fn single_grid_clamps_out_of_range() {
        let mut index = SpatialIndex::new(SpatialSpec::Single(spec()));
        // Far outside the covered square; must land in a border cell rather
        // than being dropped.
        index.insert(7, Fixed2::from_ints(10_000, 10_000));
        let all = collect(
            &index,
            Fixed2::from_ints(-10_000, -10_000),
            Fixed2::from_ints(10_000, 10_000),
        );
        assert_eq!(all, vec![7]);
    }

    #[test]
    fn chunked_grid_spans_negative_plane() {
        let mut index = SpatialIndex::new(SpatialSpec::Chunked(spec()));
        index.insert(0, Fixed2::from_ints(-500, -500));
        index.insert(1, Fixed2::from_ints(500, 500));
        let all = collect(
            &index,
            Fixed2::from_ints(-512, -512),
            Fixed2::from_ints(512, 512),
        );
        assert_eq!(all, vec![0, 1], "row-major order across chunks");
    }

    #[test]
    fn candidate_order_is_cell_major_then_row() {
        let mut index = SpatialIndex::new(SpatialSpec::Single(spec()));
        // Same cell: insertion order (ascending rows by construction).
        index.insert(2, Fixed2::from_ints(1, 1));
        index.insert(5, Fixed2::from_ints(2, 2));
        // Earlier cell in y: must come first despite later insertion.
        index.insert(9, Fixed2::from_ints(1, -9));
        let all = collect(
            &index,
            Fixed2::from_ints(-16, -16),
            Fixed2::from_ints(16, 16),
        );
        assert_eq!(all, vec![9, 2, 5]);
    }

    #[test]
    fn clear_retains_no_candidates() {
        let mut index = SpatialIndex::new(SpatialSpec::Chunked(spec()));
        index.insert(0, Fixed2::from_ints(3, 3));
        index.clear();
        let all = collect(
            &index,
            Fixed2::from_ints(-64, -64),
            Fixed2::from_ints(64, 64),
        );
        assert!(all.is_empty());
    }
}
