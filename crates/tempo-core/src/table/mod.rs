// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! Archetype row tables.
//!
//! One table stores one row schema: a dense array of blittable rows, an
//! identity indirection (stable raw id -> dense row), an optional spatial
//! index, and a command buffer for structural changes issued while systems
//! run.
//!
//! Invariants
//! - Iteration is always over `0..count`; rows are densely packed
//!   (swap-with-last on free).
//! - `stable_id_to_row[id] = r  =>  row_to_stable_id[r] = id`.
//! - Rows never hold pointers; cross-row references are [`Handle`]s.
//! - The spatial index is derived state, never snapshotted: structural
//!   changes, mutable row access, and restore flag it dirty, and the
//!   pipeline rebuilds flagged indices at the end of each tick.
//! - Structural changes while the table is locked for system execution are a
//!   fatal programming error (assertion carrying the frame number); systems
//!   enqueue into the command buffer instead.

mod spatial;

use std::any::Any;
use std::fmt::Write as _;

use bytemuck::{Pod, Zeroable};
use thiserror::Error;

use crate::ident::{Handle, IdentityAllocator, KindId, NO_ROW};
use crate::math::{Fixed, Fixed2};

pub use spatial::{GridSpec, QueryOutcome, SpatialSpec};
use spatial::SpatialIndex;

/// A blittable row schema.
///
/// Rows are `Pod`: every field is a fixed-size integer, a fixed-size inline
/// array, or another blittable struct. Snapshots copy rows with one memcpy.
pub trait Row: Pod + Zeroable + 'static {
    /// Table name; stable, used in schema digests and diagnostics.
    const NAME: &'static str;
    /// Schema identifier baked into handles of this table.
    const KIND: KindId;

    /// World position for spatially indexed tables.
    fn position(&self) -> Option<Fixed2> {
        None
    }

    /// Eviction key for LRU tables; the minimum-keyed row is evicted first.
    fn lru_key(&self) -> i64 {
        0
    }
}

/// Eviction policy when an allocation hits a full table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Eviction {
    /// Allocation fails with [`TableError::Full`].
    #[default]
    None,
    /// The row with the minimum [`Row::lru_key`] is evicted and its slot
    /// reused (ties break toward the lowest row index).
    Lru,
}

/// Failures surfaced by table operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TableError {
    /// The table is at capacity and has no eviction policy.
    #[error("table `{0}` is full")]
    Full(&'static str),
    /// The handle's generation no longer matches the live row.
    #[error("stale handle {0:?}")]
    Stale(Handle),
}

enum TableCommand<R> {
    Spawn(R),
    Despawn(Handle),
}

/// Archetype table with fixed capacity.
pub struct Table<R: Row> {
    capacity: usize,
    count: usize,
    rows: Vec<R>,
    /// Dense row -> stable raw id; `NO_ROW` beyond `count`.
    row_to_stable: Vec<i32>,
    ident: IdentityAllocator,
    spatial: Option<SpatialIndex>,
    spatial_dirty: bool,
    eviction: Eviction,
    commands: Vec<TableCommand<R>>,
    structural_lock: Option<u64>,
}

impl<R: Row> Table<R> {
    /// Construct an empty table.
    #[must_use]
    pub fn new(capacity: usize, spatial: Option<SpatialSpec>, eviction: Eviction) -> Self {
        Self {
            capacity,
            count: 0,
            rows: vec![R::zeroed(); capacity],
            row_to_stable: vec![NO_ROW; capacity],
            ident: IdentityAllocator::new(R::KIND, capacity),
            spatial: spatial.map(SpatialIndex::new),
            spatial_dirty: false,
            eviction,
            commands: Vec::new(),
            structural_lock: None,
        }
    }

    /// Table name (from the row schema).
    #[must_use]
    pub fn name(&self) -> &'static str {
        R::NAME
    }

    /// Live row count.
    #[must_use]
    pub fn count(&self) -> usize {
        self.count
    }

    /// Fixed capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn assert_unlocked(&self, op: &str) {
        assert!(
            self.structural_lock.is_none(),
            "{op} on `{}` during system execution at frame {:?}; enqueue a command instead",
            R::NAME,
            self.structural_lock
        );
    }

    /// Allocate a zeroed row.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Full`] at capacity unless the eviction policy
    /// is [`Eviction::Lru`].
    pub fn allocate(&mut self) -> Result<Handle, TableError> {
        self.assert_unlocked("allocate");
        if self.count == self.capacity {
            match self.eviction {
                Eviction::None => return Err(TableError::Full(R::NAME)),
                Eviction::Lru => self.evict_lru_min(),
            }
        }
        let row = self.count;
        let Some(handle) = self.ident.allocate(row_index(row)) else {
            return Err(TableError::Full(R::NAME));
        };
        self.rows[row] = R::zeroed();
        self.row_to_stable[row] = i32::try_from(handle.raw_id()).unwrap_or(NO_ROW);
        self.count += 1;
        self.spatial_dirty = true;
        Ok(handle)
    }

    /// Allocate and initialise a row in one step.
    ///
    /// # Errors
    ///
    /// Same as [`Table::allocate`].
    pub fn allocate_with(&mut self, row: R) -> Result<Handle, TableError> {
        let handle = self.allocate()?;
        if let Some(r) = self.ident.row_of(handle) {
            self.rows[r as usize] = row;
        }
        Ok(handle)
    }

    /// Evict the row with the minimum LRU key; ties break toward the lowest
    /// row index so the choice is deterministic.
    fn evict_lru_min(&mut self) {
        debug_assert!(self.count > 0);
        let mut victim = 0_usize;
        let mut best = self.rows[0].lru_key();
        for (r, row) in self.rows[..self.count].iter().enumerate().skip(1) {
            let key = row.lru_key();
            if key < best {
                best = key;
                victim = r;
            }
        }
        self.free_row(victim);
    }

    /// Free a live row.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Stale`] when the generation mismatches.
    pub fn free(&mut self, handle: Handle) -> Result<(), TableError> {
        self.assert_unlocked("free");
        let Some(row) = self.ident.row_of(handle) else {
            return Err(TableError::Stale(handle));
        };
        self.free_row(row as usize);
        Ok(())
    }

    /// Swap-with-last removal keeping rows densely packed.
    fn free_row(&mut self, row: usize) {
        debug_assert!(row < self.count);
        let raw = self.row_to_stable[row];
        if let Ok(raw_u) = u32::try_from(raw) {
            let _ = self.ident.free(self.ident.handle_for(raw_u));
        }
        let last = self.count - 1;
        if row != last {
            self.rows.swap(row, last);
            let moved = self.row_to_stable[last];
            self.row_to_stable[row] = moved;
            if let Ok(moved_u) = u32::try_from(moved) {
                self.ident.set_row(moved_u, row_index(row));
            }
        }
        self.rows[last] = R::zeroed();
        self.row_to_stable[last] = NO_ROW;
        self.count = last;
        self.spatial_dirty = true;
    }

    /// Shared reference to a live row.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Stale`] when the generation mismatches.
    pub fn get(&self, handle: Handle) -> Result<&R, TableError> {
        self.ident
            .row_of(handle)
            .map(|r| &self.rows[r as usize])
            .ok_or(TableError::Stale(handle))
    }

    /// Mutable reference to a live row. Flags the spatial index: a mutable
    /// borrow may move the row's position.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Stale`] when the generation mismatches.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut R, TableError> {
        match self.ident.row_of(handle) {
            Some(r) => {
                self.spatial_dirty = true;
                Ok(&mut self.rows[r as usize])
            }
            None => Err(TableError::Stale(handle)),
        }
    }

    /// Whether `handle` refers to a live row.
    #[must_use]
    pub fn is_alive(&self, handle: Handle) -> bool {
        self.ident.is_alive(handle)
    }

    /// Live handle for a dense row index.
    #[must_use]
    pub fn handle_at(&self, row: usize) -> Handle {
        debug_assert!(row < self.count);
        u32::try_from(self.row_to_stable[row])
            .map_or(Handle::INVALID, |raw| self.ident.handle_for(raw))
    }

    /// Dense rows `0..count`.
    #[must_use]
    pub fn rows(&self) -> &[R] {
        &self.rows[..self.count]
    }

    /// Mutable dense rows `0..count`. Field mutation only; structural
    /// changes go through the command buffer. Flags the spatial index: a
    /// mutable borrow may move row positions.
    pub fn rows_mut(&mut self) -> &mut [R] {
        self.spatial_dirty = true;
        &mut self.rows[..self.count]
    }

    // ── Command buffer ──────────────────────────────────────────

    /// Queue a spawn; applied at the next structural playback.
    pub fn queue_spawn(&mut self, row: R) {
        self.commands.push(TableCommand::Spawn(row));
    }

    /// Queue a despawn; applied at the next structural playback. A handle
    /// that is already dead by playback time is skipped.
    pub fn queue_despawn(&mut self, handle: Handle) {
        self.commands.push(TableCommand::Despawn(handle));
    }

    /// Drain the command buffer in FIFO order.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Full`] when a queued spawn overflows a
    /// non-LRU table.
    pub(crate) fn apply_commands(&mut self) -> Result<(), TableError> {
        let mut queue = std::mem::take(&mut self.commands);
        let mut result = Ok(());
        for cmd in queue.drain(..) {
            match cmd {
                TableCommand::Spawn(row) => {
                    if result.is_ok() {
                        result = self.allocate_with(row).map(|_| ());
                    }
                }
                TableCommand::Despawn(handle) => {
                    // Late despawns of already-dead rows are normal.
                    let _ = self.free(handle);
                }
            }
        }
        self.commands = queue;
        result
    }

    // ── Spatial queries ─────────────────────────────────────────

    /// Rebuild the spatial index from current row positions. The pipeline
    /// invokes this at the end of a tick for tables whose dirty flag is
    /// set; no-op for non-spatial tables.
    pub fn rebuild_spatial_index(&mut self) {
        let Some(index) = self.spatial.as_mut() else {
            self.spatial_dirty = false;
            return;
        };
        index.clear();
        for (r, row) in self.rows[..self.count].iter().enumerate() {
            if let Some(pos) = row.position() {
                index.insert(row_index(r), pos);
            }
        }
        self.spatial_dirty = false;
    }

    /// Whether the index lags the rows (rebuild pending). Set by structural
    /// changes, mutable row access, and snapshot restore; the pipeline
    /// rebuilds exactly the flagged tables at the end of each tick.
    #[must_use]
    pub fn spatial_is_dirty(&self) -> bool {
        self.spatial_dirty
    }

    /// Rows within `radius` of `centre` (inclusive boundary), written into
    /// `out` as dense row indices in ascending cell-then-row order.
    ///
    /// Non-spatial tables fall back to a `0..count` scan, which honours the
    /// same ordering contract trivially.
    pub fn query_radius(&self, centre: Fixed2, radius: Fixed, out: &mut [u32]) -> QueryOutcome {
        let r = radius.abs();
        let min = Fixed2::new(centre.x - r, centre.y - r);
        let max = Fixed2::new(centre.x + r, centre.y + r);
        let rr = i128::from(r.raw()) * i128::from(r.raw());
        self.query_filtered(min, max, out, |pos| {
            let dx = i128::from(pos.x.raw()) - i128::from(centre.x.raw());
            let dy = i128::from(pos.y.raw()) - i128::from(centre.y.raw());
            dx * dx + dy * dy <= rr
        })
    }

    /// Rows inside the inclusive axis-aligned box `[min, max]`, written into
    /// `out` as dense row indices in ascending cell-then-row order.
    pub fn query_aabb(&self, min: Fixed2, max: Fixed2, out: &mut [u32]) -> QueryOutcome {
        self.query_filtered(min, max, out, |pos| {
            pos.x >= min.x && pos.x <= max.x && pos.y >= min.y && pos.y <= max.y
        })
    }

    fn query_filtered(
        &self,
        min: Fixed2,
        max: Fixed2,
        out: &mut [u32],
        accept: impl Fn(Fixed2) -> bool,
    ) -> QueryOutcome {
        let mut written = 0_usize;
        let mut truncated = false;
        let mut take = |row: u32| -> bool {
            // Stale bucket entries may point past the dense range between a
            // structural playback and the next rebuild; skip them.
            let idx = row as usize;
            if idx >= self.count {
                return true;
            }
            let Some(pos) = self.rows[idx].position() else {
                return true;
            };
            if !accept(pos) {
                return true;
            }
            if written == out.len() {
                truncated = true;
                return false;
            }
            out[written] = row;
            written += 1;
            true
        };
        if let Some(index) = self.spatial.as_ref() {
            index.for_each_candidate(min, max, &mut take);
        } else {
            for r in 0..self.count {
                if !take(row_index(r)) {
                    break;
                }
            }
        }
        QueryOutcome {
            count: written,
            truncated,
        }
    }

    // ── Reset ───────────────────────────────────────────────────

    /// Clear all rows, rebuild the free list, bump every generation.
    pub fn reset(&mut self) {
        self.assert_unlocked("reset");
        for row in &mut self.rows {
            *row = R::zeroed();
        }
        for slot in &mut self.row_to_stable {
            *slot = NO_ROW;
        }
        self.count = 0;
        self.ident.reset();
        self.commands.clear();
        if let Some(index) = self.spatial.as_mut() {
            index.clear();
        }
        self.spatial_dirty = false;
    }

    // ── Snapshot plumbing ───────────────────────────────────────

    fn meta_len(&self) -> usize {
        4 + self.capacity * 4 + self.ident.meta_len()
    }

    fn write_meta(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&u32::try_from(self.count).unwrap_or(0).to_le_bytes());
        for v in &self.row_to_stable {
            out.extend_from_slice(&v.to_le_bytes());
        }
        self.ident.write_meta(out);
    }

    fn read_meta(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() < self.meta_len() {
            return false;
        }
        let count = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
        if count > self.capacity {
            return false;
        }
        self.count = count;
        let mut at = 4_usize;
        for slot in &mut self.row_to_stable {
            *slot = i32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]]);
            at += 4;
        }
        self.ident.read_meta(&bytes[at..]).is_some()
    }

    fn slab(&self) -> &[u8] {
        bytemuck::cast_slice(&self.rows[..self.count])
    }

    fn restore_slab(&mut self, bytes: &[u8]) -> bool {
        let expect = self.count * core::mem::size_of::<R>();
        if bytes.len() != expect {
            return false;
        }
        bytemuck::cast_slice_mut(&mut self.rows[..self.count]).copy_from_slice(bytes);
        // Rows past `count` may hold stale bytes from a longer previous
        // timeline; zero them so state is byte-identical to a fresh run.
        for row in &mut self.rows[self.count..] {
            *row = R::zeroed();
        }
        self.spatial_dirty = true;
        true
    }
}

fn row_index(row: usize) -> u32 {
    u32::try_from(row).unwrap_or(u32::MAX)
}

// ── Type-erased table access for the world registry ─────────────

/// Object-safe surface the world, snapshot codec, hasher, and exporter use.
pub(crate) trait AnyTable {
    fn name(&self) -> &'static str;
    fn kind(&self) -> KindId;
    fn row_size(&self) -> usize;
    fn capacity(&self) -> usize;
    fn count(&self) -> usize;
    fn meta_len(&self) -> usize;
    fn write_meta(&self, out: &mut Vec<u8>);
    fn read_meta(&mut self, bytes: &[u8]) -> bool;
    fn slab(&self) -> &[u8];
    fn restore_slab(&mut self, bytes: &[u8]) -> bool;
    fn apply_commands(&mut self) -> Result<(), TableError>;
    fn rebuild_spatial_index(&mut self);
    fn spatial_is_dirty(&self) -> bool;
    fn mark_spatial_dirty(&mut self);
    fn set_structural_lock(&mut self, frame: Option<u64>);
    fn reset(&mut self);
    /// Allocate row 0 of a capacity-1 table if it is empty (singleton
    /// auto-allocation at world construction and after reset).
    fn ensure_singleton(&mut self);
    fn dump_json(&self, out: &mut String);
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<R: Row> AnyTable for Table<R> {
    fn name(&self) -> &'static str {
        R::NAME
    }

    fn kind(&self) -> KindId {
        R::KIND
    }

    fn row_size(&self) -> usize {
        core::mem::size_of::<R>()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn count(&self) -> usize {
        self.count
    }

    fn meta_len(&self) -> usize {
        Table::meta_len(self)
    }

    fn write_meta(&self, out: &mut Vec<u8>) {
        Table::write_meta(self, out);
    }

    fn read_meta(&mut self, bytes: &[u8]) -> bool {
        Table::read_meta(self, bytes)
    }

    fn slab(&self) -> &[u8] {
        Table::slab(self)
    }

    fn restore_slab(&mut self, bytes: &[u8]) -> bool {
        Table::restore_slab(self, bytes)
    }

    fn apply_commands(&mut self) -> Result<(), TableError> {
        Table::apply_commands(self)
    }

    fn rebuild_spatial_index(&mut self) {
        Table::rebuild_spatial_index(self);
    }

    fn spatial_is_dirty(&self) -> bool {
        Table::spatial_is_dirty(self)
    }

    fn mark_spatial_dirty(&mut self) {
        self.spatial_dirty = true;
    }

    fn set_structural_lock(&mut self, frame: Option<u64>) {
        self.structural_lock = frame;
    }

    fn reset(&mut self) {
        Table::reset(self);
    }

    fn ensure_singleton(&mut self) {
        debug_assert_eq!(self.capacity, 1, "`{}` is not a singleton", R::NAME);
        if self.count == 0 {
            // A fresh capacity-1 table cannot be full.
            let _ = self.allocate();
        }
    }

    fn dump_json(&self, out: &mut String) {
        let _ = write!(
            out,
            r#"{{"kind":"table","name":"{}","count":{},"capacity":{},"rows":["#,
            R::NAME,
            self.count,
            self.capacity
        );
        for r in 0..self.count {
            if r > 0 {
                out.push(',');
            }
            let handle = self.handle_at(r);
            let _ = write!(
                out,
                r#"{{"row":{},"raw_id":{},"generation":{},"bytes":"{}"}}"#,
                r,
                handle.raw_id(),
                handle.generation(),
                hex::encode(bytemuck::bytes_of(&self.rows[r]))
            );
        }
        out.push_str("]}");
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Probe {
        pos: Fixed2,
        stamp: i64,
    }

    impl Row for Probe {
        const NAME: &'static str = "probe";
        const KIND: KindId = 90;

        fn position(&self) -> Option<Fixed2> {
            Some(self.pos)
        }

        fn lru_key(&self) -> i64 {
            self.stamp
        }
    }

    fn probe(x: i64, y: i64, stamp: i64) -> Probe {
        Probe {
            pos: Fixed2::from_ints(x, y),
            stamp,
        }
    }

    fn plain_table(capacity: usize) -> Table<Probe> {
        Table::new(capacity, None, Eviction::None)
    }

    #[test]
    fn bijection_holds_after_free_and_swap() {
        let mut t = plain_table(8);
        let mut handles = Vec::new();
        for i in 0..5 {
            match t.allocate_with(probe(i, i, i)) {
                Ok(h) => handles.push(h),
                Err(e) => unreachable!("allocate failed: {e}"),
            }
        }
        assert!(t.free(handles[1]).is_ok());
        assert_eq!(t.count(), 4);

        // Every dense row maps back to itself through the handle.
        for r in 0..t.count() {
            let h = t.handle_at(r);
            match t.get(h) {
                Ok(_) => {}
                Err(e) => unreachable!("row {r} unreachable through its handle: {e}"),
            }
        }
        // The freed handle is stale; the swapped survivor is intact.
        assert_eq!(t.get(handles[1]), Err(TableError::Stale(handles[1])));
        assert_eq!(t.get(handles[4]).map(|p| p.stamp), Ok(4));
    }

    #[test]
    fn full_table_without_eviction_fails() {
        let mut t = plain_table(2);
        assert!(t.allocate().is_ok());
        assert!(t.allocate().is_ok());
        assert_eq!(t.allocate(), Err(TableError::Full("probe")));
    }

    #[test]
    fn lru_eviction_removes_minimum_key() {
        let mut t: Table<Probe> = Table::new(3, None, Eviction::Lru);
        let old = t.allocate_with(probe(0, 0, 10));
        assert!(t.allocate_with(probe(1, 1, 30)).is_ok());
        assert!(t.allocate_with(probe(2, 2, 20)).is_ok());

        // Full; the stamp-10 row must be evicted.
        assert!(t.allocate_with(probe(3, 3, 40)).is_ok());
        assert_eq!(t.count(), 3);
        if let Ok(h) = old {
            assert!(!t.is_alive(h), "oldest row should have been evicted");
        }
    }

    #[test]
    fn reuse_bumps_generation_and_stales_old_handle() {
        let mut t = plain_table(4);
        let Ok(first) = t.allocate_with(probe(0, 0, 0)) else {
            unreachable!("allocate failed")
        };
        assert!(t.free(first).is_ok());
        let Ok(second) = t.allocate_with(probe(1, 1, 1)) else {
            unreachable!("allocate failed")
        };
        assert_eq!(first.raw_id(), second.raw_id());
        assert_ne!(first.generation(), second.generation());
        assert_eq!(t.get(first), Err(TableError::Stale(first)));
    }

    #[test]
    fn commands_defer_until_playback() {
        let mut t = plain_table(4);
        t.queue_spawn(probe(1, 1, 1));
        t.queue_spawn(probe(2, 2, 2));
        assert_eq!(t.count(), 0, "spawns are deferred");
        assert!(t.apply_commands().is_ok());
        assert_eq!(t.count(), 2);

        let doomed = t.handle_at(0);
        t.queue_despawn(doomed);
        // Double despawn is tolerated.
        t.queue_despawn(doomed);
        assert!(t.apply_commands().is_ok());
        assert_eq!(t.count(), 1);
    }

    #[test]
    fn queued_spawn_overflow_is_reported() {
        let mut t = plain_table(1);
        t.queue_spawn(probe(1, 1, 1));
        t.queue_spawn(probe(2, 2, 2));
        assert_eq!(t.apply_commands(), Err(TableError::Full("probe")));
    }

    #[test]
    #[should_panic(expected = "during system execution")]
    fn structural_change_under_lock_is_fatal() {
        let mut t = plain_table(4);
        AnyTable::set_structural_lock(&mut t, Some(17));
        let _ = t.allocate();
    }

    #[test]
    fn dirty_flag_tracks_mutation_and_rebuild() {
        let spec = SpatialSpec::Single(GridSpec {
            cell_size: Fixed::from_int(4),
            grid_size: 16,
        });
        let mut t: Table<Probe> = Table::new(8, Some(spec), Eviction::None);
        let handle = match t.allocate_with(probe(1, 1, 0)) {
            Ok(h) => h,
            Err(e) => unreachable!("allocate failed: {e}"),
        };
        assert!(t.spatial_is_dirty(), "allocation must flag the index");
        t.rebuild_spatial_index();
        assert!(!t.spatial_is_dirty(), "rebuild must clear the flag");

        let _ = t.rows_mut();
        assert!(t.spatial_is_dirty(), "mutable row access must flag");
        t.rebuild_spatial_index();

        assert!(t.get_mut(handle).is_ok());
        assert!(t.spatial_is_dirty(), "mutable lookup must flag");
        t.rebuild_spatial_index();

        assert!(t.get(handle).is_ok());
        assert!(!t.spatial_is_dirty(), "shared access must not flag");

        assert!(t.free(handle).is_ok());
        assert!(t.spatial_is_dirty(), "free must flag the index");
    }

    #[test]
    fn restored_slab_flags_the_index() {
        let spec = SpatialSpec::Single(GridSpec {
            cell_size: Fixed::from_int(4),
            grid_size: 16,
        });
        let mut t: Table<Probe> = Table::new(8, Some(spec), Eviction::None);
        assert!(t.allocate_with(probe(2, 2, 0)).is_ok());
        t.rebuild_spatial_index();

        let mut meta = Vec::new();
        Table::write_meta(&t, &mut meta);
        let slab = Table::slab(&t).to_vec();
        assert!(Table::read_meta(&mut t, &meta));
        assert!(Table::restore_slab(&mut t, &slab));
        assert!(t.spatial_is_dirty(), "restore must flag the index");
    }

    #[test]
    fn radius_query_is_exact_and_ordered() {
        let spec = SpatialSpec::Single(GridSpec {
            cell_size: Fixed::from_int(4),
            grid_size: 32,
        });
        let mut t: Table<Probe> = Table::new(64, Some(spec), Eviction::None);
        for i in 0..16 {
            assert!(t.allocate_with(probe(i, 0, i)).is_ok());
        }
        t.rebuild_spatial_index();

        let mut out = [0_u32; 64];
        let got = t.query_radius(Fixed2::from_ints(0, 0), Fixed::from_int(5), &mut out);
        assert!(!got.truncated);
        // Exactly x in 0..=5 pass the precise test.
        let rows: Vec<u32> = out[..got.count].to_vec();
        assert_eq!(rows, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn radius_query_truncates_into_small_span() {
        let mut t = plain_table(16);
        for i in 0..8 {
            assert!(t.allocate_with(probe(0, i, i)).is_ok());
        }
        let mut out = [0_u32; 3];
        let got = t.query_radius(Fixed2::from_ints(0, 0), Fixed::from_int(100), &mut out);
        assert_eq!(got.count, 3);
        assert!(got.truncated);
    }

    #[test]
    fn aabb_query_bounds_are_inclusive() {
        let mut t = plain_table(8);
        assert!(t.allocate_with(probe(2, 2, 0)).is_ok());
        assert!(t.allocate_with(probe(3, 2, 1)).is_ok());
        let mut out = [0_u32; 8];
        let got = t.query_aabb(
            Fixed2::from_ints(0, 0),
            Fixed2::from_ints(2, 2),
            &mut out,
        );
        assert_eq!(got.count, 1);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn meta_and_slab_round_trip() {
        let mut t = plain_table(8);
        for i in 0..3 {
            assert!(t.allocate_with(probe(i, -i, i)).is_ok());
        }
        let h = t.handle_at(1);
        assert!(t.free(h).is_ok());

        let mut meta = Vec::new();
        Table::write_meta(&t, &mut meta);
        let slab = Table::slab(&t).to_vec();

        let mut fresh = plain_table(8);
        assert!(Table::read_meta(&mut fresh, &meta));
        assert!(Table::restore_slab(&mut fresh, &slab));

        let mut meta2 = Vec::new();
        Table::write_meta(&fresh, &mut meta2);
        assert_eq!(meta, meta2);
        assert_eq!(Table::slab(&fresh), &slab[..]);
    }

    #[test]
    fn reset_stales_every_handle() {
        let mut t = plain_table(4);
        let handles: Vec<Handle> = (0..3)
            .filter_map(|i| t.allocate_with(probe(i, i, i)).ok())
            .collect();
        assert_eq!(handles.len(), 3);
        t.reset();
        assert_eq!(t.count(), 0);
        for h in handles {
            assert!(!t.is_alive(h));
        }
    }
}
