// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! World container: an ordered, statically known set of tables plus
//! singleton rows.
//!
//! Registration order is the declared table order used by the snapshot
//! codec and the frame hash; it is a `Vec`, never a hash container, so
//! iteration is deterministic by construction. Singletons are capacity-1
//! tables auto-allocated at build time with zeroed rows.

use std::marker::PhantomData;

use crate::table::{AnyTable, Eviction, Row, SpatialSpec, Table, TableError};

/// Typed token for a registered table; cheap to copy into systems.
#[derive(Clone, Copy)]
pub struct TableKey<R: Row> {
    index: usize,
    _marker: PhantomData<fn() -> R>,
}

impl<R: Row> core::fmt::Debug for TableKey<R> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TableKey({}#{})", R::NAME, self.index)
    }
}

/// Builder for the declared table set.
#[derive(Default)]
pub struct WorldBuilder {
    tables: Vec<Box<dyn AnyTable>>,
    singletons: Vec<usize>,
}

impl WorldBuilder {
    /// Start an empty declaration.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Vec::new(),
            singletons: Vec::new(),
        }
    }

    /// Register a table for `R`. Each row type registers at most once; the
    /// declared order is the registration order.
    pub fn register<R: Row>(
        &mut self,
        capacity: usize,
        spatial: Option<SpatialSpec>,
        eviction: Eviction,
    ) -> TableKey<R> {
        self.assert_fresh::<R>();
        let index = self.tables.len();
        self.tables
            .push(Box::new(Table::<R>::new(capacity, spatial, eviction)));
        TableKey {
            index,
            _marker: PhantomData,
        }
    }

    /// Register a singleton table for `R`: capacity 1, auto-allocated with a
    /// zeroed row when the world is built.
    pub fn register_singleton<R: Row>(&mut self) -> TableKey<R> {
        let key = self.register::<R>(1, None, Eviction::None);
        self.singletons.push(key.index);
        key
    }

    fn assert_fresh<R: Row>(&self) {
        assert!(
            !self.tables.iter().any(|t| t.name() == R::NAME || t.kind() == R::KIND),
            "duplicate table registration for `{}` (kind {})",
            R::NAME,
            R::KIND
        );
    }

    /// Finalise the declaration into a world at frame zero.
    #[must_use]
    pub fn build(self) -> World {
        let mut world = World {
            tables: self.tables,
            singleton_indices: self.singletons,
            current_frame: 0,
            schema_digest: 0,
        };
        world.schema_digest = world.compute_schema_digest();
        for index in world.singleton_indices.clone() {
            world.allocate_singleton(index);
        }
        world
    }
}

/// The authoritative simulation state.
pub struct World {
    tables: Vec<Box<dyn AnyTable>>,
    singleton_indices: Vec<usize>,
    current_frame: u64,
    schema_digest: u32,
}

impl World {
    fn allocate_singleton(&mut self, index: usize) {
        self.tables[index].ensure_singleton();
    }

    fn position_of<R: Row>(&self) -> usize {
        self.tables
            .iter()
            .position(|t| t.as_any().is::<Table<R>>())
            .map_or_else(
                || unreachable!("table `{}` was never registered", R::NAME),
                |i| i,
            )
    }

    /// Shared access to the table registered for `R`.
    ///
    /// The scan over the declared list is linear; table counts are small and
    /// fixed, and the order is deterministic.
    #[must_use]
    pub fn table<R: Row>(&self) -> &Table<R> {
        let index = self.position_of::<R>();
        self.tables[index]
            .as_any()
            .downcast_ref::<Table<R>>()
            .map_or_else(|| unreachable!("table registry corrupted"), |t| t)
    }

    /// Mutable access to the table registered for `R`.
    pub fn table_mut<R: Row>(&mut self) -> &mut Table<R> {
        let index = self.position_of::<R>();
        self.tables[index]
            .as_any_mut()
            .downcast_mut::<Table<R>>()
            .map_or_else(|| unreachable!("table registry corrupted"), |t| t)
    }

    /// Shared access through a typed key (no scan).
    #[must_use]
    pub fn table_by_key<R: Row>(&self, key: TableKey<R>) -> &Table<R> {
        self.tables[key.index]
            .as_any()
            .downcast_ref::<Table<R>>()
            .map_or_else(|| unreachable!("table key/type mismatch"), |t| t)
    }

    /// Mutable access through a typed key (no scan).
    pub fn table_by_key_mut<R: Row>(&mut self, key: TableKey<R>) -> &mut Table<R> {
        self.tables[key.index]
            .as_any_mut()
            .downcast_mut::<Table<R>>()
            .map_or_else(|| unreachable!("table key/type mismatch"), |t| t)
    }

    /// The singleton row for `R`.
    #[must_use]
    pub fn singleton<R: Row>(&self) -> &R {
        let table = self.table::<R>();
        debug_assert_eq!(table.capacity(), 1, "`{}` is not a singleton", R::NAME);
        &table.rows()[0]
    }

    /// Mutable singleton row for `R`.
    pub fn singleton_mut<R: Row>(&mut self) -> &mut R {
        let table = self.table_mut::<R>();
        debug_assert_eq!(table.capacity(), 1, "`{}` is not a singleton", R::NAME);
        &mut table.rows_mut()[0]
    }

    /// Frame about to be executed (0 before the first tick).
    #[must_use]
    pub fn current_frame(&self) -> u64 {
        self.current_frame
    }

    pub(crate) fn set_current_frame(&mut self, frame: u64) {
        self.current_frame = frame;
    }

    pub(crate) fn advance_frame(&mut self) {
        self.current_frame += 1;
    }

    /// 32-bit digest of the declared schema, embedded in snapshots.
    #[must_use]
    pub fn schema_digest(&self) -> u32 {
        self.schema_digest
    }

    /// Digest over the sorted `(name, row_size, capacity)` declaration list.
    fn compute_schema_digest(&self) -> u32 {
        let mut entries: Vec<(&'static str, usize, usize)> = self
            .tables
            .iter()
            .map(|t| (t.name(), t.row_size(), t.capacity()))
            .collect();
        entries.sort_unstable();
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"tempo:schema:v1");
        for (name, row_size, capacity) in entries {
            hasher.update(&(name.len() as u64).to_le_bytes());
            hasher.update(name.as_bytes());
            hasher.update(&(row_size as u64).to_le_bytes());
            hasher.update(&(capacity as u64).to_le_bytes());
        }
        let digest = hasher.finalize();
        let b = digest.as_bytes();
        u32::from_le_bytes([b[0], b[1], b[2], b[3]])
    }

    pub(crate) fn tables(&self) -> &[Box<dyn AnyTable>] {
        &self.tables
    }

    pub(crate) fn tables_mut(&mut self) -> &mut [Box<dyn AnyTable>] {
        &mut self.tables
    }

    /// Engage or release the structural guard on every table.
    pub(crate) fn set_structural_lock(&mut self, frame: Option<u64>) {
        for t in &mut self.tables {
            t.set_structural_lock(frame);
        }
    }

    /// Play back every table's command buffer in declared order.
    pub(crate) fn apply_commands(&mut self) -> Result<(), TableError> {
        for t in &mut self.tables {
            t.apply_commands()?;
        }
        Ok(())
    }

    /// Rebuild the spatial indices that lag their rows. Structural changes,
    /// mutable row access, and snapshot restore all flag a table; an
    /// untouched table keeps last frame's index, which still matches its
    /// rows exactly.
    pub(crate) fn rebuild_spatial_indices(&mut self) {
        for t in &mut self.tables {
            if t.spatial_is_dirty() {
                t.rebuild_spatial_index();
            }
        }
    }

    /// Mark every spatial index dirty (after a snapshot restore).
    pub(crate) fn mark_derived_dirty(&mut self) {
        for t in &mut self.tables {
            t.mark_spatial_dirty();
        }
    }

    /// Reset every table and return to frame zero; singletons are
    /// re-allocated so their rows exist with defaults.
    pub fn reset(&mut self) {
        for t in &mut self.tables {
            t.reset();
        }
        for index in self.singleton_indices.clone() {
            self.tables[index].ensure_singleton();
        }
        self.current_frame = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::KindId;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Counter {
        value: i64,
    }

    impl Row for Counter {
        const NAME: &'static str = "counter";
        const KIND: KindId = 91;
    }

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Marker {
        value: i64,
    }

    impl Row for Marker {
        const NAME: &'static str = "marker";
        const KIND: KindId = 92;
    }

    #[test]
    fn singleton_is_auto_allocated_with_defaults() {
        let mut builder = WorldBuilder::new();
        let _key = builder.register_singleton::<Counter>();
        let world = builder.build();
        assert_eq!(world.singleton::<Counter>().value, 0);
        assert_eq!(world.table::<Counter>().count(), 1);
    }

    #[test]
    fn schema_digest_is_order_insensitive_but_shape_sensitive() {
        let mut a = WorldBuilder::new();
        a.register::<Counter>(4, None, Eviction::None);
        a.register::<Marker>(8, None, Eviction::None);
        let da = a.build().schema_digest();

        let mut b = WorldBuilder::new();
        b.register::<Marker>(8, None, Eviction::None);
        b.register::<Counter>(4, None, Eviction::None);
        let db = b.build().schema_digest();
        assert_eq!(da, db, "digest sorts the declaration list");

        let mut c = WorldBuilder::new();
        c.register::<Counter>(5, None, Eviction::None);
        c.register::<Marker>(8, None, Eviction::None);
        let dc = c.build().schema_digest();
        assert_ne!(da, dc, "capacity change must change the digest");
    }

    #[test]
    #[should_panic(expected = "duplicate table registration")]
    fn duplicate_registration_is_fatal() {
        let mut builder = WorldBuilder::new();
        builder.register::<Counter>(4, None, Eviction::None);
        builder.register::<Counter>(4, None, Eviction::None);
    }

    #[test]
    fn typed_key_reaches_the_same_table() {
        let mut builder = WorldBuilder::new();
        let key = builder.register::<Counter>(4, None, Eviction::None);
        let mut world = builder.build();
        assert!(world.table_by_key_mut(key).allocate().is_ok());
        assert_eq!(world.table::<Counter>().count(), 1);
    }

    #[test]
    fn reset_returns_to_frame_zero_with_singletons() {
        let mut builder = WorldBuilder::new();
        builder.register_singleton::<Counter>();
        let mut world = builder.build();
        world.singleton_mut::<Counter>().value = 9;
        world.advance_frame();
        world.reset();
        assert_eq!(world.current_frame(), 0);
        assert_eq!(world.singleton::<Counter>().value, 0);
    }
}
