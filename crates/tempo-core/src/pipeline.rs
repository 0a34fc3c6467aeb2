// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>

//! System pipeline: a statically ordered list of systems with
//! structural-change playback between them.
//!
//! One tick:
//! 1. the caller gathers confirmed-or-predicted inputs for the frame,
//! 2. each system runs in declared order; after each system every table's
//!    command buffer is played back so the next system sees densely packed
//!    rows,
//! 3. spatial indices that lag their rows are rebuilt,
//! 4. the frame counter advances and the frame hash is computed.
//!
//! While a system runs, every table is structurally locked: a direct
//! `allocate`/`free` is a fatal assertion carrying the frame number.
//! Systems mutate row fields in place and enqueue spawns/despawns.

use crate::hash::world_hash;
use crate::input::FrameInputs;
use crate::table::TableError;
use crate::world::World;

/// A simulation system: a pure function of world state and frame inputs.
pub type SystemFn = fn(&mut World, &FrameInputs);

struct SystemDesc {
    name: &'static str,
    run: SystemFn,
}

/// Ordered system list.
#[derive(Default)]
pub struct Pipeline {
    systems: Vec<SystemDesc>,
}

impl Pipeline {
    /// Empty pipeline.
    #[must_use]
    pub fn new() -> Self {
        Self {
            systems: Vec::new(),
        }
    }

    /// Append a system; declaration order is execution order.
    pub fn register_system(&mut self, name: &'static str, run: SystemFn) {
        debug_assert!(
            !self.systems.iter().any(|s| s.name == name),
            "duplicate system name `{name}`"
        );
        self.systems.push(SystemDesc { name, run });
    }

    /// Declared system names, in execution order.
    #[must_use]
    pub fn system_names(&self) -> Vec<&'static str> {
        self.systems.iter().map(|s| s.name).collect()
    }

    /// Execute one tick. On success the world's frame counter has advanced
    /// and the returned value is the frame hash.
    ///
    /// # Errors
    ///
    /// Fails with [`TableError::Full`] when a queued spawn overflows its
    /// table during playback.
    pub fn tick(
        &self,
        world: &mut World,
        inputs: &FrameInputs,
        scratch: &mut Vec<u8>,
    ) -> Result<u64, TableError> {
        let frame = world.current_frame();
        for system in &self.systems {
            world.set_structural_lock(Some(frame));
            (system.run)(world, inputs);
            world.set_structural_lock(None);
            world.apply_commands()?;
        }
        world.rebuild_spatial_indices();
        world.advance_frame();
        Ok(world_hash(world, scratch))
    }

    /// Execute one tick in per-system hash mode: the frame hash is computed
    /// after every system, producing a vector indexed by system order. Slow;
    /// engaged only while resimulating a previously diverged frame.
    ///
    /// # Errors
    ///
    /// Same as [`Pipeline::tick`].
    pub fn tick_per_system(
        &self,
        world: &mut World,
        inputs: &FrameInputs,
        scratch: &mut Vec<u8>,
    ) -> Result<(u64, Vec<u64>), TableError> {
        let frame = world.current_frame();
        let mut per_system = Vec::with_capacity(self.systems.len());
        for system in &self.systems {
            world.set_structural_lock(Some(frame));
            (system.run)(world, inputs);
            world.set_structural_lock(None);
            world.apply_commands()?;
            per_system.push(world_hash(world, scratch));
        }
        world.rebuild_spatial_indices();
        world.advance_frame();
        Ok((world_hash(world, scratch), per_system))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::KindId;
    use crate::input::FrameInputs;
    use crate::table::{Eviction, Row};
    use crate::world::WorldBuilder;
    use bytemuck::{Pod, Zeroable};

    #[repr(C)]
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
    struct Tick {
        total: i64,
    }

    impl Row for Tick {
        const NAME: &'static str = "tick";
        const KIND: KindId = 95;
    }

    fn bump(world: &mut World, _inputs: &FrameInputs) {
        world.singleton_mut::<Tick>().total += 1;
    }

    fn spawn_one(world: &mut World, _inputs: &FrameInputs) {
        world.table_mut::<Tick>().queue_spawn(Tick { total: 0 });
    }

    #[test]
    fn tick_runs_systems_in_order_and_advances() {
        let mut b = WorldBuilder::new();
        b.register_singleton::<Tick>();
        let mut world = b.build();

        let mut pipeline = Pipeline::new();
        pipeline.register_system("bump", bump);

        let mut scratch = Vec::new();
        let inputs = FrameInputs::default();
        assert!(pipeline.tick(&mut world, &inputs, &mut scratch).is_ok());
        assert_eq!(world.current_frame(), 1);
        assert_eq!(world.singleton::<Tick>().total, 1);
    }

    #[test]
    fn structural_playback_runs_between_systems() {
        // `spawn_one` queues; the following system must observe the row.
        fn expects_row(world: &mut World, _inputs: &FrameInputs) {
            assert_eq!(world.table::<Tick>().count(), 1);
        }

        let mut b = WorldBuilder::new();
        b.register::<Tick>(4, None, Eviction::None);
        let mut world = b.build();

        let mut pipeline = Pipeline::new();
        pipeline.register_system("spawn", spawn_one);
        pipeline.register_system("expects_row", expects_row);

        let mut scratch = Vec::new();
        let inputs = FrameInputs::default();
        assert!(pipeline.tick(&mut world, &inputs, &mut scratch).is_ok());
    }

    #[test]
    fn per_system_mode_hashes_after_each_system() {
        let mut b = WorldBuilder::new();
        b.register_singleton::<Tick>();
        let mut world = b.build();

        let mut pipeline = Pipeline::new();
        pipeline.register_system("bump", bump);
        pipeline.register_system("bump_again", |w, _| {
            w.singleton_mut::<Tick>().total += 10;
        });

        let mut scratch = Vec::new();
        let inputs = FrameInputs::default();
        let Ok((frame_hash, per_system)) =
            pipeline.tick_per_system(&mut world, &inputs, &mut scratch)
        else {
            unreachable!("tick failed")
        };
        assert_eq!(per_system.len(), 2);
        assert_ne!(per_system[0], per_system[1]);
        // The last per-system hash differs from the frame hash only by the
        // frame-counter advance.
        assert_ne!(per_system[1], frame_hash);
    }

    #[test]
    fn tick_rebuilds_indices_flagged_by_row_mutation() {
        use crate::math::{Fixed, Fixed2};
        use crate::table::{GridSpec, SpatialSpec};

        #[repr(C)]
        #[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
        struct Mover {
            pos: Fixed2,
        }

        impl Row for Mover {
            const NAME: &'static str = "mover";
            const KIND: KindId = 98;

            fn position(&self) -> Option<Fixed2> {
                Some(self.pos)
            }
        }

        fn shift_right(world: &mut World, _inputs: &FrameInputs) {
            for row in world.table_mut::<Mover>().rows_mut() {
                row.pos = row.pos + Fixed2::from_ints(10, 0);
            }
        }

        let mut b = WorldBuilder::new();
        b.register::<Mover>(
            4,
            Some(SpatialSpec::Single(GridSpec {
                cell_size: Fixed::from_int(4),
                grid_size: 32,
            })),
            Eviction::None,
        );
        let mut world = b.build();
        assert!(world.table_mut::<Mover>().allocate().is_ok());
        world.table_mut::<Mover>().rebuild_spatial_index();

        let mut pipeline = Pipeline::new();
        pipeline.register_system("shift_right", shift_right);

        let mut scratch = Vec::new();
        let inputs = FrameInputs::default();
        assert!(pipeline.tick(&mut world, &inputs, &mut scratch).is_ok());

        // The mutation flagged the index and the tick rebuilt it: a query
        // at the new position must land on the moved row.
        let table = world.table::<Mover>();
        assert!(!table.spatial_is_dirty(), "tick must leave the index clean");
        let mut out = [0_u32; 4];
        let got = table.query_radius(Fixed2::from_ints(10, 0), Fixed::from_int(1), &mut out);
        assert_eq!(got.count, 1);
        assert_eq!(out[0], 0);
    }

    #[test]
    fn overflowing_spawn_surfaces_from_tick() {
        let mut b = WorldBuilder::new();
        b.register::<Tick>(1, None, Eviction::None);
        let mut world = b.build();

        let mut pipeline = Pipeline::new();
        pipeline.register_system("spawn", spawn_one);

        let mut scratch = Vec::new();
        let inputs = FrameInputs::default();
        assert!(pipeline.tick(&mut world, &inputs, &mut scratch).is_ok());
        let second = pipeline.tick(&mut world, &inputs, &mut scratch);
        assert_eq!(second, Err(TableError::Full("tick")));
    }
}
